use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::io;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use crate::authentication::{BackendError, Credential};


const APR1_MAGIC: &str = "$apr1$";
const MD5_CRYPT_MAGIC: &str = "$1$";
const SHA256_CRYPT_MAGIC: &str = "$5$";
const SHA512_CRYPT_MAGIC: &str = "$6$";
const SHA1_PREFIX: &str = "{SHA}";
const BCRYPT_PREFIXES: [&str; 4] = ["$2a$", "$2b$", "$2x$", "$2y$"];
const MD5_CRYPT_SALT_MAX_LEN: usize = 8;
const MD5_CRYPT_DIGEST_LEN: usize = 22;
const MD5_CRYPT_ROUNDS: usize = 1000;
const SHA_CRYPT_SALT_MAX_LEN: usize = 16;
const SHA256_CRYPT_DIGEST_LEN: usize = 43;
const SHA512_CRYPT_DIGEST_LEN: usize = 86;
const DES_CRYPT_LEN: usize = 13;
const CRYPT_ALPHABET: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";


/// The backend reading the credentials from an Apache htpasswd file.
/// Each non-empty line except `#` comments must be a `<user>:<hash>` record.
/// The file is read once, on construction.
pub struct PasswordFile {
    path: PathBuf,
    records: HashMap<String, Record>,
}

#[derive(Clone, PartialEq)]
enum Record {
    /// `$apr1$<salt>$<digest>` and `$1$<salt>$<digest>`
    Md5Crypt { magic: &'static str, salt: String, digest: String },
    /// `$5$[rounds=<n>$]<salt>$<digest>`
    Sha256Crypt(String),
    /// `$6$[rounds=<n>$]<salt>$<digest>`
    Sha512Crypt(String),
    /// Traditional 13 character crypt: 2 salt characters and the digest
    DesCrypt(String),
    /// `{SHA}<base64 of SHA-1>`
    Sha1(Vec<u8>),
    /// `$2y$<cost>$<salt+digest>` and the other bcrypt flavors
    Bcrypt(String),
    Plain(String),
}

impl PasswordFile {
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let records = Self::parse(BufReader::new(File::open(path)?))?;
        if records.is_empty() {
            return Err(io::Error::new(ErrorKind::InvalidData, "No credential records found"));
        }

        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    fn parse<R: BufRead>(mut reader: R) -> io::Result<HashMap<String, Record>> {
        let mut records = HashMap::new();

        let mut line = String::with_capacity(128);
        let mut line_no = 0;
        loop {
            line.clear();
            let n = reader.read_line(&mut line)
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
            if n == 0 {
                break; // EOF
            }
            line_no += 1;

            let record = line.trim();
            if record.is_empty() || record.starts_with('#') {
                continue;
            }

            let (user, hash) = match record.split_once(':') {
                Some((u, h)) if !u.is_empty() => (u, h),
                _ => return Err(io::Error::new(
                    ErrorKind::InvalidData, format!("Malformed record on line {}", line_no),
                )),
            };

            let record = Record::parse(hash).ok_or_else(|| io::Error::new(
                ErrorKind::InvalidData, format!("Malformed password hash on line {}", line_no),
            ))?;
            if records.insert(user.to_string(), record).is_some() {
                return Err(io::Error::new(
                    ErrorKind::InvalidData, format!("Duplicated user on line {}", line_no),
                ));
            }
        }

        Ok(records)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains_user(&self, username: &str) -> bool {
        self.records.contains_key(username)
    }

    /// Re-derive the hash of the password using the record's algorithm and compare
    pub fn validate(&self, credential: &Credential) -> Result<bool, BackendError> {
        let record = match self.records.get(&credential.username) {
            Some(x) => x,
            None => return Ok(false),
        };

        let password = credential.password.as_bytes();
        match record {
            Record::Md5Crypt { magic, salt, digest } => {
                let derived = md5_crypt_digest(magic, password, salt.as_bytes());
                Ok(bool::from(derived.as_bytes().ct_eq(digest.as_bytes())))
            }
            Record::Sha256Crypt(hash) => Ok(pwhash::sha256_crypt::verify(password, hash)),
            Record::Sha512Crypt(hash) => Ok(pwhash::sha512_crypt::verify(password, hash)),
            Record::DesCrypt(hash) => Ok(pwhash::unix_crypt::verify(password, hash)),
            Record::Sha1(digest) => {
                let derived = Sha1::digest(password);
                Ok(bool::from(derived.as_slice().ct_eq(digest.as_slice())))
            }
            Record::Bcrypt(hash) => bcrypt::verify(password, hash)
                .map_err(|e| BackendError::PasswordRecord {
                    username: credential.username.clone(),
                    reason: e.to_string(),
                }),
            Record::Plain(x) => Ok(bool::from(x.as_bytes().ct_eq(password))),
        }
    }
}

impl Debug for PasswordFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordFile")
            .field("path", &self.path)
            .field("users", &self.records.len())
            .finish()
    }
}

impl Record {
    /// Recognize the hash format. `None` means a hash this file can't hold:
    /// a malformed one or a `$...$` / `{...}` scheme that isn't supported.
    fn parse(hash: &str) -> Option<Self> {
        for magic in [APR1_MAGIC, MD5_CRYPT_MAGIC] {
            if let Some(x) = hash.strip_prefix(magic) {
                let (salt, digest) = x.split_once('$')?;
                if salt.is_empty() || salt.len() > MD5_CRYPT_SALT_MAX_LEN
                    || digest.len() != MD5_CRYPT_DIGEST_LEN || !is_crypt_text(digest) {
                    return None;
                }
                return Some(Record::Md5Crypt { magic, salt: salt.to_string(), digest: digest.to_string() });
            }
        }

        if let Some(x) = hash.strip_prefix(SHA256_CRYPT_MAGIC) {
            is_sha_crypt(x, SHA256_CRYPT_DIGEST_LEN).then(|| Record::Sha256Crypt(hash.to_string()))
        } else if let Some(x) = hash.strip_prefix(SHA512_CRYPT_MAGIC) {
            is_sha_crypt(x, SHA512_CRYPT_DIGEST_LEN).then(|| Record::Sha512Crypt(hash.to_string()))
        } else if BCRYPT_PREFIXES.iter().any(|p| hash.starts_with(p)) {
            Some(Record::Bcrypt(hash.to_string()))
        } else if let Some(x) = hash.strip_prefix(SHA1_PREFIX) {
            BASE64_ENGINE.decode(x).ok()
                .filter(|d| d.len() == Sha1::output_size())
                .map(Record::Sha1)
        } else if hash.starts_with('$') || hash.starts_with('{') {
            None
        } else if hash.len() == DES_CRYPT_LEN && is_crypt_text(hash) {
            Some(Record::DesCrypt(hash.to_string()))
        } else {
            Some(Record::Plain(hash.to_string()))
        }
    }
}

fn is_crypt_text(x: &str) -> bool {
    x.bytes().all(|c| CRYPT_ALPHABET.contains(&c))
}

/// Check the part of a SHA-crypt hash after its magic
fn is_sha_crypt(x: &str, digest_len: usize) -> bool {
    let x = match x.strip_prefix("rounds=") {
        Some(x) => match x.split_once('$') {
            Some((rounds, rest)) if !rounds.is_empty() && rounds.bytes().all(|c| c.is_ascii_digit()) => rest,
            _ => return false,
        },
        None => x,
    };

    match x.split_once('$') {
        Some((salt, digest)) => salt.len() <= SHA_CRYPT_SALT_MAX_LEN
            && digest.len() == digest_len
            && is_crypt_text(digest),
        None => false,
    }
}

/// The MD5-crypt algorithm, `magic` tells the original (`$1$`) and the Apache (`$apr1$`) variants.
/// Returns the digest part of `<magic><salt>$<digest>`.
fn md5_crypt_digest(magic: &str, password: &[u8], salt: &[u8]) -> String {
    let salt = &salt[..salt.len().min(MD5_CRYPT_SALT_MAX_LEN)];

    let alternate = {
        let mut ctx = md5::Context::new();
        ctx.consume(password);
        ctx.consume(salt);
        ctx.consume(password);
        ctx.compute()
    };

    let mut ctx = md5::Context::new();
    ctx.consume(password);
    ctx.consume(magic.as_bytes());
    ctx.consume(salt);
    for chunk in password.chunks(alternate.0.len()) {
        ctx.consume(&alternate.0[..chunk.len()]);
    }
    let mut i = password.len();
    while i > 0 {
        if i & 1 != 0 {
            ctx.consume([0u8]);
        } else {
            ctx.consume(&password[..1]);
        }
        i >>= 1;
    }
    let mut digest = ctx.compute();

    for round in 0..MD5_CRYPT_ROUNDS {
        let mut ctx = md5::Context::new();
        if round & 1 != 0 {
            ctx.consume(password);
        } else {
            ctx.consume(digest.0);
        }
        if round % 3 != 0 {
            ctx.consume(salt);
        }
        if round % 7 != 0 {
            ctx.consume(password);
        }
        if round & 1 != 0 {
            ctx.consume(digest.0);
        } else {
            ctx.consume(password);
        }
        digest = ctx.compute();
    }

    let d = digest.0;
    let mut out = String::with_capacity(MD5_CRYPT_DIGEST_LEN);
    for (a, b, c) in [(0, 6, 12), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)] {
        crypt_base64(&mut out, (u32::from(d[a]) << 16) | (u32::from(d[b]) << 8) | u32::from(d[c]), 4);
    }
    crypt_base64(&mut out, u32::from(d[11]), 2);
    out
}

fn crypt_base64(out: &mut String, mut v: u32, n: usize) {
    for _ in 0..n {
        out.push(char::from(CRYPT_ALPHABET[(v & 0x3f) as usize]));
        v >>= 6;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use super::*;

    const TEST_DATA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/test_data/htpasswd");

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn md5_crypt_matches_reference_vectors() {
        assert_eq!("WI4.YbiJlu537jLGEW2eu1", md5_crypt_digest(APR1_MAGIC, b"test", b"/LkYxy3x"));
        assert_eq!("h9FWgUz3n9YxylKLlR5SQ/", md5_crypt_digest(APR1_MAGIC, b"secret", b"abcdefgh"));
        assert_eq!("tTWg0JeO/sYmHvtKmZE8c.", md5_crypt_digest(MD5_CRYPT_MAGIC, b"test", b"saltsalt"));
    }

    #[test]
    fn validates_test_data() {
        let file = PasswordFile::new(TEST_DATA).unwrap();
        assert!(file.contains_user("test"));
        assert_eq!(Ok(true), file.validate(&Credential::new("test", "test")));
        assert_eq!(Ok(false), file.validate(&Credential::new("test", "foo")));
        assert_eq!(Ok(false), file.validate(&Credential::new("nobody", "test")));
    }

    #[test]
    fn supports_all_hash_formats() {
        let file = PasswordFile::new(TEST_DATA).unwrap();
        assert_eq!(Ok(true), file.validate(&Credential::new("sha", "hunter2")));
        assert_eq!(Ok(false), file.validate(&Credential::new("sha", "hunter3")));
        assert_eq!(Ok(true), file.validate(&Credential::new("bcrypt", "password")));
        assert_eq!(Ok(false), file.validate(&Credential::new("bcrypt", "passw0rd")));
        assert_eq!(Ok(true), file.validate(&Credential::new("plain", "letmein")));
        assert_eq!(Ok(false), file.validate(&Credential::new("plain", "")));
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let file = write_file("# users\n\nalice:$apr1$abcdefgh$h9FWgUz3n9YxylKLlR5SQ/\n");
        let file = PasswordFile::new(file.path()).unwrap();
        assert_eq!(Ok(true), file.validate(&Credential::new("alice", "secret")));
    }

    #[test]
    fn rejects_non_htpasswd_file() {
        let file = write_file("-----BEGIN CERTIFICATE-----\nMIIDXTCCAkWgAwIBAgIJAKZ\n-----END CERTIFICATE-----\n");
        let e = PasswordFile::new(file.path()).unwrap_err();
        assert_eq!(ErrorKind::InvalidData, e.kind());
    }

    #[test]
    fn rejects_empty_file() {
        let file = write_file("# nothing here\n");
        assert!(PasswordFile::new(file.path()).is_err());
    }

    #[test]
    fn rejects_broken_hashes_and_duplicates() {
        assert!(PasswordFile::new(write_file("a:{SHA}not-base64\n").path()).is_err());
        assert!(PasswordFile::new(write_file("a:$apr1$nodigest\n").path()).is_err());
        assert!(PasswordFile::new(write_file("a:$apr1$salt$tooshort\n").path()).is_err());
        assert!(PasswordFile::new(write_file("a:$6$saltsalt$tooshort\n").path()).is_err());
        assert!(PasswordFile::new(write_file("a:x\na:y\n").path()).is_err());
        assert!(PasswordFile::new(write_file(":x\n").path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let e = PasswordFile::new("/nonexistent/htpasswd").unwrap_err();
        assert_eq!(ErrorKind::NotFound, e.kind());
    }

    #[test]
    fn broken_bcrypt_record_is_backend_error() {
        let file = PasswordFile::new(write_file("a:$2y$xx$broken\n").path()).unwrap();
        assert!(matches!(
            file.validate(&Credential::new("a", "b")),
            Err(BackendError::PasswordRecord { .. })
        ));
    }

    #[test]
    fn verifies_crypt_formats() {
        let file = write_file(concat!(
            "md5:$1$saltsalt$tTWg0JeO/sYmHvtKmZE8c.\n",
            "sha256:$5$saltsalt$q6kNPzk9GPb3dpYKO2TUS45z2kiVxsUVz7eWVJcih.0\n",
            "sha512:$6$saltsalt$JcVDtuB6d1BHhCd5RPBh8g8xX/1CbY8EU2PN0MTaj2/Mypw4P./C6dN4j0HALhzBDTocyW1Jm.gYaTPjFGCV40\n",
            "des:abgOeLfPimXQo\n",
        ));
        let file = PasswordFile::new(file.path()).unwrap();
        for user in ["md5", "sha256", "sha512", "des"] {
            assert_eq!(Ok(true), file.validate(&Credential::new(user, "test")), "{}", user);
            assert_eq!(Ok(false), file.validate(&Credential::new(user, "tset")), "{}", user);
        }
    }

    #[test]
    fn stored_hash_is_not_a_password() {
        let records = [
            ("md5", "$1$saltsalt$tTWg0JeO/sYmHvtKmZE8c."),
            ("sha512", "$6$saltsalt$JcVDtuB6d1BHhCd5RPBh8g8xX/1CbY8EU2PN0MTaj2/Mypw4P./C6dN4j0HALhzBDTocyW1Jm.gYaTPjFGCV40"),
            ("des", "abgOeLfPimXQo"),
            ("test", "$apr1$/LkYxy3x$WI4.YbiJlu537jLGEW2eu1"),
        ];
        let content: String = records.iter().map(|(u, h)| format!("{}:{}\n", u, h)).collect();
        let file = PasswordFile::new(write_file(&content).path()).unwrap();
        for (user, hash) in records {
            assert_eq!(Ok(false), file.validate(&Credential::new(user, hash)), "{}", user);
        }
    }

    #[test]
    fn recognizes_sha_crypt_with_rounds() {
        assert!(matches!(
            Record::parse("$5$rounds=5000$saltsalt$q6kNPzk9GPb3dpYKO2TUS45z2kiVxsUVz7eWVJcih.0"),
            Some(Record::Sha256Crypt(_))
        ));
        assert!(Record::parse("$5$rounds=$saltsalt$q6kNPzk9GPb3dpYKO2TUS45z2kiVxsUVz7eWVJcih.0").is_none());
    }

    #[test]
    fn rejects_unsupported_schemes() {
        // yescrypt, Drupal, salted SHA-1
        for hash in ["$y$j9T$F5Jx5fExrKuJdvYKnKQl0/$P6Uq", "$S$DxyzT5", "{SSHA}bm90IGEgcmVhbCBoYXNo"] {
            assert!(Record::parse(hash).is_none(), "{}", hash);
            let e = PasswordFile::new(write_file(&format!("a:{}\n", hash)).path()).unwrap_err();
            assert_eq!(ErrorKind::InvalidData, e.kind());
        }
    }
}
