//! [The basic authentication scheme](https://datatracker.ietf.org/doc/html/rfc7617)
//! token codec

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine;
use crate::authentication::Credential;


/// The only scheme the decoder accepts (compared case-insensitively)
pub const BASIC_SCHEME: &str = "basic";

const CANONICAL_BASIC_SCHEME: &str = "Basic";


#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The token is not a `<scheme> <payload>` pair
    #[error("malformed authorization token")]
    MalformedToken,
    /// The scheme is not Basic
    #[error("unsupported authorization scheme: {0}")]
    UnsupportedScheme(String),
    /// The payload is not a base64 encoded `user:password` pair
    #[error("malformed authorization payload: {0}")]
    MalformedPayload(String),
}


/// Build a `<scheme> <base64(username:password)>` token.
/// The Basic scheme is emitted in its canonical spelling, any other one is emitted as is.
pub fn encode(scheme: &str, username: &str, password: &str) -> String {
    let scheme = if scheme.eq_ignore_ascii_case(BASIC_SCHEME) {
        CANONICAL_BASIC_SCHEME
    } else {
        scheme
    };
    format!("{} {}", scheme, BASE64_ENGINE.encode(format!("{}:{}", username, password)))
}

/// Build a Basic scheme token
pub fn mkauth(username: &str, password: &str) -> String {
    encode(BASIC_SCHEME, username, password)
}

/// Parse a Basic scheme token into the credential it carries
pub fn decode(token: &str) -> Result<Credential, CodecError> {
    let mut parts = token.split_whitespace();
    let (scheme, payload) = match (parts.next(), parts.next(), parts.next()) {
        (Some(s), Some(p), None) => (s, p),
        _ => return Err(CodecError::MalformedToken),
    };

    if !scheme.eq_ignore_ascii_case(BASIC_SCHEME) {
        return Err(CodecError::UnsupportedScheme(scheme.to_string()));
    }

    let decoded = BASE64_ENGINE.decode(payload)
        .map_err(|e| CodecError::MalformedPayload(e.to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| CodecError::MalformedPayload(e.to_string()))?;

    let mut pair = decoded.split(':');
    match (pair.next(), pair.next(), pair.next()) {
        (Some(username), Some(password), None) => Ok(Credential::new(username, password)),
        _ => Err(CodecError::MalformedPayload("expected exactly one `:` separator".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_what_was_encoded() {
        for (u, p) in [("test", "test"), ("", ""), ("user", ""), ("ünïcödé", "pässwörd")] {
            assert_eq!(Ok(Credential::new(u, p)), decode(&encode("basic", u, p)));
        }
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let payload = BASE64_ENGINE.encode("foo:bar");
        for scheme in ["basic", "Basic", "BASIC", "bAsIc"] {
            assert_eq!(Ok(Credential::new("foo", "bar")), decode(&format!("{} {}", scheme, payload)));
        }
    }

    #[test]
    fn encodes_canonical_scheme() {
        assert_eq!("Basic dGVzdDp0ZXN0", mkauth("test", "test"));
        assert_eq!("Basic dGVzdDp0ZXN0", encode("BASIC", "test", "test"));
        assert_eq!("unknown dGVzdDp0ZXN0", encode("unknown", "test", "test"));
    }

    #[test]
    fn rejects_token_without_payload() {
        assert_eq!(Err(CodecError::MalformedToken), decode(""));
        assert_eq!(Err(CodecError::MalformedToken), decode("invalid"));
        assert_eq!(Err(CodecError::MalformedToken), decode("basic a b"));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert_eq!(Err(CodecError::UnsupportedScheme("foo".to_string())), decode("foo bar"));
        assert!(matches!(
            decode(&encode("unknown", "test", "test")),
            Err(CodecError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn rejects_bad_payload() {
        assert!(matches!(decode("basic abc"), Err(CodecError::MalformedPayload(_))));
        // a line-oriented encoder leaves a trailing newline
        assert!(matches!(decode("basic Zm9v\n"), Err(CodecError::MalformedPayload(_))));
        let two_colons = BASE64_ENGINE.encode("a:b:c");
        assert!(matches!(decode(&format!("basic {}", two_colons)), Err(CodecError::MalformedPayload(_))));
        let not_utf8 = BASE64_ENGINE.encode([0xff, b':', 0xfe]);
        assert!(matches!(decode(&format!("basic {}", not_utf8)), Err(CodecError::MalformedPayload(_))));
    }
}
