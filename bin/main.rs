use std::process::ExitCode;
use http::header::{HeaderValue, AUTHORIZATION, PROXY_AUTHORIZATION};
use http::{Method, Uri};
use log::{error, info, LevelFilter};
use proxyauth::authentication::basic;
use proxyauth::flow::{ClientConnection, Flow, Request};
use proxyauth::log_utils;
use proxyauth::proxy_auth::ProxyAuth;
use proxyauth::settings::{ProxyMode, Settings};

const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

const VERSION_PARAM_NAME: &str = "v_e_r_s_i_o_n";
const LOG_LEVEL_PARAM_NAME: &str = "log_level";
const SETTINGS_PARAM_NAME: &str = "settings";
const MODE_PARAM_NAME: &str = "mode";
const PROXYAUTH_PARAM_NAME: &str = "proxyauth";
const TOKEN_PARAM_NAME: &str = "token";
const USERNAME_PARAM_NAME: &str = "username";
const PASSWORD_PARAM_NAME: &str = "password";

const EXIT_REJECTED: u8 = 1;
const EXIT_CONFIGURATION: u8 = 2;

fn main() -> ExitCode {
    let args = clap::Command::new("Proxy authentication check")
        .args(&[
            clap::Arg::new(VERSION_PARAM_NAME)
                .short('v')
                .long("version")
                .action(clap::ArgAction::SetTrue)
                .help("Print the version of this software and exit"),
            clap::Arg::new(LOG_LEVEL_PARAM_NAME)
                .short('l')
                .long("loglvl")
                .action(clap::ArgAction::Set)
                .value_parser(["info", "debug", "trace"])
                .default_value("info")
                .help("Logging level"),
            clap::Arg::new(SETTINGS_PARAM_NAME)
                .short('s')
                .long("settings")
                .action(clap::ArgAction::Set)
                .conflicts_with_all([MODE_PARAM_NAME, PROXYAUTH_PARAM_NAME])
                .help("Path to a TOML settings file"),
            clap::Arg::new(MODE_PARAM_NAME)
                .short('m')
                .long("mode")
                .action(clap::ArgAction::Set)
                .default_value("regular")
                .help("Proxy mode: regular, reverse[:<upstream>], transparent or socks5"),
            clap::Arg::new(PROXYAUTH_PARAM_NAME)
                .long("proxyauth")
                .action(clap::ArgAction::Set)
                .help("Authentication backend: any, <user>:<pass>, @<htpasswd path> or ldap[s]:<server>:<dn template>:<filter>"),
            clap::Arg::new(TOKEN_PARAM_NAME)
                .short('t')
                .long("token")
                .action(clap::ArgAction::Set)
                .conflicts_with(USERNAME_PARAM_NAME)
                .help("Raw credential header value, e.g. `Basic dGVzdDp0ZXN0`"),
            clap::Arg::new(USERNAME_PARAM_NAME)
                .action(clap::ArgAction::Set)
                .requires(PASSWORD_PARAM_NAME)
                .help("Username to check"),
            clap::Arg::new(PASSWORD_PARAM_NAME)
                .action(clap::ArgAction::Set)
                .help("Password to check"),
        ])
        .disable_version_flag(true)
        .get_matches();

    if Some(true) == args.get_one::<bool>(VERSION_PARAM_NAME).copied() {
        println!("{}", VERSION_STRING);
        return ExitCode::SUCCESS;
    }

    if log::set_logger(log_utils::make_stdout_logger()).is_err() {
        eprintln!("Couldn't set logger");
    }
    log::set_max_level(
        match args.get_one::<String>(LOG_LEVEL_PARAM_NAME).map(String::as_str) {
            Some("debug") => LevelFilter::Debug,
            Some("trace") => LevelFilter::Trace,
            _ => LevelFilter::Info,
        },
    );

    let settings = match load_settings(&args) {
        Ok(x) => x,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };
    let auth = match ProxyAuth::from_settings(&settings) {
        Ok(x) => x,
        Err(e) => {
            error!("Invalid proxy authentication configuration: {}", e);
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };

    let token = args.get_one::<String>(TOKEN_PARAM_NAME).cloned().or_else(|| {
        let username = args.get_one::<String>(USERNAME_PARAM_NAME)?;
        let password = args.get_one::<String>(PASSWORD_PARAM_NAME).map(String::as_str).unwrap_or("");
        Some(basic::mkauth(username, password))
    });

    let mut flow = Flow::new(
        ClientConnection::new(),
        Request::new(Method::GET, Uri::from_static("http://example.com/")),
    );
    if let Some(token) = token {
        let value = match HeaderValue::from_str(&token) {
            Ok(x) => x,
            Err(_) => {
                error!("Token is not a valid header value");
                return ExitCode::from(EXIT_REJECTED);
            }
        };
        let header = match settings.mode() {
            ProxyMode::Reverse => AUTHORIZATION,
            _ => PROXY_AUTHORIZATION,
        };
        flow.request.headers.insert(header, value);
    }

    auth.on_request_headers(&mut flow);
    match flow.response {
        None => {
            match ProxyAuth::accepted_identity(&flow) {
                Some(x) => info!("Accepted: {}", x.username),
                None => info!("Accepted: authentication is disabled"),
            }
            ExitCode::SUCCESS
        }
        Some(response) => {
            info!("Rejected with {}", response.status);
            ExitCode::from(EXIT_REJECTED)
        }
    }
}

fn load_settings(args: &clap::ArgMatches) -> Result<Settings, String> {
    if let Some(path) = args.get_one::<String>(SETTINGS_PARAM_NAME) {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Couldn't read the settings file {}: {}", path, e))?;
        return toml::from_str(&content)
            .map_err(|e| format!("Couldn't parse the settings file {}: {}", path, e));
    }

    let mode: ProxyMode = args.get_one::<String>(MODE_PARAM_NAME)
        .map(|x| x.parse::<ProxyMode>())
        .transpose()
        .map_err(|e| e.to_string())?
        .unwrap_or_default();
    let mut builder = Settings::builder().mode(mode);
    if let Some(x) = args.get_one::<String>(PROXYAUTH_PARAM_NAME) {
        builder = builder.proxyauth(x.as_str());
    }
    builder.build().map_err(|e| e.to_string())
}
