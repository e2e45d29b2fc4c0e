#[macro_use]
extern crate log;

pub mod authentication;
pub mod cache;
pub mod flow;
pub mod log_utils;
pub mod proxy_auth;
pub mod settings;
