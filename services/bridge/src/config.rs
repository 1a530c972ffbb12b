//! Bridge configuration.
//!
//! Three layers, highest priority first: command-line flags, environment
//! variables, then an optional `.env` file. `dotenvy` only fills variables
//! that are not already set, which gives the `.env` layer its place at the
//! bottom.
//!
//! # Environment
//! - `ERSSI_URL` — upstream WebSocket URL (required)
//! - `ERSSI_PASSWORD` — shared upstream password; empty disables frame
//!   encryption
//! - `LISTEN_ADDR` — downstream bind address (default `127.0.0.1:9000`)
//! - `VERBOSE` — enable debug logging

use clap::Parser;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9000";

#[derive(Debug, Parser)]
#[command(name = "erssi-bridge", about = "WeeChat relay bridge for erssi")]
pub struct Cli {
    /// Upstream WebSocket URL, e.g. wss://irc.example.org:8443/
    #[arg(long = "erssi")]
    pub erssi: Option<String>,
    /// Shared upstream password.
    #[arg(long = "password")]
    pub password: Option<String>,
    /// Downstream listen address, host:port.
    #[arg(long = "listen")]
    pub listen: Option<String>,
    /// Debug logging.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_url: String,
    pub password: String,
    pub listen_addr: String,
    pub verbose: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

impl Config {
    /// Load from flags, environment, and `.env`.
    pub fn load() -> Result<Config, ConfigError> {
        dotenvy::dotenv().ok();
        Self::resolve(Cli::parse(), |name| std::env::var(name).ok())
    }

    /// Pure resolution step, separated for tests.
    fn resolve(cli: Cli, env: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let upstream_url = cli
            .erssi
            .or_else(|| env("ERSSI_URL"))
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("ERSSI_URL"))?;
        let password = cli
            .password
            .or_else(|| env("ERSSI_PASSWORD"))
            .unwrap_or_default();
        let listen_addr = cli
            .listen
            .or_else(|| env("LISTEN_ADDR"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_owned());
        let verbose = cli.verbose || env("VERBOSE").is_some_and(|v| truthy(&v));
        Ok(Config {
            upstream_url,
            password,
            listen_addr,
            verbose,
        })
    }
}

fn truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes" | "on")
}
