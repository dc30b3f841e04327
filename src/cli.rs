//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resilient client for Telegram mini-app backends
#[derive(Parser, Debug)]
#[command(name = "miniapp-net")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MINIAPP_NET_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Backend origin, overriding the config file
    #[arg(long, env = "MINIAPP_NET_BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// Telegram user id, overriding the config file
    #[arg(long, global = true)]
    pub user_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "warn",
        env = "MINIAPP_NET_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MINIAPP_NET_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Issue one request and print the JSON response
    Request {
        /// Endpoint, relative to the API namespace, or an absolute URL
        endpoint: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// JSON body
        #[arg(short, long)]
        data: Option<String>,

        /// Extra header as `name:value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Print failures as the normalized error object instead of exiting non-zero
        #[arg(long)]
        suppress_errors: bool,

        /// Skip the readiness probe
        #[arg(long)]
        skip_health_check: bool,

        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Probe backend health once
    Health,

    /// Run the connectivity self-test
    SelfTest {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the effective configuration and a state snapshot
    Diagnostics,
}

/// Split `name:value`
#[must_use]
pub fn parse_header(raw: &str) -> Option<(String, String)> {
    let (name, value) = raw.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_subcommand() {
        let cli = Cli::try_parse_from([
            "miniapp-net",
            "--base-url",
            "https://api.example.com",
            "request",
            "user/42",
            "-X",
            "POST",
            "-d",
            r#"{"a":1}"#,
            "-H",
            "X-Trace: abc",
        ])
        .unwrap();

        assert_eq!(cli.base_url.as_deref(), Some("https://api.example.com"));
        match cli.command {
            Command::Request {
                endpoint,
                method,
                data,
                headers,
                ..
            } => {
                assert_eq!(endpoint, "user/42");
                assert_eq!(method, "POST");
                assert_eq!(data.as_deref(), Some(r#"{"a":1}"#));
                assert_eq!(headers, vec!["X-Trace: abc".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn header_parsing() {
        assert_eq!(
            parse_header("X-Trace: abc"),
            Some(("X-Trace".to_string(), "abc".to_string()))
        );
        assert_eq!(parse_header("novalue"), None);
        assert_eq!(parse_header(": x"), None);
    }
}
