//! miniapp-net - resilient client for Telegram mini-app backends

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use reqwest::Method;
use tracing::{error, info};

use miniapp_net::{
    ClientConfig, NetworkClient, RequestOptions,
    cli::{Cli, Command, parse_header},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config =
        ClientConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    if let Some(user_id) = cli.user_id {
        config.user_id = Some(user_id);
    }

    let client = NetworkClient::new(config).context("Failed to create client")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        base_url = %client.config().base_url,
        deployment = ?client.deployment(),
        "Client created"
    );

    match cli.command {
        Command::Request {
            endpoint,
            method,
            data,
            headers,
            suppress_errors,
            skip_health_check,
            timeout_ms,
        } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method '{method}'"))?;
            let body: Option<serde_json::Value> = data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Request body is not valid JSON")?;

            let mut options = RequestOptions {
                suppress_errors,
                skip_health_check,
                timeout: timeout_ms.map(Duration::from_millis),
                ..RequestOptions::default()
            };
            for raw in &headers {
                let Some((name, value)) = parse_header(raw) else {
                    bail!("Invalid header '{raw}', expected name:value");
                };
                options.headers.insert(name, value);
            }

            let value = client.request(endpoint.as_str(), method, body, options).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }

        Command::Health => {
            let ready = client.ensure_ready().await;
            println!("{}", serde_json::to_string_pretty(&client.health())?);
            match ready {
                Ok(true) => Ok(ExitCode::SUCCESS),
                Ok(false) => {
                    eprintln!("⚠️  Backend did not answer; production fallback active");
                    Ok(ExitCode::FAILURE)
                }
                Err(e) => {
                    eprintln!("❌ {}", e.user_message(client.deployment()));
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Command::SelfTest { format } => {
            let report = client.run_self_test().await;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Self-test against {} ({:?}), {}ms\n",
                    report.base_url, report.deployment, report.total_ms
                );
                if !report.online {
                    println!("  ❌ offline");
                }
                for probe in &report.probes {
                    let mark = if probe.passed { "✅" } else { "❌" };
                    let status = probe
                        .status
                        .map_or_else(|| "-".to_string(), |s| s.to_string());
                    print!(
                        "  {mark} {:<9} {status:>4} {:>6}ms  {}",
                        probe.name, probe.duration_ms, probe.url
                    );
                    if let Some(error) = &probe.error {
                        print!("  ({error})");
                    }
                    println!();
                }
            }
            Ok(if report.all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Command::Diagnostics => {
            let snapshot = serde_json::json!({
                "config": client.config(),
                "state": client.diagnostics(),
            });
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
