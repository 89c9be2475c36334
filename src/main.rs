//! account-probe: MetaTrader account probe over the MetaApi cloud
//!
//! Entry point. Loads configuration, initialises structured logging on
//! stderr, resolves the credential and account id, and runs a single
//! probe that prints the balance and open-position count on stdout.
//! Ctrl+C cancels the run.

use clap::Parser;
use std::io::Write;
use std::process::ExitCode;
use tracing::info;

use account_probe::config::{CliArgs, Provider};
use account_probe::engine::{AccountProbe, ProbeSettings};
use account_probe::platforms;
use account_probe::types::ProbeError;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let args = CliArgs::parse();
    init_logging();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_failure(&e, &mut std::io::stderr());
            ExitCode::from(e.exit_code())
        }
    }
}

/// Print the failure once. The subscriber shares stderr, so no log event
/// repeats it.
fn report_failure(err: &ProbeError, out: &mut impl Write) {
    let _ = writeln!(out, "Error: {err}");
}

async fn run(args: CliArgs) -> Result<(), ProbeError> {
    let cfg = args
        .load_config()
        .map_err(|e| ProbeError::Config(format!("{e:#}")))?;

    let account_id = cfg.resolve_account_id()?;
    let settings = ProbeSettings::from_config(&cfg);

    info!(
        provider = match cfg.metaapi.provider {
            Provider::MetaApi => "metaapi",
            Provider::Simulated => "simulated",
        },
        account_id = %account_id,
        sync_timeout_secs = cfg.probe.sync_timeout_secs,
        history_days = cfg.probe.history_days,
        "account-probe starting"
    );

    let api = platforms::build_api(&cfg)?;
    let probe = AccountProbe::new(account_id, settings);

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler available: never cancel.
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received.");
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    probe.execute(api.as_ref(), &mut out, shutdown).await?;
    Ok(())
}

/// Initialise the `tracing` subscriber. Logs go to stderr so stdout carries
/// only the report.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("account_probe=info"));

    let json_logging = std::env::var("PROBE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reported_once() {
        let err = ProbeError::Connection("broker offline".to_string());
        let mut out = Vec::new();
        report_failure(&err, &mut out);

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "Error: Connection error: broker offline\n");
        assert_eq!(text.matches("broker offline").count(), 1);
    }
}
