//! AccountProbe: the one-shot resolve → connect → sync → read sequence.
//!
//! Each step maps its failure onto one `ProbeError` variant and aborts the
//! run. Once a connection is open it is always closed before returning,
//! whatever the outcome. Nothing is written to the output unless every step
//! succeeded.

use chrono::Utc;
use std::future::Future;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::platforms::{TradingApi, TradingConnection};
use crate::types::{ProbeError, ProbeReport};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ProbeSettings {
    /// Deadline for the synchronization wait; `None` waits without bound.
    pub sync_timeout: Option<Duration>,
    /// Trailing days of deal history to fetch; `0` skips it.
    pub history_days: u32,
    /// Append extended figures to the two-line output.
    pub details: bool,
}

impl ProbeSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            sync_timeout: cfg.sync_timeout(),
            history_days: cfg.probe.history_days,
            details: cfg.probe.details,
        }
    }
}

/// Keep a typed `ProbeError` raised by the collaborator, otherwise file the
/// failure under the step's own variant.
fn classify(err: anyhow::Error, fallback: impl FnOnce(String) -> ProbeError) -> ProbeError {
    match err.downcast::<ProbeError>() {
        Ok(typed) => typed,
        Err(other) => fallback(format!("{other:#}")),
    }
}

fn data_error(operation: &'static str) -> impl FnOnce(String) -> ProbeError {
    move |message| ProbeError::DataRetrieval { operation, message }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// One-shot probe of a single trading account. Holds no state between runs.
pub struct AccountProbe {
    account_id: String,
    settings: ProbeSettings,
}

impl AccountProbe {
    pub fn new(account_id: impl Into<String>, settings: ProbeSettings) -> Self {
        Self {
            account_id: account_id.into(),
            settings,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Run the probe without an external cancellation signal.
    pub async fn probe(&self, api: &dyn TradingApi) -> Result<ProbeReport, ProbeError> {
        self.run(api, std::future::pending::<()>()).await
    }

    /// Run the probe until it completes or `shutdown` resolves, whichever
    /// comes first. Cancellation yields `ProbeError::Cancelled`.
    pub async fn run<F>(&self, api: &dyn TradingApi, shutdown: F) -> Result<ProbeReport, ProbeError>
    where
        F: Future<Output = ()>,
    {
        let span = info_span!(
            "probe",
            run_id = %Uuid::new_v4(),
            account_id = %self.account_id,
        );
        self.run_steps(api, shutdown).instrument(span).await
    }

    /// Run the probe and write the rendered report to `out` on success.
    /// On failure `out` is left untouched.
    pub async fn execute<W, F>(
        &self,
        api: &dyn TradingApi,
        out: &mut W,
        shutdown: F,
    ) -> Result<ProbeReport, ProbeError>
    where
        W: Write,
        F: Future<Output = ()>,
    {
        let report = self.run(api, shutdown).await?;
        out.write_all(report.render(self.settings.details).as_bytes())?;
        out.flush()?;
        Ok(report)
    }

    async fn run_steps<F>(&self, api: &dyn TradingApi, shutdown: F) -> Result<ProbeReport, ProbeError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!("Resolving account");
        let account = tokio::select! {
            biased;
            _ = &mut shutdown => return Err(ProbeError::Cancelled),
            res = api.get_account(&self.account_id) => res.map_err(|e| {
                classify(e, |message| ProbeError::AccountNotFound {
                    account_id: self.account_id.clone(),
                    message,
                })
            })?,
        };

        info!("Connecting");
        let connection = tokio::select! {
            biased;
            _ = &mut shutdown => return Err(ProbeError::Cancelled),
            res = account.connect() => res.map_err(|e| classify(e, ProbeError::Connection))?,
        };

        let outcome = tokio::select! {
            biased;
            _ = &mut shutdown => Err(ProbeError::Cancelled),
            res = self.collect(connection.as_ref()) => res,
        };

        if let Err(e) = connection.close().await {
            warn!(error = %e, "Failed to close connection");
        }

        match &outcome {
            Ok(report) => info!(
                balance = report.account.balance,
                open_positions = report.open_positions(),
                "Probe complete"
            ),
            Err(e) => warn!(error = %e, "Probe failed"),
        }
        outcome
    }

    /// Synchronize, then read everything the report needs.
    async fn collect(&self, connection: &dyn TradingConnection) -> Result<ProbeReport, ProbeError> {
        self.synchronize(connection).await?;

        let account = connection
            .get_account_information()
            .await
            .map_err(|e| classify(e, data_error("account information")))?;

        let positions = connection
            .get_positions()
            .await
            .map_err(|e| classify(e, data_error("positions")))?;

        let (deals, history_days) = match self.settings.history_days {
            0 => (None, None),
            days => {
                let to = Utc::now();
                let from = to
                    .checked_sub_signed(chrono::Duration::days(i64::from(days)))
                    .ok_or_else(|| {
                        ProbeError::Config(format!(
                            "history_days = {days} reaches before the earliest representable date"
                        ))
                    })?;
                let deals = connection
                    .get_deals(from, to)
                    .await
                    .map_err(|e| classify(e, data_error("history deals")))?;
                (Some(deals), Some(days))
            }
        };

        Ok(ProbeReport {
            account_id: self.account_id.clone(),
            account,
            positions,
            deals,
            history_days,
        })
    }

    async fn synchronize(&self, connection: &dyn TradingConnection) -> Result<(), ProbeError> {
        let started = Instant::now();
        let wait = connection.wait_synchronized();

        let result = match self.settings.sync_timeout {
            Some(limit) => {
                info!(timeout_secs = limit.as_secs_f64(), "Waiting for synchronization");
                tokio::time::timeout(limit, wait)
                    .await
                    .map_err(|_| ProbeError::SynchronizationTimeout(limit))?
            }
            None => {
                warn!("Waiting for synchronization without a deadline");
                wait.await
            }
        };
        result.map_err(|e| classify(e, ProbeError::Connection))?;

        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Synchronized");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
