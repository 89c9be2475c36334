//! Shared types for the account probe.
//!
//! The records here are read-only snapshots of remote account state as the
//! vendor reports it. Nothing is cached or persisted between runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Account information
// ---------------------------------------------------------------------------

/// Account summary returned by a synchronized connection.
///
/// Only `balance` is guaranteed by every provider; the remaining fields are
/// filled when the vendor reports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AccountInformation {
    pub balance: f64,
    pub equity: Option<f64>,
    pub margin: Option<f64>,
    pub free_margin: Option<f64>,
    /// Margin level in percent (equity / margin * 100).
    pub margin_level: Option<f64>,
    pub credit: Option<f64>,
    pub leverage: Option<u32>,
    pub currency: Option<String>,
    pub login: Option<String>,
    /// "mt4" | "mt5"
    pub platform: Option<String>,
    pub broker: Option<String>,
    pub server: Option<String>,
    pub name: Option<String>,
}

impl AccountInformation {
    /// Build a record carrying only a balance.
    pub fn with_balance(balance: f64) -> Self {
        Self {
            balance,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionType {
    Buy,
    Sell,
}

impl fmt::Display for PositionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionType::Buy => write!(f, "BUY"),
            PositionType::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for PositionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "POSITION_TYPE_BUY" | "BUY" => Ok(PositionType::Buy),
            "POSITION_TYPE_SELL" | "SELL" => Ok(PositionType::Sell),
            other => Err(format!("Unknown position type: {other}")),
        }
    }
}

/// An open position on the trading account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub position_type: PositionType,
    /// Volume in lots.
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub profit: f64,
    #[serde(default)]
    pub swap: f64,
    #[serde(default)]
    pub commission: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub time: Option<DateTime<Utc>>,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} lots @ {} | P/L: {}",
            self.symbol,
            self.position_type,
            self.volume,
            self.open_price,
            format_amount(self.profit),
        )
    }
}

// ---------------------------------------------------------------------------
// Deals (trading history)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DealType {
    Buy,
    Sell,
    /// Deposits, withdrawals and other balance operations.
    Balance,
    Other,
}

impl DealType {
    /// Map a MetaTrader deal type string (`DEAL_TYPE_BUY`, ...).
    pub fn from_vendor(s: &str) -> Self {
        match s {
            "DEAL_TYPE_BUY" => DealType::Buy,
            "DEAL_TYPE_SELL" => DealType::Sell,
            "DEAL_TYPE_BALANCE" | "DEAL_TYPE_CREDIT" => DealType::Balance,
            _ => DealType::Other,
        }
    }
}

/// A historical deal (fill or balance operation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: String,
    pub order_id: Option<String>,
    pub position_id: Option<String>,
    pub symbol: Option<String>,
    pub deal_type: DealType,
    pub volume: f64,
    pub price: f64,
    pub profit: f64,
    pub commission: f64,
    pub swap: f64,
    pub time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Probe report
// ---------------------------------------------------------------------------

/// Everything one probe run fetched from a synchronized connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub account_id: String,
    pub account: AccountInformation,
    pub positions: Vec<Position>,
    /// Present only when a history window was requested.
    pub deals: Option<Vec<Deal>>,
    /// Length of the history window in days, when one was requested.
    pub history_days: Option<u32>,
}

impl ProbeReport {
    pub fn open_positions(&self) -> usize {
        self.positions.len()
    }

    /// Render the report as stdout text. The first two lines are always the
    /// balance and the open-position count; `details` appends the extended
    /// account figures, one line per position and the deal count.
    pub fn render(&self, details: bool) -> String {
        let mut out = self.to_string();
        if !details {
            return out;
        }

        let optional = [
            ("Equity", self.account.equity),
            ("Margin", self.account.margin),
            ("Free margin", self.account.free_margin),
            ("Margin level", self.account.margin_level),
        ];
        for (label, value) in optional {
            if let Some(v) = value {
                out.push_str(&format!("{label}: {}\n", format_amount(v)));
            }
        }
        for position in &self.positions {
            out.push_str(&format!("  {position}\n"));
        }
        if let (Some(deals), Some(days)) = (&self.deals, self.history_days) {
            out.push_str(&format!("Deals (last {days} days): {}\n", deals.len()));
        }
        out
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Balance: {}", format_amount(self.account.balance))?;
        writeln!(f, "Open positions: {}", self.open_positions())
    }
}

/// Format a monetary amount the way a float literal reads: whole values keep
/// a trailing `.0`, everything else uses the shortest round-trip form.
pub fn format_amount(value: f64) -> String {
    format!("{value:?}")
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failure taxonomy of a probe run. Every variant is fatal.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Account not found ({account_id}): {message}")]
    AccountNotFound { account_id: String, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Synchronization did not complete within {0:?}")]
    SynchronizationTimeout(Duration),

    #[error("Data retrieval error ({operation}): {message}")]
    DataRetrieval {
        operation: &'static str,
        message: String,
    },

    #[error("Probe cancelled")]
    Cancelled,

    #[error("Failed to write report: {0}")]
    Output(#[from] std::io::Error),
}

impl ProbeError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            ProbeError::Config(_) => 2,
            ProbeError::Authentication(_) => 3,
            ProbeError::AccountNotFound { .. } => 4,
            ProbeError::Connection(_) => 5,
            ProbeError::SynchronizationTimeout(_) => 6,
            ProbeError::DataRetrieval { .. } => 7,
            ProbeError::Output(_) => 1,
            ProbeError::Cancelled => 130,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
