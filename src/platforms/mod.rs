//! Trading platform integrations.
//!
//! Defines the collaborator contract the probe talks to and provides
//! implementations for:
//! - MetaApi cloud (REST): real MetaTrader 4/5 accounts
//! - Simulated: deterministic in-memory account for offline runs

pub mod metaapi;
pub mod simulated;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{AppConfig, Provider};
use crate::types::{AccountInformation, Deal, Position, ProbeError};

/// Client bound to an API credential.
///
/// The entry point of the vendor contract: resolves account identifiers to
/// account handles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradingApi: Send + Sync {
    /// Look up a trading account by identifier.
    async fn get_account(&self, account_id: &str) -> Result<Box<dyn TradingAccount>>;
}

/// Opaque handle to a remote trading account.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradingAccount: Send + Sync {
    /// Open a connection to the account. May involve a long network
    /// handshake with the vendor's synchronization service.
    async fn connect(&self) -> Result<Box<dyn TradingConnection>>;
}

/// Active session against a trading account.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradingConnection: Send + Sync {
    /// Suspend until the remote side reports synchronized state. Has no
    /// deadline of its own; callers bound it.
    async fn wait_synchronized(&self) -> Result<()>;

    /// Current account summary.
    async fn get_account_information(&self) -> Result<AccountInformation>;

    /// Currently open positions.
    async fn get_positions(&self) -> Result<Vec<Position>>;

    /// Deals executed within `[from, to]`.
    async fn get_deals(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Deal>>;

    /// Release the session. Further calls on this connection fail.
    async fn close(&self) -> Result<()>;
}

/// Build the client selected by the configuration.
///
/// A blank credential is rejected here, before any network I/O.
pub fn build_api(cfg: &AppConfig) -> Result<Box<dyn TradingApi>, ProbeError> {
    match cfg.metaapi.provider {
        Provider::Simulated => Ok(Box::new(simulated::SimulatedApi::new(cfg.simulated.clone()))),
        Provider::MetaApi => {
            let token = cfg.resolve_token()?;
            let client = metaapi::MetaApiClient::new(token, cfg.metaapi.clone())?;
            Ok(Box::new(client))
        }
    }
}
