//! Simulated trading account.
//!
//! Deterministic in-memory stand-in for the MetaApi service, selected with
//! `provider = "simulated"`, `--simulated` or `MT5_USE_MOCK=true`. Figures
//! are derived from the `[simulated]` fixture: profit uses a standard
//! 100,000-unit contract, margin a flat amount per lot.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{TradingAccount, TradingApi, TradingConnection};
use crate::config::{SimulatedConfig, SimulatedPosition};
use crate::types::{AccountInformation, Deal, DealType, Position, PositionType, ProbeError};

const CONTRACT_SIZE: f64 = 100_000.0;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Profit of a fixture position in account currency.
fn position_profit(p: &SimulatedPosition) -> f64 {
    let direction = match p.side {
        PositionType::Buy => 1.0,
        PositionType::Sell => -1.0,
    };
    round2((p.current_price - p.open_price) * p.volume * CONTRACT_SIZE * direction)
}

pub struct SimulatedApi {
    fixture: Arc<SimulatedConfig>,
}

impl SimulatedApi {
    pub fn new(fixture: SimulatedConfig) -> Self {
        Self {
            fixture: Arc::new(fixture),
        }
    }
}

#[async_trait]
impl TradingApi for SimulatedApi {
    async fn get_account(&self, account_id: &str) -> Result<Box<dyn TradingAccount>> {
        let known = &self.fixture.account_ids;
        if !known.is_empty() && !known.iter().any(|id| id == account_id) {
            return Err(ProbeError::AccountNotFound {
                account_id: account_id.to_string(),
                message: "not in simulated directory".to_string(),
            }
            .into());
        }
        Ok(Box::new(SimulatedAccount {
            account_id: account_id.to_string(),
            fixture: Arc::clone(&self.fixture),
        }))
    }
}

pub struct SimulatedAccount {
    account_id: String,
    fixture: Arc<SimulatedConfig>,
}

#[async_trait]
impl TradingAccount for SimulatedAccount {
    async fn connect(&self) -> Result<Box<dyn TradingConnection>> {
        debug!(account_id = %self.account_id, "Simulated connection opened");
        Ok(Box::new(SimulatedConnection {
            account_id: self.account_id.clone(),
            fixture: Arc::clone(&self.fixture),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct SimulatedConnection {
    account_id: String,
    fixture: Arc<SimulatedConfig>,
    closed: AtomicBool,
}

impl SimulatedConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("Connection to account {} is closed", self.account_id);
        }
        Ok(())
    }
}

#[async_trait]
impl TradingConnection for SimulatedConnection {
    async fn wait_synchronized(&self) -> Result<()> {
        self.ensure_open()?;
        if self.fixture.sync_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.fixture.sync_delay_ms)).await;
        }
        Ok(())
    }

    async fn get_account_information(&self) -> Result<AccountInformation> {
        self.ensure_open()?;
        let f = &self.fixture;
        let floating: f64 = f.positions.iter().map(position_profit).sum();
        let equity = round2(f.balance + f.credit + floating);
        let margin = round2(f.positions.iter().map(|p| p.volume).sum::<f64>() * f.margin_per_lot);
        let margin_level = (margin > 0.0).then(|| round2(equity / margin * 100.0));

        Ok(AccountInformation {
            balance: f.balance,
            equity: Some(equity),
            margin: Some(margin),
            free_margin: Some(round2(equity - margin)),
            margin_level,
            credit: Some(f.credit),
            leverage: Some(f.leverage),
            currency: Some(f.currency.clone()),
            login: Some(self.account_id.clone()),
            platform: Some("mt5".to_string()),
            broker: Some("Simulated".to_string()),
            server: Some("Simulated-Demo".to_string()),
            name: None,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        self.ensure_open()?;
        Ok(self
            .fixture
            .positions
            .iter()
            .enumerate()
            .map(|(i, p)| Position {
                id: format!("SIM-{}", i + 1),
                symbol: p.symbol.clone(),
                position_type: p.side,
                volume: p.volume,
                open_price: p.open_price,
                current_price: p.current_price,
                profit: position_profit(p),
                swap: 0.0,
                commission: 0.0,
                stop_loss: None,
                take_profit: None,
                time: None,
            })
            .collect())
    }

    /// One opening fill per fixture position, stamped mid-window.
    async fn get_deals(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Deal>> {
        self.ensure_open()?;
        let mid = from + (to - from) / 2;
        Ok(self
            .fixture
            .positions
            .iter()
            .enumerate()
            .map(|(i, p)| Deal {
                id: format!("SIM-DEAL-{}", i + 1),
                order_id: Some(format!("SIM-{}", i + 1)),
                position_id: Some(format!("SIM-{}", i + 1)),
                symbol: Some(p.symbol.clone()),
                deal_type: match p.side {
                    PositionType::Buy => DealType::Buy,
                    PositionType::Sell => DealType::Sell,
                },
                volume: p.volume,
                price: p.open_price,
                profit: 0.0,
                commission: 0.0,
                swap: 0.0,
                time: mid,
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
