//! Mock trading API for integration testing.
//!
//! Provides a deterministic `TradingApi` implementation whose account
//! directory, connection behaviour and account data are fully controllable
//! from test code. Every collaborator call is counted so tests can assert
//! which steps ran.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

use account_probe::platforms::{TradingAccount, TradingApi, TradingConnection};
use account_probe::types::*;

/// How the mock connection behaves on `wait_synchronized`.
#[derive(Debug, Clone)]
pub enum SyncBehaviour {
    Immediate,
    /// Never resolves.
    Hang,
    Fail(String),
}

/// Number of calls made to each collaborator operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get_account: usize,
    pub connect: usize,
    pub wait_synchronized: usize,
    pub get_account_information: usize,
    pub get_positions: usize,
    pub get_deals: usize,
    pub close: usize,
}

struct MockState {
    accounts: Vec<String>,
    balance: f64,
    positions: Vec<Position>,
    connect_error: Option<String>,
    sync: SyncBehaviour,
    calls: Mutex<CallCounts>,
}

impl MockState {
    fn record(&self, f: impl FnOnce(&mut CallCounts)) {
        f(&mut self.calls.lock().unwrap());
    }
}

/// A mock trading API for deterministic testing.
pub struct MockApi {
    state: Arc<MockState>,
}

impl MockApi {
    /// A directory holding `account_id` with the given balance and
    /// `open_positions` positions. Connects and synchronizes immediately.
    pub fn new(account_id: &str, balance: f64, open_positions: usize) -> Self {
        Self::build(account_id, balance, open_positions, None, SyncBehaviour::Immediate)
    }

    /// Like `new`, but `connect()` fails with `msg`.
    pub fn failing_connect(account_id: &str, msg: &str) -> Self {
        Self::build(
            account_id,
            0.0,
            0,
            Some(msg.to_string()),
            SyncBehaviour::Immediate,
        )
    }

    /// Like `new`, but with the given synchronization behaviour.
    pub fn with_sync(account_id: &str, balance: f64, sync: SyncBehaviour) -> Self {
        Self::build(account_id, balance, 0, None, sync)
    }

    fn build(
        account_id: &str,
        balance: f64,
        open_positions: usize,
        connect_error: Option<String>,
        sync: SyncBehaviour,
    ) -> Self {
        Self {
            state: Arc::new(MockState {
                accounts: vec![account_id.to_string()],
                balance,
                positions: (0..open_positions).map(Self::position).collect(),
                connect_error,
                sync,
                calls: Mutex::new(CallCounts::default()),
            }),
        }
    }

    fn position(index: usize) -> Position {
        let (symbol, position_type) = if index % 2 == 0 {
            ("EURUSD", PositionType::Buy)
        } else {
            ("USDJPY", PositionType::Sell)
        };
        Position {
            id: format!("MOCK-{}", index + 1),
            symbol: symbol.to_string(),
            position_type,
            volume: 0.1,
            open_price: 1.1,
            current_price: 1.1,
            profit: 0.0,
            swap: 0.0,
            commission: 0.0,
            stop_loss: None,
            take_profit: None,
            time: None,
        }
    }

    /// Snapshot of the call counters.
    pub fn calls(&self) -> CallCounts {
        self.state.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TradingApi for MockApi {
    async fn get_account(&self, account_id: &str) -> Result<Box<dyn TradingAccount>> {
        self.state.record(|c| c.get_account += 1);
        if !self.state.accounts.iter().any(|a| a == account_id) {
            return Err(anyhow!("Account not found: {account_id}"));
        }
        Ok(Box::new(MockAccount {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockAccount {
    state: Arc<MockState>,
}

#[async_trait]
impl TradingAccount for MockAccount {
    async fn connect(&self) -> Result<Box<dyn TradingConnection>> {
        self.state.record(|c| c.connect += 1);
        if let Some(err) = &self.state.connect_error {
            return Err(anyhow!("{}", err));
        }
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
}

#[async_trait]
impl TradingConnection for MockConnection {
    async fn wait_synchronized(&self) -> Result<()> {
        self.state.record(|c| c.wait_synchronized += 1);
        match &self.state.sync {
            SyncBehaviour::Immediate => Ok(()),
            SyncBehaviour::Hang => std::future::pending().await,
            SyncBehaviour::Fail(msg) => Err(anyhow!("{}", msg)),
        }
    }

    async fn get_account_information(&self) -> Result<AccountInformation> {
        self.state.record(|c| c.get_account_information += 1);
        Ok(AccountInformation::with_balance(self.state.balance))
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        self.state.record(|c| c.get_positions += 1);
        Ok(self.state.positions.clone())
    }

    async fn get_deals(&self, _from: DateTime<Utc>, _to: DateTime<Utc>) -> Result<Vec<Deal>> {
        self.state.record(|c| c.get_deals += 1);
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<()> {
        self.state.record(|c| c.close += 1);
        Ok(())
    }
}
