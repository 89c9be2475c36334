//! MetaApi cloud integration.
//!
//! Reaches MetaTrader 4/5 accounts through MetaApi's REST surface.
//!
//! API docs: https://metaapi.cloud/docs/
//! Provisioning API: account directory, deployment, connection status
//! Client API: account information, positions, history (RPC over REST)
//! Auth: `auth-token: {token}` header on every request.
//!
//! The account is considered synchronized once the provisioning record
//! reports `connectionStatus == "CONNECTED"`, i.e. the vendor's terminal is
//! logged in to the broker and mirrors its state.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{TradingAccount, TradingApi, TradingConnection};
use crate::config::MetaApiConfig;
use crate::types::{AccountInformation, Deal, DealType, Position, PositionType, ProbeError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const AUTH_HEADER: &str = "auth-token";
const USER_AGENT: &str = "account-probe/0.1.0";

const STATE_DEPLOYED: &str = "DEPLOYED";
const STATE_DEPLOYING: &str = "DEPLOYING";
const STATE_DEPLOY_FAILED: &str = "DEPLOY_FAILED";
const STATUS_CONNECTED: &str = "CONNECTED";

// ---------------------------------------------------------------------------
// API response types (MetaApi JSON → Rust)
// ---------------------------------------------------------------------------

/// Account record from the provisioning API. Only the fields we need.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisioningAccount {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    /// "CREATED", "DEPLOYING", "DEPLOYED", "DEPLOY_FAILED", "UNDEPLOYED", ...
    #[serde(default)]
    state: String,
    /// "CONNECTED", "DISCONNECTED", "DISCONNECTED_FROM_BROKER"
    #[serde(default)]
    connection_status: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

impl ProvisioningAccount {
    fn is_deployed(&self) -> bool {
        self.state == STATE_DEPLOYED
    }

    fn is_connected(&self) -> bool {
        self.connection_status.as_deref() == Some(STATUS_CONNECTED)
    }
}

/// `GET .../account-information`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaApiAccountInformation {
    balance: f64,
    #[serde(default)]
    equity: Option<f64>,
    #[serde(default)]
    margin: Option<f64>,
    #[serde(default)]
    free_margin: Option<f64>,
    #[serde(default)]
    margin_level: Option<f64>,
    #[serde(default)]
    credit: Option<f64>,
    #[serde(default)]
    leverage: Option<u32>,
    #[serde(default)]
    currency: Option<String>,
    /// Numeric on MT accounts, but tolerate strings.
    #[serde(default)]
    login: Option<serde_json::Value>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    broker: Option<String>,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl From<MetaApiAccountInformation> for AccountInformation {
    fn from(raw: MetaApiAccountInformation) -> Self {
        AccountInformation {
            balance: raw.balance,
            equity: raw.equity,
            margin: raw.margin,
            free_margin: raw.free_margin,
            margin_level: raw.margin_level,
            credit: raw.credit,
            leverage: raw.leverage,
            currency: raw.currency,
            login: raw.login.map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }),
            platform: raw.platform,
            broker: raw.broker,
            server: raw.server,
            name: raw.name,
        }
    }
}

/// Element of `GET .../positions`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaApiPosition {
    id: String,
    /// "POSITION_TYPE_BUY" | "POSITION_TYPE_SELL"
    #[serde(rename = "type")]
    position_type: String,
    symbol: String,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
    #[serde(default)]
    open_price: f64,
    #[serde(default)]
    current_price: f64,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    profit: f64,
    #[serde(default)]
    swap: f64,
    #[serde(default)]
    commission: f64,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    take_profit: Option<f64>,
}

impl MetaApiPosition {
    fn into_position(self) -> Result<Position> {
        let position_type: PositionType = self
            .position_type
            .parse()
            .map_err(|e: String| anyhow!("Position {}: {e}", self.id))?;

        Ok(Position {
            id: self.id,
            symbol: self.symbol,
            position_type,
            volume: self.volume,
            open_price: self.open_price,
            current_price: self.current_price,
            profit: self.profit,
            swap: self.swap,
            commission: self.commission,
            stop_loss: self.stop_loss.filter(|v| *v != 0.0),
            take_profit: self.take_profit.filter(|v| *v != 0.0),
            time: self.time,
        })
    }
}

/// Element of `GET .../history-deals/time/{from}/{to}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaApiDeal {
    id: String,
    #[serde(rename = "type")]
    deal_type: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    position_id: Option<String>,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    profit: f64,
    #[serde(default)]
    commission: f64,
    #[serde(default)]
    swap: f64,
    time: DateTime<Utc>,
}

impl From<MetaApiDeal> for Deal {
    fn from(raw: MetaApiDeal) -> Self {
        Deal {
            deal_type: DealType::from_vendor(&raw.deal_type),
            id: raw.id,
            order_id: raw.order_id,
            position_id: raw.position_id,
            symbol: raw.symbol,
            volume: raw.volume,
            price: raw.price,
            profit: raw.profit,
            commission: raw.commission,
            swap: raw.swap,
            time: raw.time,
        }
    }
}

/// Error body MetaApi returns on non-2xx responses.
#[derive(Debug, Deserialize)]
struct MetaApiErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Turn an error response body into a short message, falling back to the raw
/// text when it is not MetaApi's JSON error shape.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<MetaApiErrorBody>(body) {
        Ok(MetaApiErrorBody {
            error: Some(kind),
            message: Some(msg),
        }) => format!("{kind}: {msg}"),
        Ok(MetaApiErrorBody {
            message: Some(msg), ..
        }) => msg,
        _ => body.trim().to_string(),
    }
}

/// Map a failed response to an error. Credential rejections become a typed
/// `ProbeError::Authentication` so callers can tell them apart.
fn classify_status(status: StatusCode, body: &str, what: &str) -> anyhow::Error {
    let message = error_message(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProbeError::Authentication(format!("{what}: HTTP {status}: {message}")).into()
        }
        _ => anyhow!("MetaApi {what} error {status}: {message}"),
    }
}

/// An account that vanishes after it was resolved is a lost connection, not
/// a lookup failure.
fn lost_during_sync(err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<ProbeError>() {
        Ok(ProbeError::AccountNotFound { account_id, message }) => ProbeError::Connection(format!(
            "Account {account_id} disappeared while synchronizing: {message}"
        ))
        .into(),
        Ok(other) => other.into(),
        Err(other) => other,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Inner {
    http: Client,
    token: SecretString,
    settings: MetaApiConfig,
}

impl Inner {
    fn account_url(&self, account_id: &str) -> String {
        format!(
            "{}/users/current/accounts/{}",
            self.settings.provisioning_url.trim_end_matches('/'),
            urlencoding::encode(account_id),
        )
    }

    fn client_base(&self, region: Option<&str>) -> String {
        let region = region.unwrap_or(&self.settings.default_region);
        self.settings
            .client_url_template
            .replace("{region}", region)
            .trim_end_matches('/')
            .to_string()
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        debug!(url = %url, "MetaApi GET");

        let resp = self
            .http
            .get(url)
            .header(AUTH_HEADER, self.token.expose_secret().as_str())
            .send()
            .await
            .with_context(|| format!("MetaApi {what} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, what));
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse MetaApi {what} response"))
    }

    /// Fetch the provisioning record. 404 maps to `AccountNotFound`.
    async fn fetch_account(&self, account_id: &str) -> Result<ProvisioningAccount> {
        let url = self.account_url(account_id);
        debug!(url = %url, "MetaApi GET");

        let resp = self
            .http
            .get(&url)
            .header(AUTH_HEADER, self.token.expose_secret().as_str())
            .send()
            .await
            .context("MetaApi account lookup request failed")?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProbeError::AccountNotFound {
                account_id: account_id.to_string(),
                message: error_message(&body),
            }
            .into());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, "account lookup"));
        }

        resp.json()
            .await
            .context("Failed to parse MetaApi account record")
    }

    async fn deploy(&self, account_id: &str) -> Result<()> {
        let url = format!("{}/deploy", self.account_url(account_id));
        debug!(url = %url, "MetaApi POST");

        let resp = self
            .http
            .post(&url)
            .header(AUTH_HEADER, self.token.expose_secret().as_str())
            .send()
            .await
            .context("MetaApi deploy request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, "deploy"));
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.settings.poll_interval_ms.max(1))
    }

    /// Poll the provisioning record until the account reports `DEPLOYED`.
    async fn wait_deployed(&self, account_id: &str) -> Result<ProvisioningAccount> {
        loop {
            let record = self.fetch_account(account_id).await?;
            if record.is_deployed() {
                return Ok(record);
            }
            if record.state == STATE_DEPLOY_FAILED {
                anyhow::bail!("Deployment of account {account_id} failed");
            }
            debug!(account_id, state = %record.state, "Waiting for deployment");
            tokio::time::sleep(self.poll_interval()).await;
        }
    }
}

/// MetaApi cloud client bound to one API token.
pub struct MetaApiClient {
    inner: Arc<Inner>,
}

impl MetaApiClient {
    /// Create a new MetaApi client. No network I/O happens here.
    pub fn new(token: SecretString, settings: MetaApiConfig) -> Result<Self, ProbeError> {
        if token.expose_secret().trim().is_empty() {
            return Err(ProbeError::Authentication("API token is empty".to_string()));
        }
        Url::parse(&settings.provisioning_url).map_err(|e| {
            ProbeError::Config(format!(
                "Invalid provisioning_url {}: {e}",
                settings.provisioning_url
            ))
        })?;
        let sample_client = settings
            .client_url_template
            .replace("{region}", &settings.default_region);
        Url::parse(&sample_client).map_err(|e| {
            ProbeError::Config(format!(
                "Invalid client_url_template {}: {e}",
                settings.client_url_template
            ))
        })?;

        let mut builder = Client::builder().user_agent(USER_AGENT);
        if let Some(limit) = settings.request_timeout() {
            builder = builder.timeout(limit);
        }
        let http = builder
            .build()
            .map_err(|e| ProbeError::Config(format!("Failed to build HTTP client for MetaApi: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                token,
                settings,
            }),
        })
    }
}

#[async_trait]
impl TradingApi for MetaApiClient {
    async fn get_account(&self, account_id: &str) -> Result<Box<dyn TradingAccount>> {
        let record = self.inner.fetch_account(account_id).await?;
        info!(
            account_id = %record.id,
            name = ?record.name,
            state = %record.state,
            region = ?record.region,
            "MetaApi account resolved"
        );
        Ok(Box::new(MetaApiAccount {
            inner: Arc::clone(&self.inner),
            record,
        }))
    }
}

/// Account handle from the provisioning API.
pub struct MetaApiAccount {
    inner: Arc<Inner>,
    record: ProvisioningAccount,
}

impl MetaApiAccount {
    /// Make sure the account is deployed, deploying it when allowed.
    async fn ensure_deployed(&self) -> Result<ProvisioningAccount> {
        if self.record.is_deployed() {
            return Ok(self.record.clone());
        }
        let account_id = self.record.id.as_str();
        if !self.inner.settings.auto_deploy {
            anyhow::bail!(
                "Account {account_id} is {} and auto_deploy is disabled",
                self.record.state
            );
        }
        if self.record.state != STATE_DEPLOYING {
            info!(account_id, state = %self.record.state, "Deploying account");
            self.inner.deploy(account_id).await?;
        }

        info!(account_id, "Waiting for account deployment");
        match self.inner.settings.deploy_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.inner.wait_deployed(account_id))
                .await
                .map_err(|_| anyhow!("Account {account_id} not deployed within {limit:?}"))?,
            None => self.inner.wait_deployed(account_id).await,
        }
    }
}

#[async_trait]
impl TradingAccount for MetaApiAccount {
    async fn connect(&self) -> Result<Box<dyn TradingConnection>> {
        let record = self.ensure_deployed().await?;
        let base_url = self.inner.client_base(record.region.as_deref());
        info!(account_id = %record.id, base_url = %base_url, "MetaApi connection opened");

        Ok(Box::new(RpcConnection {
            inner: Arc::clone(&self.inner),
            account_id: record.id,
            base_url,
            closed: AtomicBool::new(false),
        }))
    }
}

/// RPC-style connection: every query is a request against the client API.
pub struct RpcConnection {
    inner: Arc<Inner>,
    account_id: String,
    base_url: String,
    closed: AtomicBool,
}

impl RpcConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("Connection to account {} is closed", self.account_id);
        }
        Ok(())
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/users/current/accounts/{}/{path}",
            self.base_url,
            urlencoding::encode(&self.account_id),
        )
    }

    fn deals_endpoint(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> String {
        let from = from.to_rfc3339_opts(SecondsFormat::Millis, true);
        let to = to.to_rfc3339_opts(SecondsFormat::Millis, true);
        self.endpoint(&format!(
            "history-deals/time/{}/{}",
            urlencoding::encode(&from),
            urlencoding::encode(&to),
        ))
    }
}

#[async_trait]
impl TradingConnection for RpcConnection {
    async fn wait_synchronized(&self) -> Result<()> {
        loop {
            self.ensure_open()?;
            let record = self
                .inner
                .fetch_account(&self.account_id)
                .await
                .map_err(lost_during_sync)?;
            if record.is_connected() {
                info!(account_id = %self.account_id, "Account synchronized");
                return Ok(());
            }
            debug!(
                account_id = %self.account_id,
                connection_status = ?record.connection_status,
                "Waiting for synchronization"
            );
            tokio::time::sleep(self.inner.poll_interval()).await;
        }
    }

    async fn get_account_information(&self) -> Result<AccountInformation> {
        self.ensure_open()?;
        let raw: MetaApiAccountInformation = self
            .inner
            .get_json(&self.endpoint("account-information"), "account information")
            .await?;
        Ok(raw.into())
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        self.ensure_open()?;
        let raw: Vec<MetaApiPosition> = self
            .inner
            .get_json(&self.endpoint("positions"), "positions")
            .await?;
        raw.into_iter().map(MetaApiPosition::into_position).collect()
    }

    async fn get_deals(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Deal>> {
        self.ensure_open()?;
        let raw: Vec<MetaApiDeal> = self
            .inner
            .get_json(&self.deals_endpoint(from, to), "history deals")
            .await?;
        Ok(raw.into_iter().map(Deal::from).collect())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(account_id = %self.account_id, "MetaApi connection closed");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
