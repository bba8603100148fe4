//! Capability surface of the wallet backend
//!
//! The gateway never implements coin, account or device logic itself. It
//! talks to whatever implements [`Backend`], receives lifecycle callbacks
//! through [`BackendObserver`], and relays [`BackendEvent`]s to clients.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryBackend;

/// Exchange rates keyed by coin unit, then by fiat currency.
pub type Rates = HashMap<String, HashMap<String, f64>>;

/// Errors surfaced by backend operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("unknown coin {0}")]
    UnknownCoin(String),

    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error("Test keystore not available")]
    TestKeystoreUnavailable,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Unavailable(String),
}

/// Reasons an xpub submitted for a watch-only account is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountAddError {
    #[error("invalid extended public key")]
    XpubInvalid,

    #[error("extended private key entered")]
    XprivEntered,

    #[error("extended public key is for the wrong network")]
    XpubWrongNet,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl AccountAddError {
    /// Machine-readable code sent to the client, if this is a user input error.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            AccountAddError::XpubInvalid => Some("xpubInvalid"),
            AccountAddError::XprivEntered => Some("xprivEntered"),
            AccountAddError::XpubWrongNet => Some("xpubWrongNet"),
            AccountAddError::Backend(_) => None,
        }
    }
}

/// Parameters for a new single-sig watch-only account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddAccountRequest {
    pub coin_code: String,
    pub script_type: String,
    pub account_name: String,
    pub extended_public_key: String,
}

/// User-facing application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendSettings,
    /// Opaque settings owned by the UI.
    #[serde(default)]
    pub frontend: serde_json::Map<String, Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendSettings::default(),
            frontend: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    pub main_fiat: String,
    pub bitcoin_active: bool,
    pub litecoin_active: bool,
    pub use_proxy: bool,
    pub proxy_address: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            main_fiat: "USD".to_string(),
            bitcoin_active: true,
            litecoin_active: true,
            use_proxy: false,
            proxy_address: String::new(),
        }
    }
}

/// Header sync progress of a coin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadersStatus {
    pub tip: u64,
    pub tip_at_init_time: u64,
    pub target_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub available: String,
    pub incoming: String,
}

/// A newer release than the running one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub new_version: String,
    pub current_version: String,
    pub description: String,
}

/// Hardware families the backend can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    BitBox,
    Other(String),
}

/// Events pushed from the backend to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BackendEvent {
    Backend {
        data: String,
    },
    Devices {
        data: String,
    },
    Device {
        #[serde(rename = "deviceID")]
        device_id: String,
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
    Account {
        code: String,
        data: String,
    },
}

pub trait Coin: Send + Sync {
    fn code(&self) -> &str;
    fn name(&self) -> &str;
    fn block_explorer_tx_prefix(&self) -> &str;
    fn headers_status(&self) -> Result<HeadersStatus, BackendError>;
}

pub trait Account: Send + Sync {
    fn code(&self) -> &str;
    fn name(&self) -> &str;
    fn coin(&self) -> Arc<dyn Coin>;
    fn balance(&self) -> Result<Balance, BackendError>;
}

pub trait Device: Send + Sync {
    fn identifier(&self) -> &str;
    fn product_name(&self) -> &str;
    fn kind(&self) -> DeviceKind;
    fn info(&self) -> Result<Value, BackendError>;
}

/// Lifecycle callbacks the backend fires as entities come and go.
pub trait BackendObserver: Send + Sync {
    fn on_account_init(&self, account: Arc<dyn Account>);
    fn on_account_uninit(&self, account: Arc<dyn Account>);
    fn on_device_init(&self, device: Arc<dyn Device>);
    fn on_device_uninit(&self, device_id: &str);
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn app_config(&self) -> AppConfig;
    fn set_app_config(&self, config: AppConfig) -> Result<(), BackendError>;
    fn default_app_config(&self) -> AppConfig;
    fn coin(&self, code: &str) -> Result<Arc<dyn Coin>, BackendError>;
    fn accounts_status(&self) -> String;
    fn testing(&self) -> bool;
    fn accounts(&self) -> Vec<Arc<dyn Account>>;
    /// Validate the xpub and add the account, returning its code.
    fn add_watch_only_account(&self, request: &AddAccountRequest)
        -> Result<String, AccountAddError>;
    fn devices_registered(&self) -> Vec<Arc<dyn Device>>;
    fn register_test_keystore(&self, pin: &str);
    fn deregister_keystore(&self);
    fn rates(&self) -> Rates;
    async fn download_cert(&self, server: &str) -> Result<String, BackendError>;
    async fn check_electrum_server(&self, server: &str, pem_cert: &str)
        -> Result<(), BackendError>;
    async fn check_for_update(&self) -> Result<Option<UpdateInfo>, BackendError>;

    /// Attach the lifecycle observer and return the event stream.
    ///
    /// Called once, when the gateway is assembled.
    fn start(&self, observer: Arc<dyn BackendObserver>) -> mpsc::UnboundedReceiver<BackendEvent>;
}
