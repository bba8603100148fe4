//! API business functions and entity lifecycle wiring
//!
//! [`Handlers`] owns the static route functions. [`EntityRegistries`] owns the
//! account and device registries and receives the backend's lifecycle
//! callbacks.

pub mod account;
pub mod device;
pub mod open;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backend::{
    Account, AddAccountRequest, AppConfig, Backend, BackendObserver, Device, DeviceKind,
};
use crate::server::dispatch::{handler, sync_handler, ApiError, ApiRequest, HandlerFn, HandlerResult};
use crate::server::registry::HandlerRegistry;

pub use account::AccountHandlers;
pub use device::DeviceHandlers;
pub use open::{OpenPolicy, SystemOpener, UrlOpener};

/// Coins with a header status route.
pub const HEADER_STATUS_COINS: &[&str] = &["tltc", "tbtc", "ltc", "btc"];

/// Account and device registries, driven by backend lifecycle events.
pub struct EntityRegistries {
    pub accounts: HandlerRegistry<AccountHandlers>,
    pub devices: HandlerRegistry<DeviceHandlers>,
}

impl EntityRegistries {
    pub fn new() -> Self {
        Self {
            accounts: HandlerRegistry::new("/api/account", |code| Ok(AccountHandlers::new(code))),
            devices: HandlerRegistry::new("/api/devices", |id| Ok(DeviceHandlers::new(id))),
        }
    }
}

impl Default for EntityRegistries {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendObserver for EntityRegistries {
    fn on_account_init(&self, account: Arc<dyn Account>) {
        debug!(target: "gateway", code = account.code(), "initializing account");
        match self.accounts.get_or_create(account.code()) {
            Ok(entry) => entry.handler().init(account),
            Err(e) => warn!(target: "gateway", error = %e, "cannot mount account handlers"),
        }
    }

    fn on_account_uninit(&self, account: Arc<dyn Account>) {
        match self.accounts.lookup(account.code()) {
            Some(entry) => entry.handler().uninit(),
            None => warn!(
                target: "gateway",
                code = account.code(),
                "uninit for an account that was never initialized"
            ),
        }
    }

    fn on_device_init(&self, device: Arc<dyn Device>) {
        match device.kind() {
            DeviceKind::BitBox => match self.devices.get_or_create(device.identifier()) {
                Ok(entry) => entry.handler().init(device),
                Err(e) => warn!(target: "gateway", error = %e, "cannot mount device handlers"),
            },
            DeviceKind::Other(kind) => debug!(
                target: "gateway",
                device_id = device.identifier(),
                kind = %kind,
                "no HTTP handlers for device kind"
            ),
        }
    }

    fn on_device_uninit(&self, device_id: &str) {
        match self.devices.lookup(device_id) {
            Some(entry) => entry.handler().uninit(),
            None => debug!(
                target: "gateway",
                device_id,
                "uninit for a device without handlers"
            ),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountJson {
    coin_code: String,
    code: String,
    name: String,
    block_explorer_tx_prefix: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OpenBody {
    Url(String),
    Object { url: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertsCheckBody {
    server: String,
    pem_cert: String,
}

#[derive(Debug, Deserialize)]
struct PinBody {
    #[serde(default)]
    pin: String,
}

/// Static API business functions.
pub struct Handlers {
    backend: Arc<dyn Backend>,
    opener: Arc<dyn UrlOpener>,
    policy: OpenPolicy,
}

impl Handlers {
    pub fn new(backend: Arc<dyn Backend>, opener: Arc<dyn UrlOpener>, policy: OpenPolicy) -> Self {
        Self {
            backend,
            opener,
            policy,
        }
    }

    /// Wrap a method as a synchronous route function.
    pub fn route<F>(self: &Arc<Self>, f: F) -> HandlerFn
    where
        F: Fn(&Handlers, &ApiRequest) -> HandlerResult + Send + Sync + 'static,
    {
        let this = Arc::clone(self);
        sync_handler(move |req| f(&this, &req))
    }

    pub fn get_app_config(&self, _: &ApiRequest) -> HandlerResult {
        to_value(self.backend.app_config())
    }

    pub fn get_default_config(&self, _: &ApiRequest) -> HandlerResult {
        to_value(self.backend.default_app_config())
    }

    pub fn post_app_config(&self, req: &ApiRequest) -> HandlerResult {
        let config: AppConfig = req.json()?;
        self.backend.set_app_config(config)?;
        Ok(Value::Null)
    }

    pub fn post_open(&self, req: &ApiRequest) -> HandlerResult {
        let url = match req.json::<OpenBody>()? {
            OpenBody::Url(url) | OpenBody::Object { url } => url,
        };
        if !self.policy.is_allowed(&url) {
            return Err(ApiError::BlockedUrl(url));
        }
        self.opener
            .open(&url)
            .map_err(|e| ApiError::Failed(format!("failed to open {}: {}", url, e)))?;
        Ok(Value::Null)
    }

    pub fn get_version(&self, _: &ApiRequest) -> HandlerResult {
        Ok(json!(env!("CARGO_PKG_VERSION")))
    }

    pub fn get_testing(&self, _: &ApiRequest) -> HandlerResult {
        Ok(json!(self.backend.testing()))
    }

    pub fn post_add_account(&self, req: &ApiRequest) -> HandlerResult {
        let body: AddAccountRequest = req.json()?;
        match self.backend.add_watch_only_account(&body) {
            Ok(code) => Ok(json!({ "success": true, "accountCode": code })),
            Err(e) => match e.error_code() {
                Some(code) => Ok(json!({ "success": false, "errorCode": code })),
                None => Err(ApiError::Failed(e.to_string())),
            },
        }
    }

    pub fn get_accounts(&self, _: &ApiRequest) -> HandlerResult {
        let accounts: Vec<AccountJson> = self
            .backend
            .accounts()
            .iter()
            .map(|a| {
                let coin = a.coin();
                AccountJson {
                    coin_code: coin.code().to_string(),
                    code: a.code().to_string(),
                    name: a.name().to_string(),
                    block_explorer_tx_prefix: coin.block_explorer_tx_prefix().to_string(),
                }
            })
            .collect();
        to_value(accounts)
    }

    pub fn get_accounts_status(&self, _: &ApiRequest) -> HandlerResult {
        Ok(json!(self.backend.accounts_status()))
    }

    pub fn post_register_test_keystore(&self, req: &ApiRequest) -> HandlerResult {
        if !self.backend.testing() {
            return Err(crate::backend::BackendError::TestKeystoreUnavailable.into());
        }
        let body: PinBody = req.json()?;
        self.backend.register_test_keystore(&body.pin);
        Ok(json!(true))
    }

    pub fn post_deregister_test_keystore(&self, _: &ApiRequest) -> HandlerResult {
        self.backend.deregister_keystore();
        Ok(json!(true))
    }

    pub fn get_rates(&self, _: &ApiRequest) -> HandlerResult {
        to_value(self.backend.rates())
    }

    /// `amount * rates[from][to]`, two decimals.
    pub fn get_convert_to_fiat(&self, req: &ApiRequest) -> HandlerResult {
        let Ok(amount) = req.query("amount").parse::<f64>() else {
            return Ok(invalid_amount());
        };
        let rate = self.rate(&req.query("from"), &req.query("to"));
        Ok(json!({
            "success": true,
            "fiatAmount": format!("{:.2}", amount * rate),
        }))
    }

    /// `amount / rates[to][from]`, eight decimals; zero when no rate is known.
    pub fn get_convert_from_fiat(&self, req: &ApiRequest) -> HandlerResult {
        let Ok(amount) = req.query("amount").parse::<f64>() else {
            return Ok(invalid_amount());
        };
        let rate = self.rate(&req.query("to"), &req.query("from"));
        let result = if rate != 0.0 { amount / rate } else { 0.0 };
        Ok(json!({
            "success": true,
            "amount": format!("{:.8}", result),
        }))
    }

    pub fn get_headers_status(&self, coin_code: &str) -> HandlerResult {
        let coin = self.backend.coin(coin_code)?;
        to_value(coin.headers_status()?)
    }

    pub fn get_devices_registered(&self, _: &ApiRequest) -> HandlerResult {
        let devices: BTreeMap<String, String> = self
            .backend
            .devices_registered()
            .iter()
            .map(|d| (d.identifier().to_string(), d.product_name().to_string()))
            .collect();
        to_value(devices)
    }

    pub async fn get_update(&self) -> HandlerResult {
        match self.backend.check_for_update().await {
            Ok(update) => to_value(update),
            Err(e) => {
                warn!(target: "gateway", error = %e, "update check failed");
                Ok(Value::Null)
            }
        }
    }

    pub async fn post_certs_download(&self, req: ApiRequest) -> HandlerResult {
        let server: String = req.json()?;
        match self.backend.download_cert(&server).await {
            Ok(pem) => Ok(json!({ "success": true, "pemCert": pem })),
            Err(e) => Ok(json!({ "success": false, "errorMessage": e.to_string() })),
        }
    }

    pub async fn post_certs_check(&self, req: ApiRequest) -> HandlerResult {
        let body: CertsCheckBody = req.json()?;
        match self
            .backend
            .check_electrum_server(&body.server, &body.pem_cert)
            .await
        {
            Ok(()) => Ok(json!({ "success": true })),
            Err(e) => Ok(json!({ "success": false, "errorMessage": e.to_string() })),
        }
    }

    fn rate(&self, unit: &str, fiat: &str) -> f64 {
        self.backend
            .rates()
            .get(unit)
            .and_then(|r| r.get(fiat))
            .copied()
            .unwrap_or(0.0)
    }

    /// Route functions for every static endpoint, keyed by method and path.
    pub fn static_routes(self: &Arc<Self>) -> Vec<(axum::http::Method, String, HandlerFn)> {
        use axum::http::Method;

        let mut routes = vec![
            (Method::GET, "/api/config".to_string(), self.route(Self::get_app_config)),
            (Method::POST, "/api/config".to_string(), self.route(Self::post_app_config)),
            (
                Method::GET,
                "/api/config/default".to_string(),
                self.route(Self::get_default_config),
            ),
            (Method::POST, "/api/open".to_string(), self.route(Self::post_open)),
            (Method::GET, "/api/version".to_string(), self.route(Self::get_version)),
            (Method::GET, "/api/testing".to_string(), self.route(Self::get_testing)),
            (
                Method::POST,
                "/api/account-add".to_string(),
                self.route(Self::post_add_account),
            ),
            (Method::GET, "/api/accounts".to_string(), self.route(Self::get_accounts)),
            (
                Method::GET,
                "/api/accounts-status".to_string(),
                self.route(Self::get_accounts_status),
            ),
            (
                Method::POST,
                "/api/test/register".to_string(),
                self.route(Self::post_register_test_keystore),
            ),
            (
                Method::POST,
                "/api/test/deregister".to_string(),
                self.route(Self::post_deregister_test_keystore),
            ),
            (Method::GET, "/api/rates".to_string(), self.route(Self::get_rates)),
            (
                Method::GET,
                "/api/coins/convertToFiat".to_string(),
                self.route(Self::get_convert_to_fiat),
            ),
            (
                Method::GET,
                "/api/coins/convertFromFiat".to_string(),
                self.route(Self::get_convert_from_fiat),
            ),
            (
                Method::GET,
                "/api/devices/registered".to_string(),
                self.route(Self::get_devices_registered),
            ),
        ];

        for coin in HEADER_STATUS_COINS {
            routes.push((
                Method::GET,
                format!("/api/coins/{}/headers/status", coin),
                self.route(move |h, _| h.get_headers_status(coin)),
            ));
        }

        let this = Arc::clone(self);
        routes.push((
            Method::GET,
            "/api/update".to_string(),
            handler(move |_| {
                let this = Arc::clone(&this);
                async move { this.get_update().await }
            }),
        ));
        let this = Arc::clone(self);
        routes.push((
            Method::POST,
            "/api/certs/download".to_string(),
            handler(move |req| {
                let this = Arc::clone(&this);
                async move { this.post_certs_download(req).await }
            }),
        ));
        let this = Arc::clone(self);
        routes.push((
            Method::POST,
            "/api/certs/check".to_string(),
            handler(move |req| {
                let this = Arc::clone(&this);
                async move { this.post_certs_check(req).await }
            }),
        ));

        routes
    }
}

fn to_value<T: Serialize>(value: T) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| ApiError::Failed(e.to_string()))
}

fn invalid_amount() -> Value {
    json!({ "success": false, "errMsg": "invalid amount" })
}
