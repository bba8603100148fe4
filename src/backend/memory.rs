//! In-memory backend used in development mode and tests
//!
//! Holds a fixed set of coins, whatever accounts and devices are added at
//! runtime, and a table of exchange rates. Lifecycle changes are reported to
//! the attached observer and published on the event stream.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    Account, AccountAddError, AddAccountRequest, AppConfig, Backend, BackendError, BackendEvent,
    BackendObserver, Balance, Coin, Device, DeviceKind, HeadersStatus, Rates, UpdateInfo,
};

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const SERIALIZED_XKEY_LEN: usize = 111;
const MAINNET_PUBLIC: &[&str] = &["xpub", "ypub", "zpub", "Ltub", "Mtub"];
const TESTNET_PUBLIC: &[&str] = &["tpub", "upub", "vpub"];
const PRIVATE_PREFIXES: &[&str] = &[
    "xprv", "yprv", "zprv", "tprv", "uprv", "vprv", "Ltpv", "Mtpv",
];
const SCRIPT_TYPES: &[&str] = &["p2pkh", "p2wpkh-p2sh", "p2wpkh"];

#[derive(Debug)]
pub struct MemoryCoin {
    code: String,
    name: String,
    explorer_prefix: String,
    testnet: bool,
    headers: HeadersStatus,
}

impl MemoryCoin {
    fn new(code: &str, name: &str, explorer_prefix: &str, testnet: bool) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            explorer_prefix: explorer_prefix.to_string(),
            testnet,
            headers: HeadersStatus {
                tip: 0,
                tip_at_init_time: 0,
                target_height: 0,
            },
        }
    }
}

impl Coin for MemoryCoin {
    fn code(&self) -> &str {
        &self.code
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_explorer_tx_prefix(&self) -> &str {
        &self.explorer_prefix
    }

    fn headers_status(&self) -> Result<HeadersStatus, BackendError> {
        Ok(self.headers.clone())
    }
}

#[derive(Debug)]
pub struct MemoryAccount {
    code: String,
    name: String,
    coin: Arc<MemoryCoin>,
}

impl Account for MemoryAccount {
    fn code(&self) -> &str {
        &self.code
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn coin(&self) -> Arc<dyn Coin> {
        self.coin.clone()
    }

    fn balance(&self) -> Result<Balance, BackendError> {
        Ok(Balance {
            available: "0".to_string(),
            incoming: "0".to_string(),
        })
    }
}

#[derive(Debug)]
pub struct MemoryDevice {
    id: String,
    product_name: String,
    kind: DeviceKind,
}

impl Device for MemoryDevice {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn product_name(&self) -> &str {
        &self.product_name
    }

    fn kind(&self) -> DeviceKind {
        self.kind.clone()
    }

    fn info(&self) -> Result<Value, BackendError> {
        Ok(json!({
            "id": self.id,
            "name": self.product_name,
            "initialized": true,
        }))
    }
}

struct State {
    config: AppConfig,
    coins: HashMap<String, Arc<MemoryCoin>>,
    accounts: Vec<Arc<MemoryAccount>>,
    devices: BTreeMap<String, Arc<MemoryDevice>>,
    rates: Rates,
    keystore_pin: Option<String>,
    update: Option<UpdateInfo>,
    electrum_certs: HashMap<String, String>,
}

/// Backend whose entire state lives in process memory.
pub struct MemoryBackend {
    testing: bool,
    state: RwLock<State>,
    observer: RwLock<Option<Arc<dyn BackendObserver>>>,
    events: Mutex<Option<mpsc::UnboundedSender<BackendEvent>>>,
}

impl MemoryBackend {
    pub fn new(testing: bool) -> Self {
        let coins = [
            MemoryCoin::new("btc", "Bitcoin", "https://blockstream.info/tx/", false),
            MemoryCoin::new(
                "tbtc",
                "Bitcoin Testnet",
                "https://blockstream.info/testnet/tx/",
                true,
            ),
            MemoryCoin::new("ltc", "Litecoin", "https://insight.litecore.io/tx/", false),
            MemoryCoin::new(
                "tltc",
                "Litecoin Testnet",
                "http://explorer.litecointools.com/tx/",
                true,
            ),
        ]
        .into_iter()
        .map(|c| (c.code.clone(), Arc::new(c)))
        .collect();

        Self {
            testing,
            state: RwLock::new(State {
                config: AppConfig::default(),
                coins,
                accounts: Vec::new(),
                devices: BTreeMap::new(),
                rates: Rates::new(),
                keystore_pin: None,
                update: None,
                electrum_certs: HashMap::new(),
            }),
            observer: RwLock::new(None),
            events: Mutex::new(None),
        }
    }

    /// Add an account for `coin_code` and announce it.
    pub fn add_account(
        &self,
        code: &str,
        name: &str,
        coin_code: &str,
    ) -> Result<Arc<dyn Account>, BackendError> {
        let account = {
            let mut state = self.state.write();
            let coin = state
                .coins
                .get(coin_code)
                .cloned()
                .ok_or_else(|| BackendError::UnknownCoin(coin_code.to_string()))?;
            if let Some(existing) = state.accounts.iter().find(|a| a.code == code) {
                return Ok(existing.clone() as Arc<dyn Account>);
            }
            let account = Arc::new(MemoryAccount {
                code: code.to_string(),
                name: name.to_string(),
                coin,
            });
            state.accounts.push(account.clone());
            account
        };
        info!(target: "gateway", code, "account added");

        if let Some(observer) = self.observer() {
            observer.on_account_init(account.clone());
        }
        self.emit(BackendEvent::Backend {
            data: "accountsStatusChanged".to_string(),
        });
        Ok(account as Arc<dyn Account>)
    }

    /// Remove an account; returns false if it did not exist.
    pub fn remove_account(&self, code: &str) -> bool {
        let removed = {
            let mut state = self.state.write();
            let pos = state.accounts.iter().position(|a| a.code == code);
            pos.map(|i| state.accounts.remove(i))
        };
        let Some(account) = removed else {
            return false;
        };
        if let Some(observer) = self.observer() {
            observer.on_account_uninit(account);
        }
        self.emit(BackendEvent::Backend {
            data: "accountsStatusChanged".to_string(),
        });
        true
    }

    /// Register a device and announce it.
    pub fn attach_device(&self, id: &str, kind: DeviceKind, product_name: &str) {
        let device = Arc::new(MemoryDevice {
            id: id.to_string(),
            product_name: product_name.to_string(),
            kind,
        });
        self.state
            .write()
            .devices
            .insert(id.to_string(), device.clone());
        debug!(target: "gateway", device_id = id, "device attached");

        if let Some(observer) = self.observer() {
            observer.on_device_init(device);
        }
        self.emit(BackendEvent::Devices {
            data: "registeredChanged".to_string(),
        });
    }

    /// Deregister a device; returns false if it was not registered.
    pub fn detach_device(&self, id: &str) -> bool {
        if self.state.write().devices.remove(id).is_none() {
            return false;
        }
        if let Some(observer) = self.observer() {
            observer.on_device_uninit(id);
        }
        self.emit(BackendEvent::Devices {
            data: "registeredChanged".to_string(),
        });
        true
    }

    pub fn set_rate(&self, unit: &str, fiat: &str, rate: f64) {
        self.state
            .write()
            .rates
            .entry(unit.to_string())
            .or_default()
            .insert(fiat.to_string(), rate);
    }

    pub fn set_update(&self, update: Option<UpdateInfo>) {
        self.state.write().update = update;
    }

    /// Make `server` known with the given certificate.
    pub fn add_electrum_server(&self, server: &str, pem_cert: &str) {
        self.state
            .write()
            .electrum_certs
            .insert(server.to_string(), pem_cert.to_string());
    }

    pub fn keystore_pin(&self) -> Option<String> {
        self.state.read().keystore_pin.clone()
    }

    /// Publish an event; returns false before `start` or after the gateway is gone.
    pub fn emit(&self, event: BackendEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn observer(&self) -> Option<Arc<dyn BackendObserver>> {
        self.observer.read().clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn app_config(&self) -> AppConfig {
        self.state.read().config.clone()
    }

    fn set_app_config(&self, config: AppConfig) -> Result<(), BackendError> {
        if config.backend.use_proxy && config.backend.proxy_address.is_empty() {
            return Err(BackendError::InvalidConfig(
                "proxy enabled without an address".to_string(),
            ));
        }
        self.state.write().config = config;
        Ok(())
    }

    fn default_app_config(&self) -> AppConfig {
        AppConfig::default()
    }

    fn coin(&self, code: &str) -> Result<Arc<dyn Coin>, BackendError> {
        self.state
            .read()
            .coins
            .get(code)
            .map(|c| c.clone() as Arc<dyn Coin>)
            .ok_or_else(|| BackendError::UnknownCoin(code.to_string()))
    }

    fn accounts_status(&self) -> String {
        if self.state.read().accounts.is_empty() {
            "uninitialized".to_string()
        } else {
            "initialized".to_string()
        }
    }

    fn testing(&self) -> bool {
        self.testing
    }

    fn accounts(&self) -> Vec<Arc<dyn Account>> {
        self.state
            .read()
            .accounts
            .iter()
            .map(|a| a.clone() as Arc<dyn Account>)
            .collect()
    }

    fn add_watch_only_account(
        &self,
        request: &AddAccountRequest,
    ) -> Result<String, AccountAddError> {
        let coin = self
            .state
            .read()
            .coins
            .get(&request.coin_code)
            .cloned()
            .ok_or_else(|| BackendError::UnknownCoin(request.coin_code.clone()))?;
        if !SCRIPT_TYPES.contains(&request.script_type.as_str()) {
            return Err(BackendError::InvalidConfig(format!(
                "unknown script type {}",
                request.script_type
            ))
            .into());
        }
        check_extended_public_key(&request.extended_public_key, coin.testnet)?;

        let mut hasher = Sha256::new();
        hasher.update(request.script_type.as_bytes());
        hasher.update(request.extended_public_key.as_bytes());
        let digest = hasher.finalize();
        let hash: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
        let code = format!("{}-{}", hash, coin.code);

        self.add_account(&code, &request.account_name, &coin.code)?;
        Ok(code)
    }

    fn devices_registered(&self) -> Vec<Arc<dyn Device>> {
        self.state
            .read()
            .devices
            .values()
            .map(|d| d.clone() as Arc<dyn Device>)
            .collect()
    }

    fn register_test_keystore(&self, pin: &str) {
        self.state.write().keystore_pin = Some(pin.to_string());
        self.emit(BackendEvent::Backend {
            data: "keystoreRegistered".to_string(),
        });
    }

    fn deregister_keystore(&self) {
        self.state.write().keystore_pin = None;
    }

    fn rates(&self) -> Rates {
        self.state.read().rates.clone()
    }

    async fn download_cert(&self, server: &str) -> Result<String, BackendError> {
        self.state
            .read()
            .electrum_certs
            .get(server)
            .cloned()
            .ok_or_else(|| BackendError::Unavailable(format!("could not connect to {}", server)))
    }

    async fn check_electrum_server(&self, server: &str, pem_cert: &str) -> Result<(), BackendError> {
        match self.state.read().electrum_certs.get(server) {
            Some(known) if known == pem_cert => Ok(()),
            Some(_) => Err(BackendError::Unavailable(format!(
                "certificate mismatch for {}",
                server
            ))),
            None => Err(BackendError::Unavailable(format!(
                "could not connect to {}",
                server
            ))),
        }
    }

    async fn check_for_update(&self) -> Result<Option<UpdateInfo>, BackendError> {
        Ok(self.state.read().update.clone())
    }

    fn start(&self, observer: Arc<dyn BackendObserver>) -> mpsc::UnboundedReceiver<BackendEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        *self.observer.write() = Some(observer.clone());

        let (accounts, devices) = {
            let state = self.state.read();
            (state.accounts.clone(), state.devices.values().cloned().collect::<Vec<_>>())
        };
        for account in accounts {
            observer.on_account_init(account);
        }
        for device in devices {
            observer.on_device_init(device);
        }
        rx
    }
}

fn check_extended_public_key(key: &str, testnet: bool) -> Result<(), AccountAddError> {
    let prefix = key.get(..4).unwrap_or_default();
    if PRIVATE_PREFIXES.contains(&prefix) {
        return Err(AccountAddError::XprivEntered);
    }
    if key.len() != SERIALIZED_XKEY_LEN || !key.chars().all(|c| BASE58_ALPHABET.contains(c)) {
        return Err(AccountAddError::XpubInvalid);
    }
    let expected = if testnet {
        TESTNET_PUBLIC
    } else {
        MAINNET_PUBLIC
    };
    if expected.contains(&prefix) {
        return Ok(());
    }
    if MAINNET_PUBLIC.contains(&prefix) || TESTNET_PUBLIC.contains(&prefix) {
        return Err(AccountAddError::XpubWrongNet);
    }
    Err(AccountAddError::XpubInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xkey(prefix: &str) -> String {
        format!("{}{}", prefix, "A".repeat(SERIALIZED_XKEY_LEN - prefix.len()))
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl BackendObserver for Recorder {
        fn on_account_init(&self, account: Arc<dyn Account>) {
            self.calls.lock().push(format!("account+{}", account.code()));
        }
        fn on_account_uninit(&self, account: Arc<dyn Account>) {
            self.calls.lock().push(format!("account-{}", account.code()));
        }
        fn on_device_init(&self, device: Arc<dyn Device>) {
            self.calls.lock().push(format!("device+{}", device.identifier()));
        }
        fn on_device_uninit(&self, device_id: &str) {
            self.calls.lock().push(format!("device-{}", device_id));
        }
    }

    #[test]
    fn test_xpub_checks() {
        assert_eq!(check_extended_public_key(&xkey("xpub"), false), Ok(()));
        assert_eq!(check_extended_public_key(&xkey("tpub"), true), Ok(()));
        assert_eq!(
            check_extended_public_key(&xkey("xprv"), false),
            Err(AccountAddError::XprivEntered)
        );
        assert_eq!(
            check_extended_public_key(&xkey("tpub"), false),
            Err(AccountAddError::XpubWrongNet)
        );
        assert_eq!(
            check_extended_public_key("xpubshort", false),
            Err(AccountAddError::XpubInvalid)
        );
        assert_eq!(
            check_extended_public_key(&xkey("xpu0"), false),
            Err(AccountAddError::XpubInvalid)
        );
    }

    #[test]
    fn test_add_watch_only_account_is_deterministic() {
        let backend = MemoryBackend::new(false);
        let req = AddAccountRequest {
            coin_code: "btc".to_string(),
            script_type: "p2wpkh".to_string(),
            account_name: "Savings".to_string(),
            extended_public_key: xkey("zpub"),
        };
        let a = backend.add_watch_only_account(&req).unwrap();
        let b = backend.add_watch_only_account(&req).unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with("-btc"));
        assert_eq!(backend.accounts().len(), 1);
        assert_eq!(backend.accounts_status(), "initialized");
    }

    #[test]
    fn test_add_watch_only_account_unknown_coin() {
        let backend = MemoryBackend::new(false);
        let req = AddAccountRequest {
            coin_code: "doge".to_string(),
            script_type: "p2pkh".to_string(),
            ..Default::default()
        };
        assert_eq!(
            backend.add_watch_only_account(&req),
            Err(AccountAddError::Backend(BackendError::UnknownCoin(
                "doge".to_string()
            )))
        );
    }

    #[test]
    fn test_start_replays_existing_entities() {
        let backend = MemoryBackend::new(false);
        backend.add_account("acc1", "One", "btc").unwrap();
        backend.attach_device("dev1", DeviceKind::BitBox, "BitBox");

        let recorder = Arc::new(Recorder::default());
        let _rx = backend.start(recorder.clone());

        assert_eq!(
            *recorder.calls.lock(),
            vec!["account+acc1".to_string(), "device+dev1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_lifecycle_notifies_observer_and_emits() {
        let backend = MemoryBackend::new(false);
        let recorder = Arc::new(Recorder::default());
        let mut rx = backend.start(recorder.clone());

        backend.add_account("acc1", "One", "ltc").unwrap();
        assert!(backend.remove_account("acc1"));
        assert!(!backend.remove_account("acc1"));
        backend.attach_device("dev1", DeviceKind::BitBox, "BitBox");
        assert!(backend.detach_device("dev1"));

        assert_eq!(
            *recorder.calls.lock(),
            vec![
                "account+acc1".to_string(),
                "account-acc1".to_string(),
                "device+dev1".to_string(),
                "device-dev1".to_string(),
            ]
        );
        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            BackendEvent::Backend {
                data: "accountsStatusChanged".to_string()
            }
        );
    }

    #[test]
    fn test_emit_before_start_is_dropped() {
        let backend = MemoryBackend::new(false);
        assert!(!backend.emit(BackendEvent::Backend {
            data: "x".to_string()
        }));
    }

    #[tokio::test]
    async fn test_electrum_cert_lookup() {
        let backend = MemoryBackend::new(false);
        backend.add_electrum_server("electrum.example:50002", "PEM");

        assert_eq!(
            backend.download_cert("electrum.example:50002").await.unwrap(),
            "PEM"
        );
        assert!(backend.download_cert("other:1").await.is_err());
        assert!(backend
            .check_electrum_server("electrum.example:50002", "PEM")
            .await
            .is_ok());
        assert!(backend
            .check_electrum_server("electrum.example:50002", "OTHER")
            .await
            .is_err());
    }

    #[test]
    fn test_set_app_config_validates_proxy() {
        let backend = MemoryBackend::new(false);
        let mut cfg = AppConfig::default();
        cfg.backend.use_proxy = true;
        assert!(backend.set_app_config(cfg.clone()).is_err());
        cfg.backend.proxy_address = "127.0.0.1:9050".to_string();
        assert!(backend.set_app_config(cfg.clone()).is_ok());
        assert_eq!(backend.app_config(), cfg);
    }
}
