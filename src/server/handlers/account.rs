//! Per-account sub-handlers mounted under `/api/account/{code}`

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use tracing::debug;

use crate::backend::Account;
use crate::server::dispatch::{sync_handler, ApiError, HandlerResult};
use crate::server::registry::{SubHandler, SubRouter};

pub struct AccountHandlers {
    code: String,
    account: RwLock<Option<Arc<dyn Account>>>,
}

impl AccountHandlers {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            account: RwLock::new(None),
        }
    }

    pub fn init(&self, account: Arc<dyn Account>) {
        debug!(target: "gateway", code = %self.code, "account handlers initialized");
        *self.account.write() = Some(account);
    }

    pub fn uninit(&self) {
        debug!(target: "gateway", code = %self.code, "account handlers uninitialized");
        *self.account.write() = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.account.read().is_some()
    }

    fn current(&self) -> Result<Arc<dyn Account>, ApiError> {
        self.account
            .read()
            .clone()
            .ok_or_else(|| ApiError::Failed("account not initialized".to_string()))
    }

    fn status(&self) -> HandlerResult {
        Ok(json!({ "initialized": self.is_initialized() }))
    }

    fn info(&self) -> HandlerResult {
        let account = self.current()?;
        let coin = account.coin();
        Ok(json!({
            "code": account.code(),
            "name": account.name(),
            "coinCode": coin.code(),
            "blockExplorerTxPrefix": coin.block_explorer_tx_prefix(),
        }))
    }

    fn balance(&self) -> HandlerResult {
        let balance = self.current()?.balance()?;
        serde_json::to_value(balance).map_err(|e| ApiError::Failed(e.to_string()))
    }
}

impl SubHandler for AccountHandlers {
    fn mount(self: &Arc<Self>, routes: &mut SubRouter) {
        let this = Arc::clone(self);
        routes.get("status", sync_handler(move |_| this.status()));
        let this = Arc::clone(self);
        routes.get("info", sync_handler(move |_| this.info()));
        let this = Arc::clone(self);
        routes.get("balance", sync_handler(move |_| this.balance()));
    }
}

impl std::fmt::Debug for AccountHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountHandlers")
            .field("code", &self.code)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
