//! BitBox sub-handlers mounted under `/api/devices/{id}`

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use tracing::debug;

use crate::backend::Device;
use crate::server::dispatch::{sync_handler, ApiError, HandlerResult};
use crate::server::registry::{SubHandler, SubRouter};

pub struct DeviceHandlers {
    id: String,
    device: RwLock<Option<Arc<dyn Device>>>,
}

impl DeviceHandlers {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            device: RwLock::new(None),
        }
    }

    pub fn init(&self, device: Arc<dyn Device>) {
        debug!(target: "gateway", device_id = %self.id, "device handlers initialized");
        *self.device.write() = Some(device);
    }

    pub fn uninit(&self) {
        debug!(target: "gateway", device_id = %self.id, "device handlers uninitialized");
        *self.device.write() = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.device.read().is_some()
    }

    fn current(&self) -> Result<Arc<dyn Device>, ApiError> {
        self.device
            .read()
            .clone()
            .ok_or_else(|| ApiError::Failed("device not initialized".to_string()))
    }

    fn status(&self) -> HandlerResult {
        Ok(json!({ "initialized": self.is_initialized() }))
    }

    fn info(&self) -> HandlerResult {
        let device = self.current()?;
        Ok(json!({
            "deviceID": device.identifier(),
            "productName": device.product_name(),
        }))
    }

    fn device_info(&self) -> HandlerResult {
        Ok(self.current()?.info()?)
    }
}

impl SubHandler for DeviceHandlers {
    fn mount(self: &Arc<Self>, routes: &mut SubRouter) {
        let this = Arc::clone(self);
        routes.get("status", sync_handler(move |_| this.status()));
        let this = Arc::clone(self);
        routes.get("info", sync_handler(move |_| this.info()));
        let this = Arc::clone(self);
        routes.get("device-info", sync_handler(move |_| this.device_info()));
    }
}
