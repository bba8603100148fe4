//! Route table for the `/api` tree
//!
//! Static endpoints are registered once at startup. Account and device
//! subtrees are resolved per request through the entity registries, so a
//! subtree becomes reachable as soon as its entry is mounted. Every route,
//! including `/api/events`, sits behind the token gate.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, on, MethodFilter};
use axum::Router;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendEvent};
use crate::server::auth::token_gate;
use crate::server::connection::ConnectionDescriptor;
use crate::server::dispatch::Dispatcher;
use crate::server::events::{events_handler, EventBridge};
use crate::server::handlers::{EntityRegistries, Handlers, OpenPolicy, UrlOpener};
use crate::server::registry::SubRouter;

/// Shared state behind the API routes.
pub struct ApiState {
    backend: Arc<dyn Backend>,
    handlers: Arc<Handlers>,
    registries: Arc<EntityRegistries>,
    dispatcher: Dispatcher,
}

impl ApiState {
    pub fn new(
        backend: Arc<dyn Backend>,
        opener: Arc<dyn UrlOpener>,
        policy: OpenPolicy,
        dispatcher: Dispatcher,
    ) -> Self {
        let handlers = Arc::new(Handlers::new(Arc::clone(&backend), opener, policy));
        Self {
            backend,
            handlers,
            registries: Arc::new(EntityRegistries::new()),
            dispatcher,
        }
    }

    /// Attach the registries to the backend and take its event stream.
    pub fn start_backend(&self) -> mpsc::UnboundedReceiver<BackendEvent> {
        self.backend.start(self.registries.clone())
    }

    pub fn registries(&self) -> &Arc<EntityRegistries> {
        &self.registries
    }
}

/// Build the complete router: API routes, event socket, and the token gate.
pub fn create_router(
    api: Arc<ApiState>,
    bridge: Arc<EventBridge>,
    descriptor: Arc<ConnectionDescriptor>,
) -> Router {
    let mut router: Router<Arc<ApiState>> = Router::new();

    for (method, path, f) in api.handlers.static_routes() {
        let filter = match MethodFilter::try_from(method.clone()) {
            Ok(filter) => filter,
            Err(_) => {
                warn!(target: "http", %method, path = %path, "unsupported method; route skipped");
                continue;
            }
        };
        let dispatcher = api.dispatcher.clone();
        router = router.route(
            &path,
            on(filter, move |req: Request<Body>| {
                let dispatcher = dispatcher.clone();
                let f = Arc::clone(&f);
                async move { dispatcher.dispatch_request(&f, req).await }
            }),
        );
    }

    let router = router
        .route("/api/account/:code/*rest", axum::routing::any(account_subtree))
        .route("/api/devices/:id/*rest", axum::routing::any(device_subtree))
        .with_state(api);

    let events = Router::new()
        .route("/api/events", get(events_handler))
        .with_state(bridge);

    router
        .merge(events)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(descriptor, token_gate))
}

async fn account_subtree(
    State(api): State<Arc<ApiState>>,
    Path((code, rest)): Path<(String, String)>,
    req: Request<Body>,
) -> Response {
    match api.registries.accounts.lookup(&code) {
        Some(entry) => dispatch_subtree(&api.dispatcher, entry.routes(), &rest, req).await,
        None => {
            debug!(target: "http", code = %code, "no handlers for account");
            not_found().await
        }
    }
}

async fn device_subtree(
    State(api): State<Arc<ApiState>>,
    Path((id, rest)): Path<(String, String)>,
    req: Request<Body>,
) -> Response {
    match api.registries.devices.lookup(&id) {
        Some(entry) => dispatch_subtree(&api.dispatcher, entry.routes(), &rest, req).await,
        None => {
            debug!(target: "http", device_id = %id, "no handlers for device");
            not_found().await
        }
    }
}

async fn dispatch_subtree(
    dispatcher: &Dispatcher,
    routes: &SubRouter,
    rest: &str,
    req: Request<Body>,
) -> Response {
    match routes.resolve(req.method(), rest) {
        Some(f) => {
            let f = Arc::clone(f);
            dispatcher.dispatch_request(&f, req).await
        }
        None => not_found().await,
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 page not found").into_response()
}
