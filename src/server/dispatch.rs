//! Uniform request envelope
//!
//! Every business function returns `Result<Value, ApiError>`. The dispatcher
//! turns that into a `200 OK` JSON response: the value itself on success,
//! `{"error": "..."}` on failure, and the same error shape if the function
//! panics. Authentication failures are handled earlier and are the only
//! responses with a different status.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use axum::body::{Body, Bytes};
use axum::extract::Query;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

use crate::backend::BackendError;

/// Largest request body accepted by API handlers.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Media type set on every dispatched response.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors a business function may return. The `Display` text is what the
/// client sees in the `error` field.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("request body too large")]
    BodyTooLarge,

    #[error("{0}")]
    Backend(#[from] BackendError),

    #[error("Blocked /open with url: {0}")]
    BlockedUrl(String),

    #[error("{0}")]
    Failed(String),
}

pub type HandlerResult = Result<Value, ApiError>;

/// A routed business function.
pub type HandlerFn = Arc<dyn Fn(ApiRequest) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap an async closure as a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |req| f(req).boxed())
}

/// Wrap a synchronous closure as a [`HandlerFn`].
///
/// The closure runs when the returned future is first polled, so a panic in
/// it is still caught by the dispatcher.
pub fn sync_handler<F>(f: F) -> HandlerFn
where
    F: Fn(ApiRequest) -> HandlerResult + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |req| {
        let f = Arc::clone(&f);
        async move { f(req) }.boxed()
    })
}

/// The parts of an HTTP request a business function can see.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiRequest {
    /// Buffer an incoming request, refusing bodies above [`MAX_BODY_BYTES`].
    pub async fn buffer(req: Request<Body>) -> Result<Self, ApiError> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|_| ApiError::BodyTooLarge)?;
        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        })
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// First value of a query parameter; empty when absent.
    pub fn query(&self, key: &str) -> String {
        Query::<HashMap<String, String>>::try_from_uri(&self.uri)
            .ok()
            .and_then(|Query(mut params)| params.remove(key))
            .unwrap_or_default()
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::InvalidBody(e.to_string()))
    }
}

/// Applies the response envelope around business functions.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    dev_origin: Option<HeaderValue>,
}

impl Dispatcher {
    /// `dev_origin` is only used when the gateway runs in development mode.
    pub fn new(dev_mode: bool, dev_origin: &str) -> Self {
        install_backtrace_hook();
        let dev_origin = if dev_mode {
            match HeaderValue::from_str(dev_origin) {
                Ok(v) => Some(v),
                Err(_) => {
                    error!(target: "http", origin = dev_origin, "invalid development origin");
                    None
                }
            }
        } else {
            None
        };
        Self { dev_origin }
    }

    /// Run `f` for a buffered request and produce the envelope response.
    pub async fn dispatch(&self, f: &HandlerFn, req: ApiRequest) -> Response {
        let path = req.path().to_string();
        let f = Arc::clone(f);
        let outcome = AssertUnwindSafe(async move { f(req).await })
            .catch_unwind()
            .await;

        let body = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                error!(target: "http", path = %path, error = %e, "endpoint failed");
                error_body(&e.to_string())
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                let trace = take_panic_backtrace().unwrap_or_default();
                error!(target: "http", path = %path, panic = true, "{}\n{}", msg, trace);
                error_body(&msg)
            }
        };
        self.respond(body)
    }

    /// Buffer `req` and dispatch it; body errors become the error envelope.
    pub async fn dispatch_request(&self, f: &HandlerFn, req: Request<Body>) -> Response {
        match ApiRequest::buffer(req).await {
            Ok(req) => self.dispatch(f, req).await,
            Err(e) => self.failure(&e),
        }
    }

    /// Envelope response for an error raised outside a business function.
    pub fn failure(&self, e: &ApiError) -> Response {
        error!(target: "http", error = %e, "request rejected");
        self.respond(error_body(&e.to_string()))
    }

    fn respond(&self, body: Value) -> Response {
        let bytes = match serde_json::to_vec(&body) {
            Ok(b) => b,
            Err(e) => {
                error!(target: "http", error = %e, "failed to serialize response");
                error_body(&e.to_string()).to_string().into_bytes()
            }
        };
        let mut resp = (StatusCode::OK, bytes).into_response();
        let headers = resp.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(JSON_CONTENT_TYPE),
        );
        if let Some(origin) = &self.dev_origin {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        }
        resp
    }
}

fn error_body(message: &str) -> Value {
    json!({ "error": message })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

thread_local! {
    static LAST_PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static BACKTRACE_HOOK: Once = Once::new();

/// Record a backtrace at the panic site so the barrier can log it after
/// unwinding. The previous hook still runs.
fn install_backtrace_hook() {
    BACKTRACE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_backtrace() -> Option<String> {
    LAST_PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}
