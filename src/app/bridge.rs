//! Application callback contract and the adapter that invokes it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use super::request::Request;
use super::response::{BodyStream, Response};

/// Failure reported by the application. The message is logged, never sent
/// to the client.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct AppError(String);

impl AppError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// The application behind the server: one request in, one response out.
pub trait Application: Send + Sync + 'static {
    fn call(&self, request: Request) -> Result<Response, AppError>;
}

impl<F> Application for F
where
    F: Fn(Request) -> Result<Response, AppError> + Send + Sync + 'static,
{
    fn call(&self, request: Request) -> Result<Response, AppError> {
        self(request)
    }
}

/// Runs the synchronous callback off the event loop, exactly once per
/// request, and turns failures into a generic 500.
#[derive(Clone)]
pub struct AppBridge {
    app: Arc<dyn Application>,
}

impl AppBridge {
    pub fn new(app: Arc<dyn Application>) -> Self {
        Self { app }
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let app = Arc::clone(&self.app);
        let request_id = request.context.request_id;
        let joined = tokio::task::spawn_blocking(move || {
            panic::catch_unwind(AssertUnwindSafe(move || app.call(request)))
        })
        .await;

        match joined {
            Ok(Ok(Ok(response))) => response,
            Ok(Ok(Err(e))) => {
                tracing::error!(request_id = %request_id, error = %e, "Application returned an error");
                internal_error()
            }
            Ok(Err(payload)) => {
                tracing::error!(request_id = %request_id, panic = %panic_message(payload.as_ref()), "Application panicked");
                internal_error()
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Application task failed");
                internal_error()
            }
        }
    }
}

/// Pull the next chunk of a response body. A panic in the body iterator
/// is returned as an error.
pub fn pull_chunk(body: &mut BodyStream) -> Result<Option<Bytes>, AppError> {
    panic::catch_unwind(AssertUnwindSafe(|| body.next())).map_err(|payload| {
        metrics::counter!("app_errors_total").increment(1);
        AppError::new(format!("response body panicked: {}", panic_message(payload.as_ref())))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn internal_error() -> Response {
    metrics::counter!("app_errors_total").increment(1);
    Response::status_only(500)
}
