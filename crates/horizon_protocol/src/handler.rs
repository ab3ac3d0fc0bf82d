//! Request handlers.
//!
//! The dispatcher only knows the erased [`RequestHandler`] trait: it hands
//! over the bound arguments with the body already decoded into a
//! `serde_json::Value`, and gets a future resolving to the response value.
//! Application code registers plain closures through [`handler_fn`], which
//! does the typed conversion on both sides.

use crate::context::CallContext;
use crate::error::ErrorCode;
use crate::session::SessionRef;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// How a handler failed.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// An expected business failure. The code and message go to the caller.
    #[error("domain error {code}: {message}")]
    Domain { code: ErrorCode, message: String },
    /// Anything else. Logged in full; the caller only sees `ErrorCode::UNKNOWN`.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl HandlerError {
    pub fn domain(code: ErrorCode, message: impl Into<String>) -> Self {
        HandlerError::Domain {
            code,
            message: message.into(),
        }
    }

    pub fn unexpected(error: impl std::fmt::Display) -> Self {
        HandlerError::Unexpected(error.to_string())
    }
}

/// Body of a request bound with push targets: the identities to fan out to,
/// plus the actual request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub targets: Vec<i64>,
    #[serde(default)]
    pub body: Value,
}

/// Arguments as bound by the dispatcher. Unbound parameters keep their
/// defaults: no session, a null body, no push targets.
#[derive(Debug, Clone, Default)]
pub struct RawArgs {
    pub ctx: CallContext,
    pub session: Option<SessionRef>,
    pub body: Value,
    pub push_targets: Vec<i64>,
}

/// Typed arguments handed to closures registered with [`handler_fn`].
#[derive(Debug, Clone)]
pub struct HandlerArgs<T> {
    pub ctx: CallContext,
    pub session: Option<SessionRef>,
    pub body: T,
    pub push_targets: Vec<i64>,
}

impl<T> HandlerArgs<T> {
    /// Caller identity, 0 when none is bound.
    pub fn identity(&self) -> i64 {
        self.ctx.identity
    }
}

/// Response value of a handler. `Value::Null` means "no response body".
pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

/// A bound, callable handler.
///
/// `call` runs on the business worker that owns the caller's identity. Work
/// done before the returned future is first polled happens there too.
pub trait RequestHandler: Send + Sync {
    fn call(&self, args: RawArgs) -> HandlerFuture;
}

struct FnHandler<T, R, F> {
    handler: F,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R, F, Fut> RequestHandler for FnHandler<T, R, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(HandlerArgs<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    fn call(&self, args: RawArgs) -> HandlerFuture {
        let body: T = match serde_json::from_value(args.body) {
            Ok(body) => body,
            Err(e) => {
                let error = HandlerError::domain(ErrorCode::BAD_REQUEST, format!("malformed request body: {e}"));
                return Box::pin(async move { Err(error) });
            }
        };

        let response = (self.handler)(HandlerArgs {
            ctx: args.ctx,
            session: args.session,
            body,
            push_targets: args.push_targets,
        });

        Box::pin(async move {
            let response = response.await?;
            serde_json::to_value(response)
                .map_err(|e| HandlerError::unexpected(format!("failed to serialize response: {e}")))
        })
    }
}

/// Wraps an async closure as a [`RequestHandler`].
///
/// The request body is decoded into `T`; a body that does not fit is answered
/// with `ErrorCode::BAD_REQUEST` without calling the closure. Returning `()`
/// or `None` produces no response body.
///
/// # Example
///
/// ```rust
/// use horizon_protocol::{handler_fn, HandlerArgs, HandlerError};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// struct Add { x: i64 }
///
/// #[derive(Serialize)]
/// struct Sum { x: i64 }
///
/// let handler = handler_fn(|args: HandlerArgs<Add>| async move {
///     Ok::<_, HandlerError>(Sum { x: args.body.x + 1 })
/// });
/// ```
pub fn handler_fn<T, R, F, Fut>(handler: F) -> Arc<dyn RequestHandler>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(HandlerArgs<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        handler,
        _marker: PhantomData,
    })
}
