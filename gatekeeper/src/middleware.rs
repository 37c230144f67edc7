//! Middlewares run by the gatekeeper.
//!
//! A middleware inspects and modifies a [`RequestContext`] and then signals
//! either success or failure. The gatekeeper runs a fixed, ordered list of
//! them, a [`MiddlewareChain`], before any of its operations.
//!
//! Middlewares can be written in two styles:
//!
//! * as a type implementing the async [`Middleware`] trait, or
//! * as a callback receiving the context and a [`Completion`], which must be
//!   signalled once the middleware is done; see [`from_callback`] and
//!   [`run_middleware`].

use std::sync::Arc;

use async_trait::async_trait;
use derive_more::with_trait::Debug;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::{BoxError, ErrorRepr};

/// A unit of request processing which either succeeds or fails.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Processes the request context.
    ///
    /// # Errors
    ///
    /// Returns the failure value of the middleware. The chain stops at the
    /// first failure and reports this exact value.
    async fn handle(&self, cx: &mut RequestContext) -> Result<(), BoxError>;

    /// The name of the middleware, used in errors and logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The completion signal handed to callback-style middlewares.
///
/// Signalling consumes the completion, so a middleware can succeed or fail
/// at most once. Dropping it without signalling makes [`run_middleware`]
/// fail with [`CompletionDropped`].
pub struct Completion<T> {
    sender: oneshot::Sender<Result<T, BoxError>>,
}

impl<T> Completion<T> {
    /// Signals that the middleware succeeded with `value`.
    pub fn complete(self, value: T) {
        // the receiver is gone only if the caller stopped waiting
        let _ = self.sender.send(Ok(value));
    }

    /// Signals that the middleware failed with `error`.
    pub fn fail<E>(self, error: E)
    where
        E: Into<BoxError>,
    {
        let _ = self.sender.send(Err(error.into()));
    }
}

impl<T> Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

/// The error reported when a callback-style middleware dropped its
/// [`Completion`] without signalling it.
#[derive(Debug, Copy, Clone, Error)]
#[error("middleware dropped its completion without signalling it")]
pub struct CompletionDropped;

/// Runs a callback-style middleware and waits until it signals completion.
///
/// `callback` is invoked exactly once with the context and a [`Completion`].
/// The returned future resolves with the value passed to
/// [`Completion::complete`], or with the error passed to
/// [`Completion::fail`]. The completion may be signalled from another task.
///
/// # Errors
///
/// Returns the failure value signalled by the middleware, or
/// [`CompletionDropped`] if the completion was dropped without a signal.
///
/// # Examples
///
/// ```
/// use gatekeeper::RequestContext;
/// use gatekeeper::middleware::run_middleware;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), gatekeeper::BoxError> {
/// let (mut cx, ()) = RequestContext::from_request(http::Request::new(()));
///
/// let status = run_middleware(&mut cx, |cx, done| {
///     cx.response_mut().status = http::StatusCode::ACCEPTED;
///     done.complete(cx.response().status);
/// })
/// .await?;
///
/// assert_eq!(status, http::StatusCode::ACCEPTED);
/// # Ok(())
/// # }
/// ```
pub async fn run_middleware<T, F>(cx: &mut RequestContext, callback: F) -> Result<T, BoxError>
where
    T: Send,
    F: FnOnce(&mut RequestContext, Completion<T>),
{
    let (sender, receiver) = oneshot::channel();
    callback(cx, Completion { sender });

    match receiver.await {
        Ok(result) => result,
        Err(_) => Err(Box::new(CompletionDropped)),
    }
}

/// Wraps a callback-style function into a [`Middleware`].
///
/// # Examples
///
/// ```
/// use gatekeeper::middleware::{Middleware, from_callback};
///
/// let middleware = from_callback("powered-by", |cx, done| {
///     cx.response_mut()
///         .headers
///         .insert("x-powered-by", http::HeaderValue::from_static("gatekeeper"));
///     done.complete(());
/// });
///
/// assert_eq!(middleware.name(), "powered-by");
/// ```
#[must_use]
pub fn from_callback<F>(name: &'static str, callback: F) -> CallbackMiddleware<F>
where
    F: Fn(&mut RequestContext, Completion<()>) + Send + Sync + 'static,
{
    CallbackMiddleware { name, callback }
}

/// A [`Middleware`] created by [`from_callback`].
#[derive(Debug, Clone)]
pub struct CallbackMiddleware<F> {
    name: &'static str,
    #[debug(skip)]
    callback: F,
}

#[async_trait]
impl<F> Middleware for CallbackMiddleware<F>
where
    F: Fn(&mut RequestContext, Completion<()>) + Send + Sync + 'static,
{
    async fn handle(&self, cx: &mut RequestContext) -> Result<(), BoxError> {
        run_middleware(cx, |cx, done| (self.callback)(cx, done)).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// An ordered, immutable list of middlewares.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use gatekeeper::RequestContext;
/// use gatekeeper::middleware::{Middleware, MiddlewareChain, from_callback};
///
/// # #[tokio::main]
/// # async fn main() -> gatekeeper::Result<()> {
/// let chain = MiddlewareChain::new([
///     Arc::new(from_callback("ok", |_, done| done.complete(()))) as Arc<dyn Middleware>,
///     Arc::new(from_callback("broken", |_, done| done.fail("broken"))) as Arc<dyn Middleware>,
/// ]);
///
/// let (mut cx, ()) = RequestContext::from_request(http::Request::new(()));
/// let error = chain.apply(&mut cx).await.unwrap_err();
///
/// assert_eq!(error.failed_middleware(), Some("broken"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Arc<[Arc<dyn Middleware>]>,
}

impl MiddlewareChain {
    /// Creates a chain running `middlewares` in iteration order.
    #[must_use]
    pub fn new<I>(middlewares: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Middleware>>,
    {
        Self {
            middlewares: middlewares.into_iter().collect(),
        }
    }

    /// Returns the number of middlewares in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Returns `true` if the chain has no middlewares.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Returns the names of the middlewares, in order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.middlewares.iter().map(|middleware| middleware.name())
    }

    /// Runs every middleware in order against `cx`.
    ///
    /// Each middleware is awaited before the next one starts. The first
    /// failure stops the chain; the remaining middlewares are not run.
    ///
    /// # Errors
    ///
    /// Returns a middleware failure error carrying the name of the failing
    /// middleware and the value it failed with.
    pub async fn apply(&self, cx: &mut RequestContext) -> crate::Result<()> {
        for middleware in self.middlewares.iter() {
            let name = middleware.name();
            debug!(middleware = name, "applying middleware");

            if let Err(source) = middleware.handle(cx).await {
                warn!(middleware = name, error = %source, "middleware failed");
                return Err(ErrorRepr::MiddlewareFailure {
                    middleware: name.to_owned(),
                    source,
                }
                .into());
            }
        }
        Ok(())
    }
}

impl Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FromIterator<Arc<dyn Middleware>> for MiddlewareChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Middleware>>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockall::Sequence;
    use tracing_test::traced_test;

    use super::*;

    fn context() -> RequestContext {
        RequestContext::from_request(http::Request::get("/").body(()).unwrap()).0
    }

    fn mock(name: &'static str) -> MockMiddleware {
        let mut middleware = MockMiddleware::new();
        middleware.expect_name().return_const(name);
        middleware
    }

    #[tokio::test]
    async fn run_middleware_complete() {
        let mut cx = context();

        let value = run_middleware(&mut cx, |_, done| done.complete(42)).await;

        assert_eq!(value.unwrap(), 42);
    }

    #[tokio::test]
    async fn run_middleware_fail() {
        let mut cx = context();

        let error = run_middleware::<(), _>(&mut cx, |_, done| done.fail("denied"))
            .await
            .unwrap_err();

        assert_eq!(error.to_string(), "denied");
    }

    #[tokio::test]
    async fn run_middleware_dropped_completion() {
        let mut cx = context();

        let error = run_middleware::<(), _>(&mut cx, |_, done| drop(done))
            .await
            .unwrap_err();

        assert!(error.is::<CompletionDropped>());
    }

    #[tokio::test]
    async fn run_middleware_completes_from_other_task() {
        let mut cx = context();

        let value = run_middleware(&mut cx, |_, done| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.complete("late");
            });
        })
        .await;

        assert_eq!(value.unwrap(), "late");
    }

    #[tokio::test]
    async fn callback_middleware_modifies_context() {
        let middleware = from_callback("accept", |cx, done| {
            cx.response_mut().status = http::StatusCode::ACCEPTED;
            done.complete(());
        });
        let mut cx = context();

        middleware.handle(&mut cx).await.unwrap();

        assert_eq!(middleware.name(), "accept");
        assert_eq!(cx.response().status, http::StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn chain_runs_in_order() {
        let mut seq = Sequence::new();
        let mut middlewares: Vec<Arc<dyn Middleware>> = Vec::new();
        for name in ["session", "initialize", "restore"] {
            let mut middleware = mock(name);
            middleware
                .expect_handle()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
            middlewares.push(Arc::new(middleware));
        }
        let chain = MiddlewareChain::new(middlewares);

        chain.apply(&mut context()).await.unwrap();

        assert_eq!(
            chain.names().collect::<Vec<_>>(),
            ["session", "initialize", "restore"]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn chain_stops_at_first_failure() {
        let mut first = mock("first");
        first.expect_handle().times(1).returning(|_| Ok(()));
        let mut second = mock("second");
        second
            .expect_handle()
            .times(1)
            .returning(|_| Err("store offline".into()));
        let mut third = mock("third");
        third.expect_handle().never();
        let middlewares: [Arc<dyn Middleware>; 3] =
            [Arc::new(first), Arc::new(second), Arc::new(third)];
        let chain = MiddlewareChain::new(middlewares);

        let error = chain.apply(&mut context()).await.unwrap_err();

        assert!(error.is_middleware_failure());
        assert_eq!(error.failed_middleware(), Some("second"));
        assert_eq!(error.middleware_source().unwrap().to_string(), "store offline");
        assert!(logs_contain("middleware failed"));
    }

    #[tokio::test]
    async fn empty_chain_is_noop() {
        let chain = MiddlewareChain::default();
        let mut cx = context();

        chain.apply(&mut cx).await.unwrap();

        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
        assert_eq!(format!("{chain:?}"), "[]");
    }
}
