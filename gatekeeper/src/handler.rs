use std::marker::PhantomData;

use async_trait::async_trait;
use derive_more::with_trait::Debug;
use futures_util::future::BoxFuture;

use crate::context::RequestContext;

/// A function that handles a request context once the gatekeeper is done
/// with it.
///
/// This is what [`Gatekeeper::control`](crate::Gatekeeper::control) wraps.
/// [`Control`](crate::Control) and [`Access`](crate::Access) implement it
/// too, so they can be nested.
#[async_trait]
pub trait ContextHandler: Send + Sync {
    /// The value produced by the handler.
    type Output: Send;

    /// Handles the request context.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler fails.
    async fn handle(&self, cx: &mut RequestContext) -> crate::Result<Self::Output>;
}

/// Creates a [`ContextHandler`] from a closure returning a boxed future.
///
/// # Examples
///
/// ```
/// use gatekeeper::{ContextHandler, RequestContext, handler_fn};
///
/// # #[tokio::main]
/// # async fn main() -> gatekeeper::Result<()> {
/// let handler = handler_fn(|cx| {
///     Box::pin(async move { Ok(cx.request().uri.path().to_owned()) })
/// });
///
/// let request = http::Request::get("/inbox").body(()).unwrap();
/// let (mut cx, ()) = RequestContext::from_request(request);
/// assert_eq!(handler.handle(&mut cx).await?, "/inbox");
/// # Ok(())
/// # }
/// ```
pub fn handler_fn<F, R>(f: F) -> HandlerFn<F, R>
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, crate::Result<R>> + Send + Sync,
    R: Send,
{
    HandlerFn {
        f,
        _output: PhantomData,
    }
}

/// A [`ContextHandler`] created by [`handler_fn`].
#[derive(Debug, Copy, Clone)]
pub struct HandlerFn<F, R> {
    #[debug(skip)]
    f: F,
    #[debug(skip)]
    _output: PhantomData<fn() -> R>,
}

#[async_trait]
impl<F, R> ContextHandler for HandlerFn<F, R>
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, crate::Result<R>> + Send + Sync,
    R: Send,
{
    type Output = R;

    async fn handle(&self, cx: &mut RequestContext) -> crate::Result<R> {
        (self.f)(cx).await
    }
}
