//! The request gatekeeper.
//!
//! A [`Gatekeeper`] owns the middleware chain (session, authentication
//! initialization, session restore, then any extra middlewares) and exposes
//! the operations built on top of it:
//!
//! * [`Gatekeeper::apply_middlewares`] runs the chain,
//! * [`Gatekeeper::control`] runs the chain and then a handler,
//! * [`Gatekeeper::auth`] runs the chain and an authentication attempt,
//! * [`Gatekeeper::access`] runs the chain and decides whether the current
//!   user may access a page,
//! * [`Gatekeeper::get_user`] runs the chain and returns the current user.

use std::sync::Arc;

use async_trait::async_trait;
use derive_more::with_trait::Debug;
use serde::{Deserialize, Serialize};
use tower_sessions::{MemoryStore, SessionStore};
use tracing::{debug, info};

use crate::auth::{AuthUser, AuthenticateOptions, Authenticator};
use crate::config::GatekeeperConfig;
use crate::context::RequestContext;
use crate::error::ErrorRepr;
use crate::handler::ContextHandler;
use crate::layer::GatekeeperLayer;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::session::SessionMiddleware;

/// The request gatekeeper.
///
/// A gatekeeper is built once, at startup, and shared by all requests; it is
/// cheap to clone. It never holds per-request state.
///
/// # Examples
///
/// ```
/// use gatekeeper::auth::{AuthUser, Authenticator, NoUserBackend, UserId};
/// use gatekeeper::config::{GatekeeperConfig, SecretKey};
/// use gatekeeper::{Gatekeeper, RequestContext};
///
/// #[derive(Clone)]
/// struct User(i64);
///
/// impl AuthUser for User {
///     fn id(&self) -> UserId {
///         UserId::Int(self.0)
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() -> gatekeeper::Result<()> {
/// let gatekeeper = Gatekeeper::builder(Authenticator::<User>::new(NoUserBackend))
///     .config(
///         GatekeeperConfig::builder()
///             .secret_key(SecretKey::from("keyboard cat"))
///             .build(),
///     )
///     .build()?;
///
/// let (mut cx, ()) = RequestContext::from_request(http::Request::new(()));
/// assert!(gatekeeper.get_user(&mut cx).await?.is_none());
/// # Ok(())
/// # }
/// ```
pub struct Gatekeeper<U> {
    inner: Arc<GatekeeperInner<U>>,
}

struct GatekeeperInner<U> {
    chain: MiddlewareChain,
    authenticator: Authenticator<U>,
    enabled: bool,
}

impl<U> Clone for Gatekeeper<U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<U> Debug for Gatekeeper<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatekeeper")
            .field("enabled", &self.inner.enabled)
            .field("chain", &self.inner.chain)
            .field("authenticator", &self.inner.authenticator)
            .finish()
    }
}

impl<U: AuthUser> Gatekeeper<U> {
    /// Creates a [`GatekeeperBuilder`] for the given authenticator.
    #[must_use]
    pub fn builder(authenticator: Authenticator<U>) -> GatekeeperBuilder<U> {
        GatekeeperBuilder {
            authenticator,
            config: GatekeeperConfig::default(),
            session_store: None,
            middlewares: Vec::new(),
        }
    }

    /// Creates a gatekeeper configured from the process environment.
    ///
    /// See [`GatekeeperConfig::from_env`] for the variables read.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment does not hold a valid
    /// configuration.
    pub fn from_env(authenticator: Authenticator<U>) -> crate::Result<Self> {
        Self::builder(authenticator)
            .config(GatekeeperConfig::from_env()?)
            .build()
    }

    /// Returns `false` if the gatekeeper is a no-op adapter.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Returns the middleware chain run for every request.
    #[must_use]
    pub fn chain(&self) -> &MiddlewareChain {
        &self.inner.chain
    }

    /// Returns the authenticator, configured with the gatekeeper's secret
    /// keys.
    #[must_use]
    pub fn authenticator(&self) -> &Authenticator<U> {
        &self.inner.authenticator
    }

    /// Returns a tower layer running this gatekeeper around a service.
    #[must_use]
    pub fn layer(&self) -> GatekeeperLayer<U> {
        GatekeeperLayer::new(self.clone())
    }

    /// Runs the middleware chain against `cx`.
    ///
    /// The middlewares run one after another, in order. The first failure
    /// stops the chain.
    ///
    /// # Errors
    ///
    /// Returns a middleware failure error carrying the value the failing
    /// middleware produced.
    pub async fn apply_middlewares(&self, cx: &mut RequestContext) -> crate::Result<()> {
        self.inner.chain.apply(cx).await
    }

    /// Wraps `next` so that it runs after the middleware chain.
    ///
    /// # Examples
    ///
    /// ```
    /// # use gatekeeper::auth::{AuthUser, Authenticator, NoUserBackend, UserId};
    /// # use gatekeeper::config::{GatekeeperConfig, SecretKey};
    /// use gatekeeper::{ContextHandler, Gatekeeper, RequestContext, handler_fn};
    /// # #[derive(Clone)]
    /// # struct User;
    /// # impl AuthUser for User {
    /// #     fn id(&self) -> UserId {
    /// #         UserId::Int(1)
    /// #     }
    /// # }
    ///
    /// # #[tokio::main]
    /// # async fn main() -> gatekeeper::Result<()> {
    /// # let gatekeeper = Gatekeeper::builder(Authenticator::<User>::new(NoUserBackend))
    /// #     .config(GatekeeperConfig::builder().secret_key(SecretKey::from("k")).build())
    /// #     .build()?;
    /// let page = gatekeeper.control(handler_fn(|cx| {
    ///     Box::pin(async move { Ok(cx.session().is_some()) })
    /// }));
    ///
    /// let (mut cx, ()) = RequestContext::from_request(http::Request::new(()));
    /// assert!(page.handle(&mut cx).await?);
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn control<H: ContextHandler>(&self, next: H) -> Control<U, H> {
        Control {
            gatekeeper: self.clone(),
            next,
        }
    }

    /// Creates a handler running the middleware chain and then an
    /// authentication attempt with the strategy registered under `strategy`.
    ///
    /// On success, the user is logged in and the response redirected to
    /// `success_redirect`; on failure, it is redirected to
    /// `failure_redirect`. See [`Authenticator::authenticate`].
    #[must_use]
    pub fn auth(
        &self,
        strategy: &str,
        success_redirect: &str,
        failure_redirect: &str,
    ) -> Control<U, Authenticate> {
        self.auth_with(
            strategy,
            AuthenticateOptions::redirects(success_redirect, failure_redirect),
        )
    }

    /// Like [`Gatekeeper::auth`], with optional redirect targets.
    #[must_use]
    pub fn auth_with(
        &self,
        strategy: &str,
        options: AuthenticateOptions,
    ) -> Control<U, Authenticate> {
        let chain = if self.inner.enabled {
            let middleware: Arc<dyn Middleware> =
                Arc::new(self.inner.authenticator.authenticate(strategy, options));
            MiddlewareChain::new([middleware])
        } else {
            MiddlewareChain::default()
        };
        self.control(Authenticate { chain })
    }

    /// Creates a handler deciding whether the current user may access a page.
    ///
    /// Access is granted if a user is attached after the middleware chain ran
    /// and `check` returns `true` for it. Then:
    ///
    /// * [`SuccessAction::Redirect`] produces a temporary redirect,
    /// * [`SuccessAction::Handler`] produces whatever the handler returns,
    /// * [`SuccessAction::Allow`] produces empty page props.
    ///
    /// Otherwise, the decision is a temporary redirect to `failure_redirect`.
    /// Without a failure redirect (or with an empty one), the decision is
    /// empty page props, which is the same as allowing access; use
    /// [`Access::is_granted`] to tell both cases apart.
    #[must_use]
    pub fn access<C>(
        &self,
        check: C,
        success: impl Into<SuccessAction>,
        failure_redirect: Option<&str>,
    ) -> Access<U, C>
    where
        C: Fn(&U) -> bool + Send + Sync,
    {
        Access {
            gatekeeper: self.clone(),
            check,
            success: success.into(),
            failure_redirect: failure_redirect
                .filter(|destination| !destination.is_empty())
                .map(ToOwned::to_owned),
        }
    }

    /// Runs the middleware chain and returns the user attached by it.
    ///
    /// # Errors
    ///
    /// Returns an error if a middleware fails.
    pub async fn get_user(&self, cx: &mut RequestContext) -> crate::Result<Option<U>> {
        self.apply_middlewares(cx).await?;
        Ok(cx.user::<U>().cloned())
    }
}

/// A builder for [`Gatekeeper`].
#[derive(Debug)]
pub struct GatekeeperBuilder<U> {
    authenticator: Authenticator<U>,
    config: GatekeeperConfig,
    session_store: Option<Arc<dyn SessionStore>>,
    #[debug(skip)]
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl<U: AuthUser> GatekeeperBuilder<U> {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: GatekeeperConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the store keeping session data. Defaults to an in-memory store.
    #[must_use]
    pub fn session_store(mut self, store: impl SessionStore) -> Self {
        self.session_store = Some(Arc::new(store));
        self
    }

    /// Adds a middleware running after the built-in ones.
    #[must_use]
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Builds the gatekeeper.
    ///
    /// # Errors
    ///
    /// Returns an error if the gatekeeper is enabled and the secret key is
    /// empty.
    pub fn build(self) -> crate::Result<Gatekeeper<U>> {
        let config = self.config;
        let authenticator = self.authenticator.with_secret_keys(&config);

        let chain = if config.enabled {
            if config.secret_key.is_empty() {
                return Err(ErrorRepr::MissingSecretKey.into());
            }
            let store: Arc<dyn SessionStore> = self
                .session_store
                .unwrap_or_else(|| Arc::new(MemoryStore::default()));

            let built_in: [Arc<dyn Middleware>; 3] = [
                Arc::new(SessionMiddleware::new(store, &config)),
                Arc::new(authenticator.initialize()),
                Arc::new(authenticator.restore()),
            ];
            built_in.into_iter().chain(self.middlewares).collect()
        } else {
            info!("gatekeeper disabled, no middleware will run");
            MiddlewareChain::default()
        };
        debug!(?chain, "gatekeeper built");

        Ok(Gatekeeper {
            inner: Arc::new(GatekeeperInner {
                chain,
                authenticator,
                enabled: config.enabled,
            }),
        })
    }
}

/// A handler running the middleware chain before another handler.
///
/// Created by [`Gatekeeper::control`].
#[derive(Debug, Clone)]
pub struct Control<U, H> {
    gatekeeper: Gatekeeper<U>,
    next: H,
}

#[async_trait]
impl<U: AuthUser, H: ContextHandler> ContextHandler for Control<U, H> {
    type Output = H::Output;

    async fn handle(&self, cx: &mut RequestContext) -> crate::Result<H::Output> {
        self.gatekeeper.apply_middlewares(cx).await?;
        self.next.handle(cx).await
    }
}

/// The handler running an authentication attempt.
///
/// Created by [`Gatekeeper::auth`].
#[derive(Debug, Clone)]
pub struct Authenticate {
    chain: MiddlewareChain,
}

#[async_trait]
impl ContextHandler for Authenticate {
    type Output = ();

    async fn handle(&self, cx: &mut RequestContext) -> crate::Result<()> {
        self.chain.apply(cx).await
    }
}

/// What an [`Access`] handler does when access is granted.
#[derive(Debug, Clone)]
pub enum SuccessAction {
    /// Redirect the client to the given destination.
    Redirect(String),
    /// Delegate the decision to a handler.
    Handler(#[debug(skip)] Arc<dyn ContextHandler<Output = AccessDecision>>),
    /// Let the page render with empty props.
    Allow,
}

impl SuccessAction {
    /// Creates a [`SuccessAction::Redirect`].
    #[must_use]
    pub fn redirect(destination: impl Into<String>) -> Self {
        Self::Redirect(destination.into())
    }

    /// Creates a [`SuccessAction::Handler`].
    #[must_use]
    pub fn handler(handler: impl ContextHandler<Output = AccessDecision> + 'static) -> Self {
        Self::Handler(Arc::new(handler))
    }
}

impl From<&str> for SuccessAction {
    fn from(destination: &str) -> Self {
        Self::redirect(destination)
    }
}

impl From<String> for SuccessAction {
    fn from(destination: String) -> Self {
        Self::Redirect(destination)
    }
}

/// The props passed to a page when access is allowed.
pub type Props = serde_json::Map<String, serde_json::Value>;

/// A redirect produced by an access decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTarget {
    /// Where to send the client.
    pub destination: String,
    /// Whether the redirect is permanent. Access decisions are never
    /// permanent, since they depend on who asks.
    pub permanent: bool,
}

/// The outcome of an [`Access`] handler.
///
/// Serializes to either `{"redirect": {"destination": ..., "permanent":
/// false}}` or `{"props": {...}}`.
///
/// # Examples
///
/// ```
/// use gatekeeper::AccessDecision;
///
/// let decision = AccessDecision::redirect("/login");
/// assert_eq!(
///     serde_json::to_string(&decision)?,
///     r#"{"redirect":{"destination":"/login","permanent":false}}"#
/// );
/// assert_eq!(serde_json::to_string(&AccessDecision::props())?, r#"{"props":{}}"#);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessDecision {
    /// Send the client elsewhere.
    Redirect(RedirectTarget),
    /// Render the page with these props.
    Props(Props),
}

impl AccessDecision {
    /// A temporary redirect to `destination`.
    #[must_use]
    pub fn redirect(destination: impl Into<String>) -> Self {
        Self::Redirect(RedirectTarget {
            destination: destination.into(),
            permanent: false,
        })
    }

    /// Empty page props.
    #[must_use]
    pub fn props() -> Self {
        Self::Props(Props::new())
    }

    /// Page props with the given content.
    #[must_use]
    pub fn with_props(props: Props) -> Self {
        Self::Props(props)
    }

    /// Returns the redirect destination, if this decision is a redirect.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        match self {
            Self::Redirect(target) => Some(&target.destination),
            Self::Props(_) => None,
        }
    }
}

/// A handler deciding whether the current user may access a page.
///
/// Created by [`Gatekeeper::access`].
#[derive(Debug, Clone)]
pub struct Access<U, C> {
    gatekeeper: Gatekeeper<U>,
    #[debug(skip)]
    check: C,
    success: SuccessAction,
    failure_redirect: Option<String>,
}

impl<U, C> Access<U, C>
where
    U: AuthUser,
    C: Fn(&U) -> bool + Send + Sync,
{
    /// Runs the middleware chain and returns whether a user is attached and
    /// passes the check.
    ///
    /// # Errors
    ///
    /// Returns an error if a middleware fails.
    pub async fn is_granted(&self, cx: &mut RequestContext) -> crate::Result<bool> {
        self.gatekeeper.apply_middlewares(cx).await?;
        Ok(cx.user::<U>().is_some_and(|user| (self.check)(user)))
    }
}

#[async_trait]
impl<U, C> ContextHandler for Access<U, C>
where
    U: AuthUser,
    C: Fn(&U) -> bool + Send + Sync,
{
    type Output = AccessDecision;

    async fn handle(&self, cx: &mut RequestContext) -> crate::Result<AccessDecision> {
        if self.is_granted(cx).await? {
            debug!(path = %cx.request().uri.path(), "access granted");
            match &self.success {
                SuccessAction::Redirect(destination) => Ok(AccessDecision::redirect(destination)),
                SuccessAction::Handler(handler) => handler.handle(cx).await,
                SuccessAction::Allow => Ok(AccessDecision::props()),
            }
        } else {
            debug!(path = %cx.request().uri.path(), "access denied");
            Ok(match &self.failure_redirect {
                Some(destination) => AccessDecision::redirect(destination),
                None => AccessDecision::props(),
            })
        }
    }
}
