//! Authentication support.
//!
//! This module provides the authentication provider of the gatekeeper. It
//! includes traits for user objects, user backends and authentication
//! strategies, and the [`Authenticator`] producing the authentication
//! middlewares:
//!
//! * [`Authenticator::initialize`] makes the authenticator available to the
//!   rest of the request processing,
//! * [`Authenticator::restore`] restores the logged-in user from the session,
//! * [`Authenticator::authenticate`] runs one named [`Strategy`] and logs the
//!   user in on success.
//!
//! Concrete strategies (password forms, OAuth, tokens...) are not part of
//! this crate; they are provided by implementing [`Strategy`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use http::header::InvalidHeaderValue;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{GatekeeperConfig, SecretKey};
use crate::context::RequestContext;
use crate::error::BoxError;
use crate::middleware::{Middleware, from_callback};
use crate::session::Session;

const USER_ID_SESSION_KEY: &str = "_auth_user_id";
const SESSION_HASH_SESSION_KEY: &str = "_auth_session_hash";

/// An error that occurs during authentication.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// An error occurred while accessing the session object.
    #[error("Error while accessing the session object")]
    SessionAccess(#[from] tower_sessions::session::Error),
    /// An error occurred while accessing the user object.
    #[error("Error while accessing the user object")]
    UserBackend(#[source] BoxError),
    /// An error occurred inside an authentication strategy.
    #[error("Authentication strategy failed")]
    Strategy(#[source] BoxError),
    /// No strategy is registered under the requested name.
    #[error("Unknown authentication strategy `{0}`")]
    UnknownStrategy(String),
    /// The authentication middlewares have not been run for the request.
    #[error("Authentication has not been initialized for this request")]
    NotInitialized,
    /// There is no session attached to the request.
    #[error("Authentication requires session support")]
    SessionMissing,
    /// A redirect target is not a valid `Location` header value.
    #[error("Invalid redirect target: {0}")]
    InvalidRedirect(#[from] InvalidHeaderValue),
}

impl AuthError {
    /// Creates a new [`AuthError::UserBackend`] error from a backend error.
    ///
    /// # Examples
    ///
    /// ```
    /// use gatekeeper::auth::AuthError;
    ///
    /// let error = AuthError::backend_error(std::io::Error::other("database offline"));
    /// ```
    pub fn backend_error(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::UserBackend(Box::new(error))
    }

    /// Creates a new [`AuthError::Strategy`] error from a strategy error.
    pub fn strategy_error(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Strategy(Box::new(error))
    }
}

/// The result type for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// A user object that can be authenticated.
///
/// Instances are produced by a [`Strategy`] when logging in, and by a
/// [`UserBackend`] when restoring a login from the session.
pub trait AuthUser: Clone + Send + Sync + 'static {
    /// Returns the user's ID, which is stored in the session.
    fn id(&self) -> UserId;

    /// Returns the user's session authentication hash.
    ///
    /// The hash is stored in the session on login and compared on every
    /// restore. If it no longer matches (for instance because it is derived
    /// from the password hash and the password was changed), the user is
    /// logged out. If a user returns [`Some`] hash for one secret key, it
    /// should return [`Some`] hash for any other secret key.
    ///
    /// If this method returns `None`, the hash is not checked.
    ///
    /// # Examples
    ///
    /// ```
    /// use gatekeeper::auth::{AuthUser, SessionAuthHash, UserId};
    /// use gatekeeper::config::SecretKey;
    /// use hmac::{Hmac, Mac};
    /// use sha2::Sha512;
    ///
    /// #[derive(Clone)]
    /// struct MyUser {
    ///     id: i64,
    ///     password_hash: String,
    /// }
    ///
    /// type SessionAuthHmac = Hmac<Sha512>;
    ///
    /// impl AuthUser for MyUser {
    ///     fn id(&self) -> UserId {
    ///         UserId::Int(self.id)
    ///     }
    ///
    ///     fn session_auth_hash(&self, secret_key: &SecretKey) -> Option<SessionAuthHash> {
    ///         let mut mac = SessionAuthHmac::new_from_slice(secret_key.as_bytes())
    ///             .expect("HMAC can take key of any size");
    ///         mac.update(self.password_hash.as_bytes());
    ///         let hmac_data = mac.finalize().into_bytes();
    ///
    ///         Some(SessionAuthHash::new(&hmac_data))
    ///     }
    /// }
    /// ```
    #[expect(unused_variables)]
    fn session_auth_hash(&self, secret_key: &SecretKey) -> Option<SessionAuthHash> {
        None
    }
}

/// A user ID that can be either an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    /// An integer user ID.
    Int(i64),
    /// A string user ID.
    String(String),
}

impl UserId {
    /// Returns the user ID as an integer.
    ///
    /// Returns [`None`] if the user ID is not an integer.
    ///
    /// # Examples
    ///
    /// ```
    /// use gatekeeper::auth::UserId;
    ///
    /// let user_id = UserId::Int(42);
    /// assert_eq!(user_id.as_int(), Some(42));
    /// ```
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(id) => Some(*id),
            Self::String(_) => None,
        }
    }

    /// Returns the user ID as a string.
    ///
    /// Returns [`None`] if the user ID is not a string.
    #[must_use]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::Int(_) => None,
            Self::String(id) => Some(id),
        }
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

/// A session authentication hash.
///
/// See [`AuthUser::session_auth_hash`].
///
/// # Security
///
/// The implementation of the [`PartialEq`] trait for this type is constant-time
/// to prevent timing attacks.
///
/// The implementation of the [`Debug`] trait for this type hides the session
/// auth hash value to prevent it from being leaked in logs or other debug
/// output.
#[repr(transparent)]
#[derive(Clone)]
pub struct SessionAuthHash(Box<[u8]>);

impl SessionAuthHash {
    /// Creates a new session authentication hash object from a byte slice.
    #[must_use]
    pub fn new(hash: &[u8]) -> Self {
        Self(Box::from(hash))
    }

    /// Returns the session authentication hash as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for SessionAuthHash {
    fn from(hash: &[u8]) -> Self {
        Self::new(hash)
    }
}

impl PartialEq for SessionAuthHash {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SessionAuthHash {}

impl Debug for SessionAuthHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionAuthHash")
            .field(&"**********")
            .finish()
    }
}

/// A source of users, used to restore a login from the session.
#[async_trait]
pub trait UserBackend<U>: Send + Sync {
    /// Get a user by ID.
    ///
    /// If the user is not found, this returns `None` and the login stored
    /// in the session is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the user object cannot be fetched.
    async fn get_by_id(&self, id: &UserId) -> Result<Option<U>>;
}

/// A user backend which never finds any user.
///
/// With this backend, logins only last for the request they happened in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NoUserBackend;

#[async_trait]
impl<U: Send + 'static> UserBackend<U> for NoUserBackend {
    async fn get_by_id(&self, _id: &UserId) -> Result<Option<U>> {
        Ok(None)
    }
}

/// The result of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome<U> {
    /// The credentials were valid; the user gets logged in.
    Success(U),
    /// The credentials were missing or invalid.
    Failure,
    /// The client has to be redirected, e.g. to a third-party login page.
    Redirect(String),
    /// The strategy does not apply to this request.
    Pass,
}

/// An authentication strategy, such as a login form or a token check.
#[async_trait]
pub trait Strategy<U>: Send + Sync {
    /// Attempts to authenticate the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt could not be carried out. Invalid
    /// credentials are reported with [`StrategyOutcome::Failure`] instead.
    async fn authenticate(&self, cx: &RequestContext) -> Result<StrategyOutcome<U>>;
}

/// Redirect targets of an authentication attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticateOptions {
    /// Where to send the client after a successful login.
    pub success_redirect: Option<String>,
    /// Where to send the client after a failed attempt. Without it, the
    /// response status is set to `401 Unauthorized`.
    pub failure_redirect: Option<String>,
}

impl AuthenticateOptions {
    /// Creates options with both redirect targets set.
    #[must_use]
    pub fn redirects(success: impl Into<String>, failure: impl Into<String>) -> Self {
        Self {
            success_redirect: Some(success.into()),
            failure_redirect: Some(failure.into()),
        }
    }
}

/// The authentication provider.
///
/// An authenticator holds the [`UserBackend`] and the registered strategies,
/// and produces the authentication middlewares. It is cheap to clone.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use gatekeeper::RequestContext;
/// use gatekeeper::auth::{
///     AuthUser, Authenticator, NoUserBackend, Strategy, StrategyOutcome, UserId,
/// };
///
/// #[derive(Clone)]
/// struct Admin;
///
/// impl AuthUser for Admin {
///     fn id(&self) -> UserId {
///         UserId::Int(1)
///     }
/// }
///
/// struct HeaderStrategy;
///
/// #[async_trait]
/// impl Strategy<Admin> for HeaderStrategy {
///     async fn authenticate(
///         &self,
///         cx: &RequestContext,
///     ) -> gatekeeper::auth::Result<StrategyOutcome<Admin>> {
///         if cx.request().headers.contains_key("x-admin") {
///             Ok(StrategyOutcome::Success(Admin))
///         } else {
///             Ok(StrategyOutcome::Failure)
///         }
///     }
/// }
///
/// let authenticator = Authenticator::builder(NoUserBackend)
///     .strategy("header", HeaderStrategy)
///     .build();
/// assert!(authenticator.has_strategy("header"));
/// ```
pub struct Authenticator<U> {
    inner: Arc<AuthenticatorInner<U>>,
}

struct AuthenticatorInner<U> {
    backend: Arc<dyn UserBackend<U>>,
    strategies: HashMap<String, Arc<dyn Strategy<U>>>,
    secret_key: SecretKey,
    fallback_secret_keys: Vec<SecretKey>,
}

impl<U> Clone for Authenticator<U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<U> Debug for Authenticator<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut strategies: Vec<_> = self.inner.strategies.keys().collect();
        strategies.sort();
        f.debug_struct("Authenticator")
            .field("strategies", &strategies)
            .finish_non_exhaustive()
    }
}

impl<U: AuthUser> Authenticator<U> {
    /// Creates an authenticator with no strategies.
    #[must_use]
    pub fn new(backend: impl UserBackend<U> + 'static) -> Self {
        Self::builder(backend).build()
    }

    /// Creates an [`AuthenticatorBuilder`] using `backend` to restore users.
    #[must_use]
    pub fn builder(backend: impl UserBackend<U> + 'static) -> AuthenticatorBuilder<U> {
        AuthenticatorBuilder {
            backend: Arc::new(backend),
            strategies: HashMap::new(),
        }
    }

    /// Returns `true` if a strategy is registered under `name`.
    #[must_use]
    pub fn has_strategy(&self, name: &str) -> bool {
        self.inner.strategies.contains_key(name)
    }

    /// Returns a copy of this authenticator using the secret keys of
    /// `config` for session auth hashes.
    #[must_use]
    pub(crate) fn with_secret_keys(&self, config: &GatekeeperConfig) -> Self {
        Self {
            inner: Arc::new(AuthenticatorInner {
                backend: Arc::clone(&self.inner.backend),
                strategies: self.inner.strategies.clone(),
                secret_key: config.secret_key.clone(),
                fallback_secret_keys: config.fallback_secret_keys.clone(),
            }),
        }
    }

    /// The middleware making this authenticator available to the rest of the
    /// request processing. It has to run before [`login`], [`logout`] and
    /// [`Authenticator::restore`].
    pub fn initialize(&self) -> impl Middleware + use<U> {
        let authenticator = self.clone();
        from_callback("auth-initialize", move |cx, done| {
            cx.extensions_mut().insert(authenticator.clone());
            done.complete(());
        })
    }

    /// The middleware restoring the logged-in user from the session.
    ///
    /// The user id stored in the session is looked up in the
    /// [`UserBackend`] and its session auth hash is checked, first against the
    /// secret key, then against each fallback secret key. A hash matching a
    /// fallback key is replaced with the one for the current secret key. A
    /// login whose user no longer exists or whose hash does not match is
    /// removed from the session.
    ///
    /// Requires the session middleware to run first.
    #[must_use]
    pub fn restore(&self) -> RestoreMiddleware<U> {
        RestoreMiddleware {
            authenticator: self.clone(),
        }
    }

    /// The middleware running the strategy registered under `strategy`.
    ///
    /// On success the user is logged in (see [`login`]) and the response is
    /// redirected to `success_redirect`, if given. On failure the response is
    /// redirected to `failure_redirect`, or gets the `401 Unauthorized`
    /// status. A strategy may also ask for a redirect of its own, or pass.
    ///
    /// An unknown strategy name is reported as an error when the middleware
    /// runs.
    #[must_use]
    pub fn authenticate(
        &self,
        strategy: impl Into<String>,
        options: AuthenticateOptions,
    ) -> AuthenticateMiddleware<U> {
        AuthenticateMiddleware {
            authenticator: self.clone(),
            strategy: strategy.into(),
            options,
        }
    }

    async fn restore_user(&self, cx: &mut RequestContext) -> Result<()> {
        if cx.user::<U>().is_some() {
            return Ok(());
        }
        let session = cx.session().cloned().ok_or(AuthError::SessionMissing)?;
        let Some(user_id) = session.get::<UserId>(USER_ID_SESSION_KEY).await? else {
            return Ok(());
        };

        let Some(user) = self.inner.backend.get_by_id(&user_id).await? else {
            debug!(?user_id, "user stored in the session no longer exists");
            remove_login(&session).await?;
            return Ok(());
        };

        if self.session_auth_hash_valid(&user, &session).await? {
            debug!(?user_id, "restored user from the session");
            cx.set_user(user);
        } else {
            info!(?user_id, "session auth hash mismatch, logging out");
            remove_login(&session).await?;
        }
        Ok(())
    }

    async fn session_auth_hash_valid(&self, user: &U, session: &Session) -> Result<bool> {
        let Some(user_hash) = user.session_auth_hash(&self.inner.secret_key) else {
            return Ok(true);
        };

        let Some(stored_hash) = session.get::<Vec<u8>>(SESSION_HASH_SESSION_KEY).await? else {
            return Ok(false);
        };
        let stored_hash = SessionAuthHash::new(&stored_hash);

        if user_hash == stored_hash {
            return Ok(true);
        }

        // hashes made with a fallback key are accepted once and rewritten
        for fallback_key in &self.inner.fallback_secret_keys {
            let matches = user
                .session_auth_hash(fallback_key)
                .is_some_and(|fallback_hash| fallback_hash == stored_hash);
            if matches {
                session
                    .insert(SESSION_HASH_SESSION_KEY, user_hash.as_bytes())
                    .await?;
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn strategy(&self, name: &str) -> Result<&Arc<dyn Strategy<U>>> {
        self.inner
            .strategies
            .get(name)
            .ok_or_else(|| AuthError::UnknownStrategy(name.to_owned()))
    }
}

/// A builder for [`Authenticator`].
pub struct AuthenticatorBuilder<U> {
    backend: Arc<dyn UserBackend<U>>,
    strategies: HashMap<String, Arc<dyn Strategy<U>>>,
}

impl<U> Debug for AuthenticatorBuilder<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatorBuilder")
            .field("strategies", &self.strategies.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<U: AuthUser> AuthenticatorBuilder<U> {
    /// Registers `strategy` under `name`, replacing any strategy previously
    /// registered under the same name.
    #[must_use]
    pub fn strategy(
        mut self,
        name: impl Into<String>,
        strategy: impl Strategy<U> + 'static,
    ) -> Self {
        self.strategies.insert(name.into(), Arc::new(strategy));
        self
    }

    /// Builds the authenticator.
    #[must_use]
    pub fn build(self) -> Authenticator<U> {
        Authenticator {
            inner: Arc::new(AuthenticatorInner {
                backend: self.backend,
                strategies: self.strategies,
                secret_key: SecretKey::default(),
                fallback_secret_keys: Vec::new(),
            }),
        }
    }
}

/// The middleware created by [`Authenticator::restore`].
#[derive(Debug, Clone)]
pub struct RestoreMiddleware<U> {
    authenticator: Authenticator<U>,
}

#[async_trait]
impl<U: AuthUser> Middleware for RestoreMiddleware<U> {
    async fn handle(&self, cx: &mut RequestContext) -> std::result::Result<(), BoxError> {
        Ok(self.authenticator.restore_user(cx).await?)
    }

    fn name(&self) -> &'static str {
        "auth-restore"
    }
}

/// The middleware created by [`Authenticator::authenticate`].
#[derive(Debug, Clone)]
pub struct AuthenticateMiddleware<U> {
    authenticator: Authenticator<U>,
    strategy: String,
    options: AuthenticateOptions,
}

impl<U: AuthUser> AuthenticateMiddleware<U> {
    async fn run(&self, cx: &mut RequestContext) -> Result<()> {
        let strategy = self.authenticator.strategy(&self.strategy)?;

        match strategy.authenticate(cx).await? {
            StrategyOutcome::Success(user) => {
                info!(
                    strategy = %self.strategy,
                    user_id = ?user.id(),
                    "authentication succeeded"
                );
                login(cx, user).await?;
                if let Some(target) = &self.options.success_redirect {
                    cx.redirect(target)?;
                }
            }
            StrategyOutcome::Failure => {
                info!(strategy = %self.strategy, "authentication failed");
                match &self.options.failure_redirect {
                    Some(target) => cx.redirect(target)?,
                    None => cx.response_mut().status = StatusCode::UNAUTHORIZED,
                }
            }
            StrategyOutcome::Redirect(target) => {
                debug!(
                    strategy = %self.strategy,
                    %target,
                    "authentication strategy redirected"
                );
                cx.redirect(&target)?;
            }
            StrategyOutcome::Pass => {
                debug!(strategy = %self.strategy, "authentication strategy passed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<U: AuthUser> Middleware for AuthenticateMiddleware<U> {
    async fn handle(&self, cx: &mut RequestContext) -> std::result::Result<(), BoxError> {
        Ok(self.run(cx).await?)
    }

    fn name(&self) -> &'static str {
        "auth-authenticate"
    }
}

/// Logs `user` in.
///
/// The session gets a new id, the user id and session auth hash are stored
/// in it, and the user is attached to the context.
///
/// # Errors
///
/// Returns an error if [`Authenticator::initialize`] has not run for the
/// request, if there is no session, or if the session cannot be accessed.
pub async fn login<U: AuthUser>(cx: &mut RequestContext, user: U) -> Result<()> {
    let authenticator = cx
        .extensions()
        .get::<Authenticator<U>>()
        .cloned()
        .ok_or(AuthError::NotInitialized)?;
    let session = cx.session().cloned().ok_or(AuthError::SessionMissing)?;

    session.cycle_id().await?;
    session.insert(USER_ID_SESSION_KEY, user.id()).await?;
    if let Some(session_auth_hash) = user.session_auth_hash(&authenticator.inner.secret_key) {
        session
            .insert(SESSION_HASH_SESSION_KEY, session_auth_hash.as_bytes())
            .await?;
    }
    cx.set_user(user);

    Ok(())
}

/// Logs the current user out.
///
/// The login is removed from the session, the session gets a new id, and the
/// user is detached from the context.
///
/// # Errors
///
/// Returns an error if there is no session or if it cannot be accessed.
pub async fn logout<U: AuthUser>(cx: &mut RequestContext) -> Result<()> {
    let session = cx.session().cloned().ok_or(AuthError::SessionMissing)?;

    remove_login(&session).await?;
    session.cycle_id().await?;
    cx.clear_user::<U>();

    Ok(())
}

async fn remove_login(session: &Session) -> Result<()> {
    session.remove_value(USER_ID_SESSION_KEY).await?;
    session.remove_value(SESSION_HASH_SESSION_KEY).await?;
    Ok(())
}
