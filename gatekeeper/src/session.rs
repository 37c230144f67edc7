//! Session support.
//!
//! This module provides the session provider of the gatekeeper: a
//! [`SessionMiddleware`] which reads a signed session cookie, attaches a
//! [`Session`] to the request context, and decides when the session is
//! persisted and when the cookie is (re)sent.
//!
//! Session data is handled by [`tower_sessions`]; any
//! [`SessionStore`](tower_sessions::SessionStore) can be used to keep it.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use gatekeeper::RequestContext;
//! use gatekeeper::config::{GatekeeperConfig, SecretKey};
//! use gatekeeper::middleware::Middleware;
//! use gatekeeper::session::SessionMiddleware;
//! use tower_sessions::MemoryStore;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), gatekeeper::BoxError> {
//! let config = GatekeeperConfig::builder()
//!     .secret_key(SecretKey::from("keyboard cat"))
//!     .build();
//! let sessions = SessionMiddleware::new(Arc::new(MemoryStore::default()), &config);
//!
//! let (mut cx, ()) = RequestContext::from_request(http::Request::new(()));
//! sessions.handle(&mut cx).await?;
//!
//! let session = cx.session().expect("session was just attached");
//! session.insert("user_name", "world").await?;
//! cx.finish().await?;
//!
//! assert!(cx.response().headers.contains_key(http::header::SET_COOKIE));
//! # Ok(())
//! # }
//! ```

mod signature;

use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use cookie::Cookie;
use http::header::{COOKIE, HeaderValue, SET_COOKIE};
use http::{Extensions, HeaderMap};
use tower_sessions::session::{Id, Record};
use tower_sessions::{Expiry, SessionStore, session_store};
use tracing::debug;

use crate::config::{GatekeeperConfig, SecretKey, SessionConfig};
use crate::context::RequestContext;
use crate::error::BoxError;
use crate::middleware::Middleware;

/// A session object.
///
/// This is a wrapper around [`tower_sessions::Session`] which remembers the
/// session cookie the request came with, so that the session can be
/// committed back into the response.
#[derive(Debug, Clone)]
pub struct Session {
    // tower_sessions::Session internally is two Arcs, so it's cheap to clone
    inner: tower_sessions::Session,
    settings: Arc<SessionSettings>,
    cookie_id: Option<Id>,
}

impl Session {
    /// Get the session object from request extensions.
    ///
    /// Returns `None` if the [`SessionMiddleware`] has not run for the
    /// request.
    #[must_use]
    pub fn from_extensions(extensions: &Extensions) -> Option<&Session> {
        extensions.get::<Session>()
    }

    /// Persists the session and writes the session cookie into `headers`,
    /// if needed.
    ///
    /// * A new session is saved if it was modified or if `save_uninitialized`
    ///   is enabled; an existing one if it was modified or if `resave` is
    ///   enabled.
    /// * The cookie is sent when the session id changed and the session was
    ///   saved, or, for an unchanged id, when `rolling` is enabled or the
    ///   session was modified and has a max age.
    /// * A session that was flushed gets a removal cookie.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store fails or the cookie cannot be
    /// encoded as a header value.
    pub async fn commit(&self, headers: &mut HeaderMap) -> crate::Result<()> {
        let config = &self.settings.config;
        let modified = self.inner.is_modified();

        let flushed = modified && self.cookie_id.is_some() && self.inner.id().is_none();
        if flushed && self.inner.is_empty().await {
            debug!("session flushed, removing the session cookie");
            let mut cookie = self.settings.cookie(String::new());
            cookie.make_removal();
            append_cookie(headers, &cookie)?;
            return Ok(());
        }

        let is_new = self.inner.id().is_none();
        let should_save = if is_new {
            config.save_uninitialized || modified
        } else {
            modified || config.resave
        };
        if should_save {
            self.inner.save().await?;
        }

        let Some(id) = self.inner.id() else {
            return Ok(());
        };
        let should_set_cookie = if Some(id) == self.cookie_id {
            config.rolling || (config.max_age.is_some() && modified)
        } else {
            should_save
        };
        if should_set_cookie {
            debug!(
                session_id_changed = Some(id) != self.cookie_id,
                "setting the session cookie"
            );
            let cookie = self
                .settings
                .cookie(signature::sign(&id.to_string(), self.settings.primary_key()));
            append_cookie(headers, &cookie)?;
        }

        Ok(())
    }
}

impl Deref for Session {
    type Target = tower_sessions::Session;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

fn append_cookie(headers: &mut HeaderMap, cookie: &Cookie<'_>) -> crate::Result<()> {
    let value = HeaderValue::from_str(&cookie.encoded().to_string())?;
    headers.append(SET_COOKIE, value);
    Ok(())
}

#[derive(Debug)]
struct SessionSettings {
    config: SessionConfig,
    // the primary key comes first
    keys: Vec<SecretKey>,
}

impl SessionSettings {
    fn primary_key(&self) -> &SecretKey {
        &self.keys[0]
    }

    fn expiry(&self) -> Expiry {
        match self.max_age() {
            Some(max_age) => Expiry::OnInactivity(max_age),
            None => Expiry::OnSessionEnd,
        }
    }

    fn max_age(&self) -> Option<time::Duration> {
        self.config
            .max_age
            .map(|max_age| time::Duration::try_from(max_age).unwrap_or(time::Duration::MAX))
    }

    fn cookie(&self, value: String) -> Cookie<'static> {
        let mut cookie = Cookie::build((self.config.cookie_name.clone(), value))
            .path(self.config.path.clone())
            .http_only(self.config.http_only)
            .secure(self.config.secure)
            .same_site(self.config.same_site.into());
        if let Some(max_age) = self.max_age() {
            cookie = cookie.max_age(max_age);
        }
        cookie.build()
    }

    fn session_id(&self, headers: &HeaderMap) -> Option<Id> {
        let cookie = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(Cookie::split_parse_encoded)
            .filter_map(Result::ok)
            .find(|cookie| cookie.name() == self.config.cookie_name)?;

        let Some(value) = signature::unsign(cookie.value(), &self.keys) else {
            debug!(
                cookie = %self.config.cookie_name,
                "ignoring session cookie with invalid signature"
            );
            return None;
        };
        match Id::from_str(value) {
            Ok(id) => Some(id),
            Err(error) => {
                debug!(%error, "ignoring session cookie with malformed session id");
                None
            }
        }
    }
}

/// A [`SessionStore`] delegating to a shared trait object.
///
/// [`tower_sessions::Session`] needs a concrete store type, while the
/// gatekeeper accepts any store chosen at runtime.
#[derive(Debug, Clone)]
struct SessionStoreWrapper(Arc<dyn SessionStore>);

#[async_trait]
impl SessionStore for SessionStoreWrapper {
    async fn save(&self, session_record: &Record) -> session_store::Result<()> {
        self.0.save(session_record).await
    }

    async fn load(&self, session_id: &Id) -> session_store::Result<Option<Record>> {
        self.0.load(session_id).await
    }

    async fn delete(&self, session_id: &Id) -> session_store::Result<()> {
        self.0.delete(session_id).await
    }
}

/// The middleware attaching a [`Session`] to every request.
///
/// The session id is read from the configured cookie, which must be signed
/// with the secret key or one of the fallback secret keys. Requests without
/// a valid cookie get a fresh session. A session which is already attached
/// to the context is left untouched.
#[derive(Debug, Clone)]
pub struct SessionMiddleware {
    store: Arc<SessionStoreWrapper>,
    settings: Arc<SessionSettings>,
}

impl SessionMiddleware {
    /// Creates a session middleware keeping sessions in `store`.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, config: &GatekeeperConfig) -> Self {
        let keys = std::iter::once(config.secret_key.clone())
            .chain(config.fallback_secret_keys.iter().cloned())
            .collect();

        Self {
            store: Arc::new(SessionStoreWrapper(store)),
            settings: Arc::new(SessionSettings {
                config: config.session.clone(),
                keys,
            }),
        }
    }

    fn session_for(&self, headers: &HeaderMap) -> Session {
        let cookie_id = self.settings.session_id(headers);
        let inner = tower_sessions::Session::new(
            cookie_id,
            Arc::clone(&self.store),
            Some(self.settings.expiry()),
        );

        Session {
            inner,
            settings: Arc::clone(&self.settings),
            cookie_id,
        }
    }
}

#[async_trait]
impl Middleware for SessionMiddleware {
    async fn handle(&self, cx: &mut RequestContext) -> Result<(), BoxError> {
        if cx.session().is_some() {
            return Ok(());
        }

        let session = self.session_for(&cx.request().headers);
        cx.extensions_mut().insert(session);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "session"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tower_sessions::MemoryStore;

    use super::*;

    fn config(session: SessionConfig) -> GatekeeperConfig {
        GatekeeperConfig::builder()
            .secret_key(SecretKey::from("primary"))
            .session(session)
            .build()
    }

    fn middleware(session: SessionConfig) -> SessionMiddleware {
        SessionMiddleware::new(Arc::new(MemoryStore::default()), &config(session))
    }

    async fn context(middleware: &SessionMiddleware, cookie: Option<&str>) -> RequestContext {
        let mut request = http::Request::get("/");
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }
        let (mut cx, ()) = RequestContext::from_request(request.body(()).unwrap());
        middleware.handle(&mut cx).await.unwrap();
        cx
    }

    fn set_cookies(cx: &RequestContext) -> Vec<String> {
        cx.response()
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|value| value.to_str().unwrap().to_owned())
            .collect()
    }

    /// Turns a `Set-Cookie` value into the `Cookie` header a browser sends.
    fn cookie_pair(set_cookie: &str) -> String {
        set_cookie.split(';').next().unwrap().to_owned()
    }

    async fn logged_cookie(middleware: &SessionMiddleware) -> String {
        let mut cx = context(middleware, None).await;
        cx.session().unwrap().insert("user", "alice").await.unwrap();
        cx.finish().await.unwrap();
        cookie_pair(&set_cookies(&cx)[0])
    }

    #[tokio::test]
    async fn new_unmodified_session_not_saved() {
        let middleware = middleware(SessionConfig::default());
        let mut cx = context(&middleware, None).await;

        cx.finish().await.unwrap();

        assert!(set_cookies(&cx).is_empty());
        assert_eq!(cx.session().unwrap().id(), None);
    }

    #[tokio::test]
    async fn new_modified_session_sets_signed_cookie() {
        let middleware = middleware(SessionConfig::default());
        let mut cx = context(&middleware, None).await;
        cx.session().unwrap().insert("user", "alice").await.unwrap();

        cx.finish().await.unwrap();

        let cookies = set_cookies(&cx);
        assert_eq!(cookies.len(), 1);
        let cookie = Cookie::parse_encoded(cookies[0].as_str()).unwrap();
        assert_eq!(cookie.name(), "connect.sid");
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(cookie::SameSite::Lax));
        let id = cx.session().unwrap().id().unwrap();
        assert_eq!(
            signature::unsign(cookie.value(), [&SecretKey::from("primary")]),
            Some(id.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn save_uninitialized_sets_cookie() {
        let session = SessionConfig::builder().save_uninitialized(true).build();
        let middleware = middleware(session);
        let mut cx = context(&middleware, None).await;

        cx.finish().await.unwrap();

        assert_eq!(set_cookies(&cx).len(), 1);
        assert!(cx.session().unwrap().id().is_some());
    }

    #[tokio::test]
    async fn existing_session_loaded_from_cookie() {
        let middleware = middleware(SessionConfig::default());
        let cookie = logged_cookie(&middleware).await;

        let mut cx = context(&middleware, Some(&cookie)).await;
        let user: Option<String> = cx.session().unwrap().get("user").await.unwrap();
        cx.finish().await.unwrap();

        assert_eq!(user.as_deref(), Some("alice"));
        assert!(set_cookies(&cx).is_empty());
    }

    #[tokio::test]
    async fn rolling_resends_cookie() {
        let session = SessionConfig::builder().rolling(true).build();
        let middleware = middleware(session);
        let cookie = logged_cookie(&middleware).await;

        let mut cx = context(&middleware, Some(&cookie)).await;
        cx.finish().await.unwrap();

        let cookies = set_cookies(&cx);
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookie_pair(&cookies[0]), cookie);
    }

    #[tokio::test]
    async fn max_age_resends_cookie_when_modified() {
        let session = SessionConfig::builder()
            .max_age(Duration::from_secs(60))
            .build();
        let middleware = middleware(session);
        let cookie = logged_cookie(&middleware).await;

        let mut unmodified = context(&middleware, Some(&cookie)).await;
        unmodified.finish().await.unwrap();
        let mut modified = context(&middleware, Some(&cookie)).await;
        modified.session().unwrap().insert("page", 2).await.unwrap();
        modified.finish().await.unwrap();

        assert!(set_cookies(&unmodified).is_empty());
        let cookies = set_cookies(&modified);
        assert_eq!(cookies.len(), 1);
        let parsed = Cookie::parse_encoded(cookies[0].as_str()).unwrap();
        assert_eq!(parsed.max_age(), Some(time::Duration::seconds(60)));
    }

    #[tokio::test]
    async fn resave_keeps_cookie_untouched() {
        let session = SessionConfig::builder().resave(true).build();
        let middleware = middleware(session);
        let cookie = logged_cookie(&middleware).await;

        let mut cx = context(&middleware, Some(&cookie)).await;
        cx.finish().await.unwrap();
        let mut again = context(&middleware, Some(&cookie)).await;
        let user: Option<String> = again.session().unwrap().get("user").await.unwrap();

        assert!(set_cookies(&cx).is_empty());
        assert_eq!(user.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn tampered_cookie_gives_fresh_session() {
        let middleware = middleware(SessionConfig::default());
        let cookie = logged_cookie(&middleware).await;
        let tampered = format!("{cookie}x");

        let cx = context(&middleware, Some(&tampered)).await;
        let user: Option<String> = cx.session().unwrap().get("user").await.unwrap();

        assert_eq!(user, None);
        assert_eq!(cx.session().unwrap().id(), None);
    }

    #[tokio::test]
    async fn fallback_key_accepted() {
        let store = Arc::new(MemoryStore::default());
        let old = SessionMiddleware::new(store.clone(), &config(SessionConfig::default()));
        let cookie = logged_cookie(&old).await;

        let rotated = GatekeeperConfig::builder()
            .secret_key(SecretKey::from("rotated"))
            .fallback_secret_keys(vec![SecretKey::from("primary")])
            .build();
        let new = SessionMiddleware::new(store, &rotated);
        let cx = context(&new, Some(&cookie)).await;
        let user: Option<String> = cx.session().unwrap().get("user").await.unwrap();

        assert_eq!(user.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn flushed_session_removes_cookie() {
        let middleware = middleware(SessionConfig::default());
        let cookie = logged_cookie(&middleware).await;

        let mut cx = context(&middleware, Some(&cookie)).await;
        cx.session().unwrap().flush().await.unwrap();
        cx.finish().await.unwrap();

        let cookies = set_cookies(&cx);
        assert_eq!(cookies.len(), 1);
        let parsed = Cookie::parse_encoded(cookies[0].as_str()).unwrap();
        assert_eq!(parsed.value(), "");
        assert_eq!(parsed.max_age(), Some(time::Duration::ZERO));
    }

    #[tokio::test]
    async fn attached_session_is_kept() {
        let middleware = middleware(SessionConfig::default());
        let mut cx = context(&middleware, None).await;
        cx.session().unwrap().insert("user", "alice").await.unwrap();

        middleware.handle(&mut cx).await.unwrap();

        let user: Option<String> = cx.session().unwrap().get("user").await.unwrap();
        assert_eq!(user.as_deref(), Some("alice"));
    }

    #[test]
    fn session_from_extensions_missing() {
        assert!(Session::from_extensions(&Extensions::new()).is_none());
    }
}
