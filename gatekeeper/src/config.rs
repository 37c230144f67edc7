//! Configuration data for the gatekeeper.
//!
//! The main struct in this module is [`GatekeeperConfig`], which contains the
//! secret keys used for signing session cookies and the options of the
//! session provider. After creating an instance using
//! [`GatekeeperConfig::from_toml`], [`GatekeeperConfig::from_env`] or
//! [`GatekeeperConfigBuilder`], it can be passed to the
//! [`GatekeeperBuilder`](crate::GatekeeperBuilder).

// most of the config structures might be extended with non-Copy types
// in the future, so to avoid breaking backwards compatibility, we're
// not implementing Copy for them
#![allow(missing_copy_implementations)]

use std::path::Path;
use std::time::Duration;

use derive_builder::Builder;
use derive_more::with_trait::Debug;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::ErrorRepr;

/// The environment variable holding the primary secret key.
pub const SECRET_KEY_ENV: &str = "SESSION_SECRET";
/// The environment variable controlling the `Secure` cookie attribute.
pub const SECURE_COOKIE_ENV: &str = "SESSION_SECURE";

/// The configuration of the gatekeeper.
///
/// # Examples
///
/// ```
/// use gatekeeper::config::{GatekeeperConfig, SecretKey};
///
/// let config = GatekeeperConfig::builder()
///     .secret_key(SecretKey::from("keyboard cat"))
///     .build();
/// assert!(config.enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(build_fn(skip, error = std::convert::Infallible))]
#[serde(default)]
pub struct GatekeeperConfig {
    /// Whether the gatekeeper is active.
    ///
    /// When this is `false`, the gatekeeper becomes a no-op adapter: no
    /// middleware is ever run and no user is ever attached to a request. This
    /// is meant for environments where there is no server-side request to
    /// authenticate in the first place.
    pub enabled: bool,
    /// The secret key used to sign session cookies and session auth hashes.
    pub secret_key: SecretKey,
    /// Secret keys that were in use before the current one.
    ///
    /// Cookies signed with any of these keys are still accepted, which makes
    /// it possible to rotate the secret key without logging out every user.
    pub fallback_secret_keys: Vec<SecretKey>,
    /// The options of the session provider.
    pub session: SessionConfig,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        GatekeeperConfig::builder().build()
    }
}

impl GatekeeperConfig {
    /// Create a new [`GatekeeperConfigBuilder`] to build a
    /// [`GatekeeperConfig`].
    #[must_use]
    pub fn builder() -> GatekeeperConfigBuilder {
        GatekeeperConfigBuilder::default()
    }

    /// Create a new [`GatekeeperConfig`] from a TOML string.
    ///
    /// # Errors
    ///
    /// This function will return an error if the TOML fails to parse as a
    /// [`GatekeeperConfig`].
    ///
    /// # Examples
    ///
    /// ```
    /// use gatekeeper::config::GatekeeperConfig;
    ///
    /// let config = GatekeeperConfig::from_toml(
    ///     r#"
    ///     secret_key = "123abc"
    ///
    ///     [session]
    ///     cookie_name = "sid"
    ///     "#,
    /// )?;
    ///
    /// assert_eq!(config.secret_key.as_bytes(), b"123abc");
    /// assert_eq!(config.session.cookie_name, "sid");
    /// # Ok::<(), gatekeeper::Error>(())
    /// ```
    pub fn from_toml(toml_content: &str) -> crate::Result<GatekeeperConfig> {
        let config: GatekeeperConfig = toml::from_str(toml_content)?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    ///
    /// # Errors
    ///
    /// This function will return an error if the file cannot be read or if
    /// its contents fail to parse as a [`GatekeeperConfig`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<GatekeeperConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ErrorRepr::LoadConfig {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Build the configuration from the process environment.
    ///
    /// The secret key is read from `SESSION_SECRET`, which must be set.
    /// `SESSION_SECURE` (`true`/`false`/`1`/`0`) optionally overrides whether
    /// the session cookie is marked `Secure`. All other options keep their
    /// defaults.
    ///
    /// # Errors
    ///
    /// This function will return an error if `SESSION_SECRET` is missing or
    /// if `SESSION_SECURE` is not a boolean.
    pub fn from_env() -> crate::Result<GatekeeperConfig> {
        Self::from_env_with(std::env::var)
    }

    pub(crate) fn from_env_with<F>(var: F) -> crate::Result<GatekeeperConfig>
    where
        F: Fn(&'static str) -> Result<String, std::env::VarError>,
    {
        let secret_key = var(SECRET_KEY_ENV).map_err(|source| ErrorRepr::MissingEnv {
            name: SECRET_KEY_ENV,
            source,
        })?;

        let mut session = SessionConfig::builder();
        match var(SECURE_COOKIE_ENV) {
            Ok(value) => {
                session.secure(parse_bool(&value).ok_or(ErrorRepr::InvalidEnv {
                    name: SECURE_COOKIE_ENV,
                    value,
                })?);
            }
            Err(std::env::VarError::NotPresent) => {}
            Err(source) => {
                return Err(ErrorRepr::MissingEnv {
                    name: SECURE_COOKIE_ENV,
                    source,
                }
                .into());
            }
        }

        Ok(GatekeeperConfig::builder()
            .secret_key(SecretKey::from(secret_key))
            .session(session.build())
            .build())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl GatekeeperConfigBuilder {
    /// Builds the gatekeeper configuration.
    #[must_use]
    pub fn build(&self) -> GatekeeperConfig {
        GatekeeperConfig {
            enabled: self.enabled.unwrap_or(true),
            secret_key: self.secret_key.clone().unwrap_or_default(),
            fallback_secret_keys: self.fallback_secret_keys.clone().unwrap_or_default(),
            session: self.session.clone().unwrap_or_default(),
        }
    }
}

/// The `SameSite` attribute of the session cookie.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    /// The cookie is only sent with same-site requests.
    Strict,
    /// The cookie is also sent on top-level cross-site navigations.
    #[default]
    Lax,
    /// The cookie is sent with all requests. Requires `secure`.
    None,
}

impl From<SameSite> for cookie::SameSite {
    fn from(value: SameSite) -> Self {
        match value {
            SameSite::Strict => cookie::SameSite::Strict,
            SameSite::Lax => cookie::SameSite::Lax,
            SameSite::None => cookie::SameSite::None,
        }
    }
}

/// The options of the session provider.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use gatekeeper::config::SessionConfig;
///
/// let config = SessionConfig::builder()
///     .resave(true)
///     .max_age(Duration::from_secs(3600))
///     .build();
/// assert!(config.resave);
/// assert!(!config.save_uninitialized);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(build_fn(skip, error = std::convert::Infallible))]
#[serde(default)]
pub struct SessionConfig {
    /// The name of the session cookie. Defaults to `connect.sid`.
    #[builder(setter(into))]
    pub cookie_name: String,
    /// The path of the session cookie. Defaults to `/`.
    #[builder(setter(into))]
    pub path: String,
    /// Save the session back to the store on every request, even when it
    /// was not modified.
    pub resave: bool,
    /// Save sessions that are new but were not modified.
    pub save_uninitialized: bool,
    /// Send the session cookie on every response, refreshing its expiry.
    pub rolling: bool,
    /// Whether the session cookie should only be sent over HTTPS. Defaults
    /// to `true`.
    pub secure: bool,
    /// Whether the session cookie is hidden from client-side scripts.
    /// Defaults to `true`.
    pub http_only: bool,
    /// The `SameSite` attribute of the session cookie.
    pub same_site: SameSite,
    /// How long a session lives without activity.
    ///
    /// When `None`, the cookie lives until the browser session ends.
    #[serde(with = "crate::serializers::humantime")]
    #[builder(setter(strip_option), default)]
    pub max_age: Option<Duration>,
}

impl SessionConfig {
    /// Create a new [`SessionConfigBuilder`] to build a [`SessionConfig`].
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

impl SessionConfigBuilder {
    /// Builds the session configuration.
    #[must_use]
    pub fn build(&self) -> SessionConfig {
        SessionConfig {
            cookie_name: self
                .cookie_name
                .clone()
                .unwrap_or_else(|| "connect.sid".to_string()),
            path: self.path.clone().unwrap_or_else(|| "/".to_string()),
            resave: self.resave.unwrap_or_default(),
            save_uninitialized: self.save_uninitialized.unwrap_or_default(),
            rolling: self.rolling.unwrap_or_default(),
            secure: self.secure.unwrap_or(true),
            http_only: self.http_only.unwrap_or(true),
            same_site: self.same_site.unwrap_or_default(),
            max_age: self.max_age.unwrap_or_default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::builder().build()
    }
}

/// A secret key.
///
/// Used to sign session cookies and to compute session auth hashes.
///
/// # Security
///
/// The implementation of the [`PartialEq`] trait for this type is
/// constant-time to prevent timing attacks.
///
/// The implementation of the [`Debug`] trait for this type hides the secret
/// key to prevent it from being leaked in logs or other debug output.
///
/// # Examples
///
/// ```
/// use gatekeeper::config::SecretKey;
///
/// let key = SecretKey::new(&[1, 2, 3]);
/// assert_eq!(key.as_bytes(), &[1, 2, 3]);
/// assert_eq!(format!("{key:?}"), "SecretKey(\"**********\")");
/// ```
#[repr(transparent)]
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct SecretKey(Box<[u8]>);

impl SecretKey {
    /// Create a new [`SecretKey`] from a byte slice.
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        Self(Box::from(key))
    }

    /// Get the byte slice from the [`SecretKey`].
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` if the key has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume the [`SecretKey`] and return the byte slice.
    #[must_use]
    pub fn into_bytes(self) -> Box<[u8]> {
        self.0
    }
}

impl From<&[u8]> for SecretKey {
    fn from(value: &[u8]) -> Self {
        Self::new(value)
    }
}

impl From<String> for SecretKey {
    fn from(value: String) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<&str> for SecretKey {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SecretKey {}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // write in single line, regardless whether alternate mode was used or not
        write!(f, "SecretKey(\"**********\")")
    }
}

impl Default for SecretKey {
    fn default() -> Self {
        Self::new(&[])
    }
}

#[cfg(test)]
mod tests {
    use std::env::VarError;

    use super::*;

    #[test]
    fn from_toml_valid() {
        let toml_content = r#"
            enabled = true
            secret_key = "123abc"
            fallback_secret_keys = ["456def", "789ghi"]

            [session]
            cookie_name = "sid"
            path = "/app"
            resave = true
            save_uninitialized = true
            rolling = true
            secure = false
            http_only = false
            same_site = "strict"
            max_age = "1h"
        "#;

        let config = GatekeeperConfig::from_toml(toml_content).unwrap();

        assert!(config.enabled);
        assert_eq!(config.secret_key.as_bytes(), b"123abc");
        assert_eq!(config.fallback_secret_keys.len(), 2);
        assert_eq!(config.fallback_secret_keys[0].as_bytes(), b"456def");
        assert_eq!(config.fallback_secret_keys[1].as_bytes(), b"789ghi");
        assert_eq!(config.session.cookie_name, "sid");
        assert_eq!(config.session.path, "/app");
        assert!(config.session.resave);
        assert!(config.session.save_uninitialized);
        assert!(config.session.rolling);
        assert!(!config.session.secure);
        assert!(!config.session.http_only);
        assert_eq!(config.session.same_site, SameSite::Strict);
        assert_eq!(config.session.max_age, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn from_toml_invalid() {
        let toml_content = r"
            enabled = true
            secret_key = 123abc
        ";

        let result = GatekeeperConfig::from_toml(toml_content);
        assert!(result.is_err());
    }

    #[test]
    fn from_toml_missing_fields() {
        let config = GatekeeperConfig::from_toml(r#"secret_key = "123abc""#).unwrap();

        assert!(config.enabled);
        assert!(config.fallback_secret_keys.is_empty());
        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.session.cookie_name, "connect.sid");
        assert_eq!(config.session.path, "/");
        assert!(!config.session.resave);
        assert!(!config.session.save_uninitialized);
        assert!(config.session.secure);
        assert!(config.session.http_only);
        assert_eq!(config.session.same_site, SameSite::Lax);
        assert_eq!(config.session.max_age, None);
    }

    #[test]
    fn from_file_missing() {
        let error = GatekeeperConfig::from_file("/nonexistent/gatekeeper.toml").unwrap_err();

        assert_eq!(
            error.to_string(),
            "Could not read the config file at `/nonexistent/gatekeeper.toml`"
        );
    }

    #[test]
    fn from_env_secret_only() {
        let config = GatekeeperConfig::from_env_with(|name| match name {
            SECRET_KEY_ENV => Ok("from-env".to_string()),
            _ => Err(VarError::NotPresent),
        })
        .unwrap();

        assert_eq!(config.secret_key, SecretKey::from("from-env"));
        assert!(config.session.secure);
    }

    #[test]
    fn from_env_secure_override() {
        let config = GatekeeperConfig::from_env_with(|name| match name {
            SECRET_KEY_ENV => Ok("from-env".to_string()),
            SECURE_COOKIE_ENV => Ok("false".to_string()),
            _ => Err(VarError::NotPresent),
        })
        .unwrap();

        assert!(!config.session.secure);
    }

    #[test]
    fn from_env_missing_secret() {
        let error = GatekeeperConfig::from_env_with(|_| Err(VarError::NotPresent)).unwrap_err();

        assert_eq!(
            error.to_string(),
            "Environment variable `SESSION_SECRET` is missing or invalid"
        );
    }

    #[test]
    fn from_env_invalid_secure() {
        let error = GatekeeperConfig::from_env_with(|name| match name {
            SECRET_KEY_ENV => Ok("from-env".to_string()),
            _ => Ok("sometimes".to_string()),
        })
        .unwrap_err();

        assert_eq!(
            error.to_string(),
            "Environment variable `SESSION_SECURE` has an invalid value `sometimes`"
        );
    }

    #[test]
    fn secret_key_eq_and_debug() {
        let key = SecretKey::from("abc");

        assert_eq!(key, SecretKey::new(b"abc"));
        assert_ne!(key, SecretKey::new(b"abd"));
        assert_eq!(format!("{key:#?}"), "SecretKey(\"**********\")");
        assert!(SecretKey::default().is_empty());
    }
}
