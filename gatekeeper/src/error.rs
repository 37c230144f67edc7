use std::fmt::Display;

use thiserror::Error;

/// A type-erased error, as produced by middlewares.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error that can occur while using the gatekeeper.
#[derive(Debug)]
pub struct Error {
    pub(crate) inner: ErrorRepr,
}

impl Error {
    #[must_use]
    pub(crate) fn new(inner: ErrorRepr) -> Self {
        Self { inner }
    }

    /// Create a new error with a custom error message or error type.
    ///
    /// This is mostly useful in handlers passed to
    /// [`Gatekeeper::control`](crate::Gatekeeper::control), which return this
    /// crate's [`Result`](crate::Result).
    ///
    /// # Examples
    ///
    /// ```
    /// use gatekeeper::Error;
    ///
    /// let error = Error::custom("An error occurred");
    /// let error = Error::custom(std::io::Error::new(
    ///     std::io::ErrorKind::Other,
    ///     "An error occurred",
    /// ));
    /// ```
    #[must_use]
    pub fn custom<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::new(ErrorRepr::Custom(error.into()))
    }

    /// Returns `true` if this error was signalled by a middleware in the
    /// chain.
    #[must_use]
    pub fn is_middleware_failure(&self) -> bool {
        matches!(self.inner, ErrorRepr::MiddlewareFailure { .. })
    }

    /// Returns the name of the middleware that failed, if this is a
    /// middleware failure.
    #[must_use]
    pub fn failed_middleware(&self) -> Option<&str> {
        match &self.inner {
            ErrorRepr::MiddlewareFailure { middleware, .. } => Some(middleware),
            _ => None,
        }
    }

    /// Returns the exact error value the failing middleware produced.
    ///
    /// # Examples
    ///
    /// ```
    /// use gatekeeper::Error;
    ///
    /// let error = Error::custom("not from a middleware");
    /// assert!(error.middleware_source().is_none());
    /// ```
    #[must_use]
    pub fn middleware_source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match &self.inner {
            ErrorRepr::MiddlewareFailure { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<ErrorRepr> for Error {
    fn from(value: ErrorRepr) -> Self {
        Self::new(value)
    }
}

macro_rules! impl_error_from_repr {
    ($ty:ty) => {
        impl From<$ty> for Error {
            fn from(value: $ty) -> Self {
                Error::from(ErrorRepr::from(value))
            }
        }
    };
}

impl_error_from_repr!(toml::de::Error);
impl_error_from_repr!(tower_sessions::session::Error);
impl_error_from_repr!(crate::auth::AuthError);
impl_error_from_repr!(serde_json::Error);
impl_error_from_repr!(http::header::InvalidHeaderValue);

#[derive(Debug, Error)]
#[non_exhaustive]
pub(crate) enum ErrorRepr {
    /// A custom user error occurred.
    #[error(transparent)]
    Custom(BoxError),
    /// A middleware in the chain signalled a failure.
    #[error("Middleware `{middleware}` failed: {source}")]
    MiddlewareFailure {
        middleware: String,
        #[source]
        source: BoxError,
    },
    /// An error occurred while trying to read the config file.
    #[error("Could not read the config file at `{path}`")]
    LoadConfig {
        path: String,
        source: std::io::Error,
    },
    /// An error occurred while trying to parse the config.
    #[error("Could not parse the config: {source}")]
    ParseConfig {
        #[from]
        source: toml::de::Error,
    },
    /// A required environment variable is not set or is not valid unicode.
    #[error("Environment variable `{name}` is missing or invalid")]
    MissingEnv {
        name: &'static str,
        source: std::env::VarError,
    },
    /// An environment variable could not be interpreted.
    #[error("Environment variable `{name}` has an invalid value `{value}`")]
    InvalidEnv { name: &'static str, value: String },
    /// Sessions cannot be signed without a secret key.
    #[error("A non-empty secret key is required to sign session cookies")]
    MissingSecretKey,
    /// An error occurred while accessing the session object.
    #[error("Error while accessing the session object")]
    SessionAccess(#[from] tower_sessions::session::Error),
    /// An error occurred while trying to authenticate a user.
    #[error("Failed to authenticate user: {0}")]
    Authentication(#[from] crate::auth::AuthError),
    /// An error occurred while trying to serialize or deserialize JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A header value could not be produced.
    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn error_custom_display() {
        let error = Error::custom("something broke");

        assert_eq!(format!("{error}"), "something broke");
        assert!(!error.is_middleware_failure());
        assert!(error.failed_middleware().is_none());
    }

    #[test]
    fn error_middleware_failure() {
        let error = Error::new(ErrorRepr::MiddlewareFailure {
            middleware: "session".to_string(),
            source: Box::new(io::Error::other("store offline")),
        });

        assert!(error.is_middleware_failure());
        assert_eq!(error.failed_middleware(), Some("session"));
        assert_eq!(
            format!("{error}"),
            "Middleware `session` failed: store offline"
        );
        let source = error.middleware_source().unwrap();
        assert_eq!(source.to_string(), "store offline");
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn error_from_repr() {
        let error: Error = ErrorRepr::MissingSecretKey.into();

        assert_eq!(
            format!("{error}"),
            "A non-empty secret key is required to sign session cookies"
        );
    }
}
