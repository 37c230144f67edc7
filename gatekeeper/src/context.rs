//! The per-request context middlewares operate on.
//!
//! A [`RequestContext`] pairs the head of an incoming request with the head
//! of the response being prepared for it. The host framework creates one for
//! every request and lends it to the [`Gatekeeper`](crate::Gatekeeper); it is
//! never shared between requests.

use http::header::{HeaderValue, InvalidHeaderValue, LOCATION};
use http::{Extensions, StatusCode};

use crate::session::Session;

/// The head of the incoming request.
pub type RequestHead = http::request::Parts;

/// The head of the response being prepared.
pub type ResponseHead = http::response::Parts;

/// The request/response pair passed through a middleware chain.
///
/// # Examples
///
/// ```
/// use gatekeeper::RequestContext;
///
/// let request = http::Request::get("/dashboard").body(()).unwrap();
/// let (cx, ()) = RequestContext::from_request(request);
///
/// assert_eq!(cx.request().uri, "/dashboard");
/// assert_eq!(cx.response().status, http::StatusCode::OK);
/// ```
#[derive(Debug)]
pub struct RequestContext {
    request: RequestHead,
    response: ResponseHead,
}

/// The user attached by the authentication middlewares.
#[derive(Debug, Clone)]
struct CurrentUser<U>(U);

impl RequestContext {
    /// Creates a context for the given request head with an empty `200 OK`
    /// response head.
    #[must_use]
    pub fn new(request: RequestHead) -> Self {
        let (response, ()) = http::Response::new(()).into_parts();
        Self::from_parts(request, response)
    }

    /// Creates a context from an explicit request and response head.
    #[must_use]
    pub fn from_parts(request: RequestHead, response: ResponseHead) -> Self {
        Self { request, response }
    }

    /// Splits an [`http::Request`] into a context and its body.
    #[must_use]
    pub fn from_request<B>(request: http::Request<B>) -> (Self, B) {
        let (head, body) = request.into_parts();
        (Self::new(head), body)
    }

    /// Returns the request head.
    #[must_use]
    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Returns the request head mutably.
    #[must_use]
    pub fn request_mut(&mut self) -> &mut RequestHead {
        &mut self.request
    }

    /// Returns the response head.
    #[must_use]
    pub fn response(&self) -> &ResponseHead {
        &self.response
    }

    /// Returns the response head mutably.
    #[must_use]
    pub fn response_mut(&mut self) -> &mut ResponseHead {
        &mut self.response
    }

    /// Returns the request extensions.
    #[must_use]
    pub fn extensions(&self) -> &Extensions {
        &self.request.extensions
    }

    /// Returns the request extensions mutably.
    #[must_use]
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.request.extensions
    }

    /// Returns the authenticated user, if the middleware chain attached one.
    ///
    /// # Examples
    ///
    /// ```
    /// use gatekeeper::RequestContext;
    ///
    /// #[derive(Clone)]
    /// struct User;
    ///
    /// let (cx, ()) = RequestContext::from_request(http::Request::new(()));
    /// assert!(cx.user::<User>().is_none());
    /// ```
    #[must_use]
    pub fn user<U>(&self) -> Option<&U>
    where
        U: Clone + Send + Sync + 'static,
    {
        Self::user_from_extensions(&self.request.extensions)
    }

    /// Returns the authenticated user stored in request extensions.
    ///
    /// Services wrapped in a [`GatekeeperLayer`](crate::layer::GatekeeperLayer)
    /// receive the request extensions of the context, so this is how they
    /// look up the user.
    #[must_use]
    pub fn user_from_extensions<U>(extensions: &Extensions) -> Option<&U>
    where
        U: Clone + Send + Sync + 'static,
    {
        extensions
            .get::<CurrentUser<U>>()
            .map(|CurrentUser(user)| user)
    }

    pub(crate) fn set_user<U>(&mut self, user: U)
    where
        U: Clone + Send + Sync + 'static,
    {
        self.request.extensions.insert(CurrentUser(user));
    }

    pub(crate) fn clear_user<U>(&mut self)
    where
        U: Clone + Send + Sync + 'static,
    {
        self.request.extensions.remove::<CurrentUser<U>>();
    }

    /// Returns the session attached by the session middleware.
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        Session::from_extensions(&self.request.extensions)
    }

    /// Turns the response into a `302 Found` redirect to `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if `location` is not a valid header value.
    pub fn redirect(&mut self, location: &str) -> Result<(), InvalidHeaderValue> {
        let location = HeaderValue::from_str(location)?;
        self.response.status = StatusCode::FOUND;
        self.response.headers.insert(LOCATION, location);
        Ok(())
    }

    /// Returns `true` if the response has been turned into a redirect.
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        self.response.status.is_redirection() && self.response.headers.contains_key(LOCATION)
    }

    /// Commits the session attached to this context, writing the session
    /// cookie into the response head when needed.
    ///
    /// Does nothing if no session was attached.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store fails or the cookie cannot be
    /// encoded as a header.
    pub async fn finish(&mut self) -> crate::Result<()> {
        if let Some(session) = self.session().cloned() {
            session.commit(&mut self.response.headers).await?;
        }
        Ok(())
    }

    /// Splits the context back into the request and response heads.
    #[must_use]
    pub fn into_parts(self) -> (RequestHead, ResponseHead) {
        (self.request, self.response)
    }
}
