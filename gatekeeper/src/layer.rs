//! Tower integration.
//!
//! [`GatekeeperLayer`] runs the gatekeeper's middleware chain in front of any
//! [`tower::Service`] taking [`http::Request`]s. The wrapped service receives
//! the session and the authenticated user in the request extensions; see
//! [`Session::from_extensions`] and [`RequestContext::user_from_extensions`].
//! Headers set by the middlewares are copied into the response, and the
//! session is committed once the response is ready.

use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tower::Service;

use crate::Gatekeeper;
use crate::auth::AuthUser;
use crate::context::RequestContext;
use crate::error::BoxError;
use crate::session::Session;

/// A layer applying a [`Gatekeeper`] to a service.
///
/// Created by [`Gatekeeper::layer`].
#[derive(Debug, Clone)]
pub struct GatekeeperLayer<U> {
    gatekeeper: Gatekeeper<U>,
}

impl<U> GatekeeperLayer<U> {
    pub(crate) fn new(gatekeeper: Gatekeeper<U>) -> Self {
        Self { gatekeeper }
    }
}

impl<S, U> tower::Layer<S> for GatekeeperLayer<U> {
    type Service = GatekeeperService<S, U>;

    fn layer(&self, inner: S) -> Self::Service {
        GatekeeperService {
            inner,
            gatekeeper: self.gatekeeper.clone(),
        }
    }
}

/// The service created by [`GatekeeperLayer`].
#[derive(Debug, Clone)]
pub struct GatekeeperService<S, U> {
    inner: S,
    gatekeeper: Gatekeeper<U>,
}

impl<S, U, ReqBody, ResBody> Service<http::Request<ReqBody>> for GatekeeperService<S, U>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    U: AuthUser,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = http::Response<ResBody>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        // the service that was polled ready is the one that gets called
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let gatekeeper = self.gatekeeper.clone();

        Box::pin(async move {
            let (mut cx, body) = RequestContext::from_request(request);
            gatekeeper.apply_middlewares(&mut cx).await?;

            let (head, response_head) = cx.into_parts();
            let session = Session::from_extensions(&head.extensions).cloned();
            let mut response = inner
                .call(http::Request::from_parts(head, body))
                .await
                .map_err(Into::into)?;

            let headers = response.headers_mut();
            for (name, value) in &response_head.headers {
                headers.append(name, value.clone());
            }
            if let Some(session) = session {
                session.commit(headers).await?;
            }

            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use http::header::{COOKIE, SET_COOKIE};
    use tower::{Layer, ServiceExt};

    use super::*;
    use crate::auth::{Authenticator, NoUserBackend, UserId};
    use crate::config::{GatekeeperConfig, SecretKey};

    #[derive(Debug, Clone)]
    struct TestUser;

    impl AuthUser for TestUser {
        fn id(&self) -> UserId {
            UserId::Int(1)
        }
    }

    fn gatekeeper(config: GatekeeperConfig) -> Gatekeeper<TestUser> {
        Gatekeeper::builder(Authenticator::new(NoUserBackend))
            .config(config)
            .build()
            .unwrap()
    }

    fn config() -> GatekeeperConfig {
        GatekeeperConfig::builder()
            .secret_key(SecretKey::from("secret"))
            .build()
    }

    async fn count_visits(
        request: http::Request<()>,
    ) -> Result<http::Response<String>, Infallible> {
        let session = Session::from_extensions(request.extensions()).unwrap();
        let visits = session.get::<u32>("visits").await.unwrap().unwrap_or(0) + 1;
        session.insert("visits", visits).await.unwrap();
        Ok(http::Response::new(visits.to_string()))
    }

    async fn empty(_request: http::Request<()>) -> Result<http::Response<String>, Infallible> {
        Ok(http::Response::new(String::new()))
    }

    #[tokio::test]
    async fn layer_keeps_session_across_requests() {
        let service = gatekeeper(config())
            .layer()
            .layer(tower::service_fn(count_visits));

        let first = service
            .clone()
            .oneshot(http::Request::new(()))
            .await
            .unwrap();
        let set_cookie = first.headers()[SET_COOKIE].to_str().unwrap();
        let cookie = set_cookie.split(';').next().unwrap().to_owned();
        let request = http::Request::get("/").header(COOKIE, cookie).body(());
        let second = service.oneshot(request.unwrap()).await.unwrap();

        assert_eq!(first.body(), "1");
        assert_eq!(second.body(), "2");
    }

    #[tokio::test]
    async fn layer_copies_middleware_headers() {
        let gatekeeper = Gatekeeper::builder(Authenticator::<TestUser>::new(NoUserBackend))
            .config(config())
            .middleware(crate::middleware::from_callback("powered-by", |cx, done| {
                cx.response_mut().headers.insert(
                    "x-powered-by",
                    http::HeaderValue::from_static("gatekeeper"),
                );
                done.complete(());
            }))
            .build()
            .unwrap();
        let service = gatekeeper.layer().layer(tower::service_fn(empty));

        let response = service.oneshot(http::Request::new(())).await.unwrap();

        assert_eq!(response.headers()["x-powered-by"], "gatekeeper");
    }

    #[tokio::test]
    async fn layer_reports_middleware_failure() {
        let gatekeeper = Gatekeeper::builder(Authenticator::<TestUser>::new(NoUserBackend))
            .config(config())
            .middleware(crate::middleware::from_callback("broken", |_, done| {
                done.fail("broken");
            }))
            .build()
            .unwrap();
        let service = gatekeeper.layer().layer(tower::service_fn(empty));

        let error = service.oneshot(http::Request::new(())).await.unwrap_err();

        let error = error.downcast::<crate::Error>().unwrap();
        assert_eq!(error.failed_middleware(), Some("broken"));
    }
}
