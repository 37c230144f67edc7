//! Gatekeeper is a request gatekeeping layer for Rust web services. It runs a
//! fixed, ordered chain of middlewares (sessions, then authentication) in
//! front of request handlers and answers the questions pages ask about the
//! current visitor: who is logged in, and may they see this?
//!
//! ## Features
//!
//! * **Sessions**: signed session cookies backed by any
//!   [`tower_sessions::SessionStore`], with the usual `resave`,
//!   `save_uninitialized` and `rolling` knobs. See [`session`].
//! * **Authentication**: pluggable user backends and named authentication
//!   strategies, with session restore and session fixation protection. See
//!   [`auth`].
//! * **Access control**: [`Gatekeeper::access`] turns a predicate over the
//!   current user into a serializable [`AccessDecision`] (a redirect or page
//!   props).
//! * **Framework agnostic**: everything works on a [`RequestContext`] made
//!   of plain [`http`] request and response heads; a [`tower`] layer is
//!   provided for services built on `http` types. See [`layer`].
//!
//! ## Example
//!
//! ```
//! use gatekeeper::auth::{AuthUser, Authenticator, NoUserBackend, UserId};
//! use gatekeeper::config::{GatekeeperConfig, SecretKey};
//! use gatekeeper::{AccessDecision, ContextHandler, Gatekeeper, RequestContext};
//!
//! #[derive(Clone)]
//! struct User {
//!     id: i64,
//!     admin: bool,
//! }
//!
//! impl AuthUser for User {
//!     fn id(&self) -> UserId {
//!         UserId::Int(self.id)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> gatekeeper::Result<()> {
//! let gatekeeper = Gatekeeper::builder(Authenticator::<User>::new(NoUserBackend))
//!     .config(
//!         GatekeeperConfig::builder()
//!             .secret_key(SecretKey::from("keyboard cat"))
//!             .build(),
//!     )
//!     .build()?;
//!
//! let admin_page = gatekeeper.access(|user| user.admin, "/admin/home", Some("/login"));
//!
//! let (mut cx, ()) = RequestContext::from_request(http::Request::get("/admin").body(()).unwrap());
//! assert_eq!(
//!     admin_page.handle(&mut cx).await?,
//!     AccessDecision::redirect("/login")
//! );
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod auth;
pub mod config;
mod context;
mod error;
mod gatekeeper;
mod handler;
pub mod layer;
pub mod middleware;
mod serializers;
pub mod session;

pub use error::{BoxError, Error};

pub use crate::context::{RequestContext, RequestHead, ResponseHead};
pub use crate::gatekeeper::{
    Access, AccessDecision, Authenticate, Control, Gatekeeper, GatekeeperBuilder, Props,
    RedirectTarget, SuccessAction,
};
pub use crate::handler::{ContextHandler, HandlerFn, handler_fn};

/// A type alias for a result that can return a [`gatekeeper::Error`](Error).
pub type Result<T> = std::result::Result<T, Error>;
