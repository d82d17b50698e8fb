//! A versioned catalog rpc service
//!
//! The crate is split into a small streaming rpc core and the catalog service
//! built on top of it.
//!
//! The core knows four interaction patterns, see [message]:
//! - unary rpc, 1 request, 1 response
//! - server streaming, 1 request, stream of responses
//! - client streaming, 1 request, stream of updates, 1 response
//! - bidi streaming, 1 request, stream of updates, stream of responses
//!
//! Every call gets its own bidirectional typed channel from a [transport].
//! A channel direction ends either with an explicit *finish* (the sender
//! closed its sink) or with a *reset* (the sender went away). Only a finish
//! counts as a normal end of a stream.
//!
//! The catalog service is defined twice, as [proto::v1] and [proto::v2], and
//! both versions are served from one endpoint by [service::serve].
//!
//! # Example
//! ```
//! # async fn example() -> anyhow::Result<()> {
//! use catalog_rpc::{
//!     proto::{v1, CatalogService},
//!     service, transport::flume, RpcClient, RpcServer,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let (listener, connector) = flume::channel(1);
//! let server = RpcServer::<CatalogService, _>::new(listener);
//! let shutdown = CancellationToken::new();
//! tokio::spawn(service::serve(server, shutdown.clone()));
//!
//! let client = RpcClient::<CatalogService, _>::new(connector).map::<v1::CatalogApiV1>();
//! let pong = client
//!     .rpc(v1::PingRequest {
//!         message: "hello".into(),
//!     })
//!     .await?;
//! assert_eq!(pong.message, "pong: hello");
//! shutdown.cancel();
//! # Ok(())
//! # }
//! ```
//!
//! # Features
#![doc = document_features::document_features!()]
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![cfg_attr(catalogrpc_docsrs, feature(doc_cfg))]
use std::fmt::{Debug, Display};

use serde::{de::DeserializeOwned, Serialize};
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
#[cfg(feature = "cli")]
#[cfg_attr(catalogrpc_docsrs, doc(cfg(feature = "cli")))]
pub mod logging;
pub mod message;
pub mod pattern;
pub mod proto;
pub mod resilience;
pub mod server;
pub mod service;
pub mod transport;
pub use client::RpcClient;
pub use error::CallError;
pub use server::RpcServer;

/// Requirements for a RPC message
///
/// Even when just using the mem transport, we require messages to be Serializable and
/// Deserializable.
/// Likewise, even when using the tcp transport, we require messages to be Send.
pub trait RpcMessage: Debug + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

impl<T> RpcMessage for T where
    T: Debug + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static
{
}

/// Requirements for an internal error
///
/// All errors have to be Send, Sync and 'static so they can be sent across threads.
/// They also have to be convertible to [`anyhow::Error`] so the caller facing
/// [`CallError`] can carry them.
pub trait RpcError: Debug + Display + Into<anyhow::Error> + Send + Sync + Unpin + 'static {}

impl<T> RpcError for T where
    T: Debug + Display + Into<anyhow::Error> + Send + Sync + Unpin + 'static
{
}

/// A service
///
/// A service has request and response message types. These types have to be the
/// union of all possible request and response types for all interactions with
/// the service.
///
/// Usually you will define an enum for the request and response
/// type, and use the [derive_more](https://crates.io/crates/derive_more) crate to
/// define the conversions between the enum and the actual request and response types.
pub trait Service: Send + Sync + Debug + Clone + 'static {
    /// Type of request messages
    type Req: RpcMessage;
    /// Type of response messages
    type Res: RpcMessage;
}

/// A connector to a specific service
///
/// This is just a trait alias for a [`transport::Connector`] with the right types. It is used
/// to make it easier to specify the bounds of a connector that matches a specific
/// service.
pub trait Connector<S: Service>: transport::Connector<In = S::Res, Out = S::Req> {}

impl<T: transport::Connector<In = S::Res, Out = S::Req>, S: Service> Connector<S> for T {}

/// A listener for a specific service
///
/// This is just a trait alias for a [`transport::Listener`] with the right types. It is used
/// to make it easier to specify the bounds of a listener that matches a specific
/// service.
pub trait Listener<S: Service>: transport::Listener<In = S::Req, Out = S::Res> {}

impl<T: transport::Listener<In = S::Req, Out = S::Res>, S: Service> Listener<S> for T {}
