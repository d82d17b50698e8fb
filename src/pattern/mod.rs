//! Predefined interaction patterns.
//!
//! An interaction pattern can be as simple as an rpc call or something more
//! complex such as bidirectional streaming.
//!
//! Each pattern defines different associated message types for the interaction.
//!
//! On the server side every pattern watches the call's cancellation token,
//! and on the client side dropping the returned sink or stream before the
//! call is done cancels the call on the server.
pub mod bidi_streaming;
pub mod client_streaming;
pub mod rpc;
pub mod server_streaming;
