// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A typed, length-prefixed message framing core for exchanging strongly
//! typed binary messages between a server and many TCP clients.
//!
//! The crate gives applications three things to build on:
//!
//! - [`Message`] / [`MessageHeader`] / [`MessageKind`]: a push/pop byte-stack
//!   body under a fixed-width typed header.
//! - [`ClientEndpoint`]: one outbound connection, its own reactor thread, an
//!   inbound queue to poll.
//! - [`ServerEndpoint`]: an accept loop, a set of live connections, a
//!   broadcast routine, and four overridable hooks ([`ServerHooks`]).
//!
//! Everything else — the handshake, the framed read/write state machine, the
//! teardown path — lives in [`connection`] and is driven entirely by
//! [`reactor`]; application code never touches either directly.
//!
//! This is not a security boundary: the handshake only proves a peer knows
//! the fixed `scramble` transform, nothing more.

mod client;
mod connection;
mod error;
mod message;
mod queue;
mod reactor;
mod scramble;
mod server;

pub use client::ClientEndpoint;
pub use connection::{ConnectionHandle, OwnedMessage, Role};
pub use error::NetError;
pub use message::{Message, MessageHeader, MessageKind, HEADER_LEN};
pub use queue::TSQueue;
pub use server::{ServerCtx, ServerEndpoint, ServerHooks};
