// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Error kinds produced by the reactor and by application-facing decode calls.
//!
//! Transport failures (everything but [`NetError::DecodeUnderflow`]) are never
//! handed back to application code: the reactor logs them and tears the
//! connection down, and the application observes the fault lazily through
//! `is_connected()` or the `on_client_disconnect` hook. `DecodeUnderflow` is
//! the one variant returned synchronously, from `Message::pop`.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("failed to resolve host: {0}")]
    ResolveFailure(#[source] io::Error),

    #[error("failed to connect: {0}")]
    ConnectFailure(#[source] io::Error),

    #[error("handshake response did not match the expected value")]
    HandshakeMismatch,

    #[error("handshake did not complete before the deadline")]
    HandshakeTimeout,

    #[error("I/O failure on a live connection: {0}")]
    IOFailure(#[source] io::Error),

    #[error("failed to accept an incoming connection: {0}")]
    AcceptFailure(#[source] io::Error),

    #[error("attempted to pop {needed} bytes from a body with only {available} remaining")]
    DecodeUnderflow { needed: usize, available: usize },
}
