// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The application-facing handle to a single outbound connection. Owns a
//! reactor thread the way an asio-based client owns its `io_context` thread;
//! every public method here just talks to that thread through a channel or
//! a shared queue.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{info, warn};

use crate::connection::OwnedMessage;
use crate::message::{Message, MessageKind};
use crate::queue::TSQueue;
use crate::reactor::{Reactor, ReactorCommand, ReactorHandle, ReactorRole};

/// One outbound connection to a server speaking this protocol.
///
/// `connect` blocks the calling thread only long enough to resolve the
/// address and spawn the reactor; the TCP connect itself, the handshake, and
/// all subsequent framing happen on that reactor thread. `is_connected`
/// reflects the outcome once the handshake completes or fails.
pub struct ClientEndpoint<K> {
    handle: Option<ReactorHandle<K>>,
    join: Option<JoinHandle<()>>,
    incoming: Arc<TSQueue<OwnedMessage<K>>>,
}

impl<K: MessageKind + Send + 'static> Default for ClientEndpoint<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: MessageKind + Send + 'static> ClientEndpoint<K> {
    pub fn new() -> Self {
        ClientEndpoint {
            handle: None,
            join: None,
            incoming: Arc::new(TSQueue::new()),
        }
    }

    /// Resolves `host:port`, spawns the reactor thread, and asks it to
    /// connect. Returns `false` if the address fails to resolve at all;
    /// returns `true` otherwise even though the handshake may still fail
    /// asynchronously — this call never blocks on the handshake itself,
    /// it just fires off the connect.
    pub fn connect(&mut self, host: &str, port: u16) -> bool {
        let addr = match (host, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    warn!("{host}:{port} resolved to no addresses");
                    return false;
                }
            },
            Err(e) => {
                warn!("failed to resolve {host}:{port}: {e}");
                return false;
            }
        };

        self.disconnect();

        match self.spawn_reactor(addr) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to start client reactor: {e}");
                false
            }
        }
    }

    fn spawn_reactor(&mut self, addr: SocketAddr) -> std::io::Result<()> {
        let (reactor, handle) = Reactor::build(ReactorRole::Client, self.incoming.clone())?;
        let _ = handle.cmd_tx.send(ReactorCommand::Connect(addr));
        let _ = handle.waker.wake();
        let join = std::thread::Builder::new()
            .name("msgnet-client".into())
            .spawn(move || reactor.run())?;

        self.handle = Some(handle);
        self.join = Some(join);
        Ok(())
    }

    /// Enqueues `msg` to be sent on the reactor thread. A no-op, same as
    /// [`crate::ConnectionHandle::send`], if there is no live connection.
    pub fn send(&self, msg: Message<K>) {
        let Some(handle) = &self.handle else {
            return;
        };
        let _ = handle
            .cmd_tx
            .send(ReactorCommand::Conn(crate::connection::ConnCommand::Send(0, msg)));
        let _ = handle.waker.wake();
    }

    /// The queue of messages received from the server. Drain with
    /// `incoming().pop_front()` in a loop, or block on `incoming().wait()`.
    pub fn incoming(&self) -> &TSQueue<OwnedMessage<K>> {
        &self.incoming
    }

    pub fn is_connected(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| h.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Tears down the connection and stops the reactor thread. Safe to call
    /// more than once, and called automatically on drop.
    pub fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.cmd_tx.send(ReactorCommand::Shutdown);
            let _ = handle.waker.wake();
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("client reactor thread panicked");
            }
        }
        info!("client disconnected");
    }
}

impl<K> Drop for ClientEndpoint<K> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.cmd_tx.send(ReactorCommand::Shutdown);
            let _ = handle.waker.wake();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
