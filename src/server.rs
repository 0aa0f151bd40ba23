// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Accepts connections from many clients and exposes the four overridable
//! hook points as a capability record: function-valued fields instead of a
//! trait the application would otherwise implement by inheritance.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{info, warn};
use mio::net::TcpListener;

use crate::connection::{ConnectionHandle, OwnedMessage};
use crate::message::{Message, MessageKind};
use crate::queue::TSQueue;
use crate::reactor::{Reactor, ReactorCommand, ReactorHandle, ReactorRole, ServerCallbacks};

/// The four customization points a server exposes to its application. Here
/// they are plain closures rather than virtual methods on a base class,
/// each defaulting to: accept everyone, log nothing, echo nothing back.
pub struct ServerHooks<K> {
    pub on_client_connection: Box<dyn Fn(Option<SocketAddr>) -> bool + Send + Sync>,
    pub on_client_validated: Box<dyn Fn(&ConnectionHandle<K>) + Send + Sync>,
    pub on_client_disconnect: Box<dyn Fn(&ConnectionHandle<K>) + Send + Sync>,
    pub on_message: Box<dyn Fn(&ServerCtx<'_, K>, &ConnectionHandle<K>, &mut Message<K>) + Send + Sync>,
}

impl<K> Default for ServerHooks<K> {
    fn default() -> Self {
        ServerHooks {
            on_client_connection: Box::new(|_| true),
            on_client_validated: Box::new(|_| {}),
            on_client_disconnect: Box::new(|_| {}),
            on_message: Box::new(|_, _, _| {}),
        }
    }
}

/// What `on_message` receives besides the sender and its message: a thin
/// borrow of the endpoint's reactor handle, so a handler can reply to the
/// sender or fan a message out to every other connection in the same call.
/// `ServerCtx` never outlives the `update()` call that builds it.
pub struct ServerCtx<'a, K> {
    handle: &'a ReactorHandle<K>,
}

impl<'a, K: MessageKind + Send + 'static> ServerCtx<'a, K> {
    /// Sends `msg` to every live connection except `except`, if given.
    pub fn broadcast(&self, msg: Message<K>, except: Option<&ConnectionHandle<K>>) {
        let _ = self
            .handle
            .cmd_tx
            .send(ReactorCommand::Broadcast(msg, except.map(|c| c.id())));
        let _ = self.handle.waker.wake();
    }

    /// Sends `msg` to exactly one connection.
    pub fn message_client(&self, conn: &ConnectionHandle<K>, msg: Message<K>) {
        conn.send(msg);
    }
}

struct HooksAdapter<K>(Arc<ServerHooks<K>>);

impl<K: Send> ServerCallbacks<K> for HooksAdapter<K> {
    fn on_client_connection(&self, addr: Option<SocketAddr>) -> bool {
        (self.0.on_client_connection)(addr)
    }

    fn on_client_validated(&self, conn: &ConnectionHandle<K>) {
        (self.0.on_client_validated)(conn)
    }

    fn on_client_disconnect(&self, conn: &ConnectionHandle<K>) {
        (self.0.on_client_disconnect)(conn)
    }
}

/// A listening endpoint that accepts clients, runs their handshakes and
/// framing on one reactor thread, and hands the application a queue of
/// inbound messages to drain on its own schedule: `update` is pull-based,
/// not callback-driven, for the message body itself.
pub struct ServerEndpoint<K> {
    port: u16,
    hooks: Arc<ServerHooks<K>>,
    handle: Option<ReactorHandle<K>>,
    join: Option<JoinHandle<()>>,
    incoming: Arc<TSQueue<OwnedMessage<K>>>,
}

/// Starting id handed to the first accepted client.
const FIRST_CLIENT_ID: u32 = 10000;

impl<K: MessageKind + Send + 'static> ServerEndpoint<K> {
    pub fn new(port: u16, hooks: ServerHooks<K>) -> Self {
        ServerEndpoint {
            port,
            hooks: Arc::new(hooks),
            handle: None,
            join: None,
            incoming: Arc::new(TSQueue::new()),
        }
    }

    /// Binds the listening socket and starts the reactor thread. Returns
    /// `false` on a bind failure (port in use, permission denied, ...)
    /// rather than panicking.
    pub fn start(&mut self) -> bool {
        if self.handle.is_some() {
            warn!("start() called while already running");
            return false;
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let std_listener = match StdTcpListener::bind(addr) {
            Ok(l) => l,
            Err(e) => {
                warn!("failed to bind {addr}: {e}");
                return false;
            }
        };
        if let Err(e) = std_listener.set_nonblocking(true) {
            warn!("failed to set listener non-blocking: {e}");
            return false;
        }
        let listener = TcpListener::from_std(std_listener);

        let role = ReactorRole::Server {
            listener,
            next_id: FIRST_CLIENT_ID,
            callbacks: Box::new(HooksAdapter(self.hooks.clone())),
        };

        let (reactor, handle) = match Reactor::build(role, self.incoming.clone()) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("failed to build server reactor: {e}");
                return false;
            }
        };

        let join = match std::thread::Builder::new()
            .name("msgnet-server".into())
            .spawn(move || reactor.run())
        {
            Ok(j) => j,
            Err(e) => {
                warn!("failed to spawn server reactor thread: {e}");
                return false;
            }
        };

        self.handle = Some(handle);
        self.join = Some(join);
        info!("server listening on {addr}");
        true
    }

    /// Stops accepting and tears down the reactor thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.cmd_tx.send(ReactorCommand::Shutdown);
            let _ = handle.waker.wake();
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("server reactor thread panicked");
            }
        }
    }

    /// Drains up to `max_messages` inbound messages (or all of them, if
    /// `None`), calling `on_message` for each. If `wait` is true and the
    /// queue is currently empty, blocks until at least one message arrives
    /// before returning.
    pub fn update(&self, max_messages: Option<usize>, wait: bool) -> usize {
        if wait && self.incoming.empty() {
            self.incoming.wait();
        }

        let Some(handle) = &self.handle else {
            return 0;
        };
        let ctx = ServerCtx { handle };

        let mut processed = 0;
        while max_messages.map(|max| processed < max).unwrap_or(true) {
            let Some(OwnedMessage { from, mut msg }) = self.incoming.pop_front() else {
                break;
            };
            if let Some(from) = from {
                (self.hooks.on_message)(&ctx, &from, &mut msg);
            }
            processed += 1;
        }
        processed
    }

    /// Sends `msg` to every currently connected client except `except`, if
    /// given. `except` lets the caller implement "relay to everyone else".
    pub fn broadcast(&self, msg: Message<K>, except: Option<&ConnectionHandle<K>>) {
        // The reactor does not track a roster the endpoint can iterate from
        // this thread; broadcasting is modeled as "send to everyone" by
        // asking the reactor to do the fan-out, which it can, since it is
        // the only thread that knows the live connection set.
        let Some(handle) = &self.handle else {
            return;
        };
        ServerCtx { handle }.broadcast(msg, except);
    }

    /// Sends `msg` to exactly one client.
    pub fn message_client(&self, conn: &ConnectionHandle<K>, msg: Message<K>) {
        conn.send(msg);
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl<K> Drop for ServerEndpoint<K> {
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
