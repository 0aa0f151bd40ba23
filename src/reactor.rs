// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The single-threaded event reactor an endpoint owns. All socket work —
//! handshakes, framed reads/writes, accepts — executes here, serialized;
//! application threads only ever post commands in and drain the inbound
//! queue.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::connection::{
    ConnCommand, ConnState, ConnectionHandle, OwnedMessage, PumpOutcome, Role,
};
use crate::message::{Message, MessageKind};
use crate::queue::TSQueue;

const WAKE_TOKEN: Token = Token(usize::MAX);
const ACCEPT_TOKEN: Token = Token(usize::MAX - 1);
const TICK: Duration = Duration::from_millis(250);

/// Everything an application thread can post into a running reactor.
pub(crate) enum ReactorCommand<K> {
    /// Client only: resolve + initiate an outbound connect.
    Connect(SocketAddr),
    Conn(ConnCommand<K>),
    /// Server only: send to every live, validated connection except `except`.
    Broadcast(Message<K>, Option<u32>),
    Shutdown,
}

/// The four overridable server hooks, expressed as a capability record
/// rather than a trait an application implements by inheritance — there is
/// exactly one implementor of this trait, a small adapter built from a
/// `ServerHooks<K>` of plain closures (see `server.rs`).
pub(crate) trait ServerCallbacks<K>: Send {
    fn on_client_connection(&self, addr: Option<SocketAddr>) -> bool;
    fn on_client_validated(&self, conn: &ConnectionHandle<K>);
    fn on_client_disconnect(&self, conn: &ConnectionHandle<K>);
}

pub(crate) enum ReactorRole<K> {
    Client,
    Server {
        listener: TcpListener,
        next_id: u32,
        callbacks: Box<dyn ServerCallbacks<K>>,
    },
}

pub(crate) struct Reactor<K> {
    poll: Poll,
    cmd_rx: Receiver<ReactorCommand<K>>,
    cmd_tx: Sender<ReactorCommand<K>>,
    conns: HashMap<Token, ConnState<K>>,
    id_tokens: HashMap<u32, Token>,
    next_token: usize,
    in_queue: Arc<TSQueue<OwnedMessage<K>>>,
    role: ReactorRole<K>,
    shutdown: bool,
    /// Mirrors "is there a live, validated connection" for `ClientEndpoint`.
    /// Servers have no single answer to that question and simply never read
    /// it back.
    connected: Arc<AtomicBool>,
    /// Handed out to every `ConnectionHandle` so posting a command can wake
    /// this reactor's `poll` immediately instead of waiting for the next
    /// tick or unrelated socket readiness.
    waker: Arc<Waker>,
}

/// What `spawn` hands back to the endpoint that owns this reactor.
pub(crate) struct ReactorHandle<K> {
    pub cmd_tx: Sender<ReactorCommand<K>>,
    pub waker: Arc<Waker>,
    pub connected: Arc<AtomicBool>,
}

impl<K: MessageKind + Send + 'static> Reactor<K> {
    /// Builds the reactor and returns it together with the handle the owning
    /// endpoint keeps on its own thread. Does not start servicing events —
    /// call `run` on a spawned thread for that.
    pub(crate) fn build(
        mut role: ReactorRole<K>,
        in_queue: Arc<TSQueue<OwnedMessage<K>>>,
    ) -> io::Result<(Self, ReactorHandle<K>)> {
        let poll = Poll::new()?;
        let waker: Arc<Waker> = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let connected = Arc::new(AtomicBool::new(false));

        if let ReactorRole::Server { listener, .. } = &mut role {
            poll.registry()
                .register(listener, ACCEPT_TOKEN, Interest::READABLE)?;
        }

        let reactor = Reactor {
            poll,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            conns: HashMap::new(),
            id_tokens: HashMap::new(),
            next_token: 0,
            in_queue,
            role,
            shutdown: false,
            connected: connected.clone(),
            waker: waker.clone(),
        };
        let handle = ReactorHandle { cmd_tx, waker, connected };
        Ok((reactor, handle))
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Runs until a `Shutdown` command is received. Meant to be the entire
    /// body of the reactor thread.
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("reactor poll failed: {e}");
                break;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    self.drain_commands();
                } else if token == ACCEPT_TOKEN {
                    self.accept_loop();
                } else {
                    self.service(token, event.is_readable(), event.is_writable());
                }
            }

            self.check_handshake_deadlines();

            if self.shutdown {
                self.teardown_all();
                break;
            }
        }
        debug!("reactor thread exiting");
    }

    /// Tears down every connection still live at shutdown, firing
    /// `on_client_disconnect` for each the same way a mid-run I/O fault
    /// would, rather than letting them be silently dropped.
    fn teardown_all(&mut self) {
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            self.teardown(token);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                ReactorCommand::Connect(addr) => self.start_connect(addr),
                ReactorCommand::Conn(ConnCommand::Send(id, msg)) => self.handle_send(id, msg),
                ReactorCommand::Conn(ConnCommand::Disconnect(id)) => self.handle_disconnect(id),
                ReactorCommand::Broadcast(msg, except) => self.handle_broadcast(msg, except),
                ReactorCommand::Shutdown => self.shutdown = true,
            }
        }
    }

    fn start_connect(&mut self, addr: SocketAddr) {
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                let token = self.alloc_token();
                if let Err(e) = self.poll.registry().register(
                    &mut stream,
                    token,
                    Interest::READABLE.add(Interest::WRITABLE),
                ) {
                    error!("failed to register client socket: {e}");
                    return;
                }
                let conn = ConnState::new_client(stream, token);
                self.conns.insert(token, conn);
                self.id_tokens.insert(0, token);
            }
            Err(e) => warn!("connect to {addr} failed: {e}"),
        }
    }

    fn handle_send(&mut self, id: u32, msg: Message<K>) {
        let Some(&token) = self.id_tokens.get(&id) else {
            return;
        };
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if conn.is_closed() {
            return;
        }
        if conn.enqueue_out(msg) {
            self.rearm(token);
        }
    }

    fn handle_disconnect(&mut self, id: u32) {
        let Some(&token) = self.id_tokens.get(&id) else {
            return;
        };
        self.teardown(token);
    }

    fn handle_broadcast(&mut self, msg: Message<K>, except: Option<u32>) {
        let targets: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| !c.is_closed() && Some(c.id) != except)
            .map(|(t, _)| *t)
            .collect();

        for token in targets {
            let Some(conn) = self.conns.get_mut(&token) else {
                continue;
            };
            if conn.enqueue_out(msg.clone()) {
                self.rearm(token);
            }
        }
    }

    fn rearm(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let interest = conn.desired_interest();
        let _ = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, interest);
    }

    fn accept_loop(&mut self) {
        loop {
            let accepted = match &mut self.role {
                ReactorRole::Server { listener, .. } => listener.accept(),
                ReactorRole::Client => return,
            };
            match accepted {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        let (accept, id) = match &mut self.role {
            ReactorRole::Server { callbacks, next_id, .. } => {
                let accept = callbacks.on_client_connection(Some(addr));
                let id = *next_id;
                if accept {
                    *next_id += 1;
                }
                (accept, id)
            }
            ReactorRole::Client => return,
        };

        if !accept {
            debug!("connection from {addr} rejected by on_client_connection");
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }

        let token = self.alloc_token();
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE.add(Interest::WRITABLE),
        ) {
            error!("failed to register accepted socket: {e}");
            return;
        }

        let conn = ConnState::new_server(stream, token, id);
        self.conns.insert(token, conn);
        self.id_tokens.insert(id, token);
    }

    fn service(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let outcomes = conn.pump(readable, writable);

        for outcome in outcomes {
            match outcome {
                PumpOutcome::Continue => {}
                PumpOutcome::Validated => self.on_validated(token),
                PumpOutcome::Delivered(msg) => self.on_delivered(token, msg),
                PumpOutcome::Failed(err) => {
                    warn!("connection fault: {err}");
                    self.teardown(token);
                    return;
                }
            }
        }

        let closed = self.conns.get(&token).map(|c| c.is_closed()).unwrap_or(true);
        if !closed {
            self.rearm(token);
        }
    }

    fn on_validated(&mut self, token: Token) {
        let Some(conn) = self.conns.get(&token) else {
            return;
        };
        let id = conn.id;
        self.connected.store(true, Ordering::SeqCst);
        if let ReactorRole::Server { callbacks, .. } = &self.role {
            let handle = self.make_handle(id);
            callbacks.on_client_validated(&handle);
        }
    }

    fn on_delivered(&mut self, token: Token, msg: Message<K>) {
        let Some(conn) = self.conns.get(&token) else {
            return;
        };
        let from = match conn.role {
            Role::Server => Some(self.make_handle(conn.id)),
            Role::Client => None,
        };
        self.in_queue.push_back(OwnedMessage { from, msg });
    }

    fn make_handle(&self, id: u32) -> ConnectionHandle<K> {
        ConnectionHandle::new(id, self.cmd_tx.clone(), self.waker.clone())
    }

    fn teardown(&mut self, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            let id = conn.id;
            conn.mark_closed();
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.id_tokens.remove(&id);
            if matches!(conn.role, Role::Client) {
                self.connected.store(false, Ordering::SeqCst);
            }
            if let ReactorRole::Server { callbacks, .. } = &self.role {
                let handle = ConnectionHandle::new(id, self.cmd_tx.clone(), self.waker.clone());
                callbacks.on_client_disconnect(&handle);
            }
        }
    }

    fn check_handshake_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| c.handshake_deadline_passed(now))
            .map(|(t, _)| *t)
            .collect();
        for token in expired {
            warn!("handshake deadline exceeded, closing connection");
            self.teardown(token);
        }
    }
}
