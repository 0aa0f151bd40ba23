// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The per-socket framing and lifecycle engine.
//!
//! Everything in this module runs exclusively on the reactor thread that
//! owns it: the read/write state machines carry no internal locking because
//! there is exactly one mutator. Application threads never touch a
//! `ConnState` directly; they hold a cheap, `Clone`-able
//! [`ConnectionHandle`] and post commands to the reactor over a channel.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::Sender;
use mio::net::TcpStream;
use mio::{Interest, Token, Waker};

use crate::error::NetError;
use crate::message::{Message, MessageHeader, MessageKind, HEADER_LEN};
use crate::queue::TSQueue;
use crate::reactor::ReactorCommand;
use crate::scramble::scramble;

/// How long a connection may sit in the handshake phase before the reactor
/// closes it.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Commands a [`ConnectionHandle`] posts to its owning reactor. The reactor
/// is the sole place these are ever acted on.
pub(crate) enum ConnCommand<K> {
    Send(u32, Message<K>),
    Disconnect(u32),
}

/// A cheap, `Send + Sync`, `Clone`-able reference to a connection living on
/// some reactor thread. Holding one does not keep the connection alive — it
/// is just an id plus a channel; posting to a connection that has already
/// been torn down is a harmless no-op once the reactor notices the id is
/// gone from its table.
#[derive(Clone)]
pub struct ConnectionHandle<K> {
    id: u32,
    cmd_tx: Sender<ReactorCommand<K>>,
    waker: std::sync::Arc<Waker>,
}

impl<K> ConnectionHandle<K> {
    pub(crate) fn new(id: u32, cmd_tx: Sender<ReactorCommand<K>>, waker: std::sync::Arc<Waker>) -> Self {
        ConnectionHandle { id, cmd_tx, waker }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Enqueues `msg` for sending. A void operation; failures are only ever
    /// observed lazily via `is_connected()`.
    ///
    /// The command is posted to the reactor's channel and the reactor's poll
    /// is woken explicitly: the command channel and the wakeup mechanism are
    /// separate, so every poster must wake the `Waker` itself or the command
    /// sits unseen until unrelated socket activity next polls it.
    pub fn send(&self, msg: Message<K>) {
        let _ = self
            .cmd_tx
            .send(ReactorCommand::Conn(ConnCommand::Send(self.id, msg)));
        let _ = self.waker.wake();
    }

    /// Idempotent: posting a disconnect for an id the reactor no longer
    /// knows about is simply ignored.
    pub fn disconnect(&self) {
        let _ = self
            .cmd_tx
            .send(ReactorCommand::Conn(ConnCommand::Disconnect(self.id)));
        let _ = self.waker.wake();
    }
}

impl<K> std::fmt::Debug for ConnectionHandle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").field("id", &self.id).finish()
    }
}

impl<K> PartialEq for ConnectionHandle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<K> Eq for ConnectionHandle<K> {}

/// A decoded message paired with a back-reference to the connection it
/// arrived on. `from` is `None` on the client side, since there is only
/// ever one peer to reply to.
pub struct OwnedMessage<K> {
    pub from: Option<ConnectionHandle<K>>,
    pub msg: Message<K>,
}

/// One step of a fixed-size, possibly-partial non-blocking read or write.
/// Both the handshake and the frame header/body use this: a small buffer
/// that may take several readiness events to fill or drain.
struct PartialBuf {
    buf: Vec<u8>,
    filled: usize,
}

impl PartialBuf {
    fn new(len: usize) -> Self {
        PartialBuf { buf: vec![0u8; len], filled: 0 }
    }

    fn from_vec(buf: Vec<u8>) -> Self {
        PartialBuf { buf, filled: 0 }
    }

    fn is_complete(&self) -> bool {
        self.filled == self.buf.len()
    }

    /// Reads as much as is available without blocking. Returns `Ok(true)`
    /// once the buffer is full, `Ok(false)` if the peer would block with
    /// more still to read, `Err` on a real I/O fault (EOF counts as a
    /// fault: a short read never recovers).
    fn read_more(&mut self, stream: &mut TcpStream) -> io::Result<bool> {
        loop {
            if self.is_complete() {
                return Ok(true);
            }
            match stream.read(&mut self.buf[self.filled..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-frame")),
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn write_more(&mut self, stream: &mut TcpStream) -> io::Result<bool> {
        loop {
            if self.is_complete() {
                return Ok(true);
            }
            match stream.write(&self.buf[self.filled..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned zero")),
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn encode_header<K: MessageKind>(header: &MessageHeader<K>) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    LittleEndian::write_u32(&mut buf[0..4], header.kind.to_wire());
    LittleEndian::write_u32(&mut buf[4..8], header.size);
    buf
}

fn decode_header<K: MessageKind>(buf: &[u8]) -> MessageHeader<K> {
    let kind = K::from_wire(LittleEndian::read_u32(&buf[0..4]));
    let size = LittleEndian::read_u32(&buf[4..8]);
    MessageHeader { kind, size }
}

/// The state a live (post-handshake) connection cycles through while
/// assembling one inbound frame, the single in-flight "staging message".
enum ReadPhase<K> {
    Header(PartialBuf, std::marker::PhantomData<K>),
    Body(MessageHeader<K>, PartialBuf),
}

impl<K: MessageKind> ReadPhase<K> {
    fn new() -> Self {
        ReadPhase::Header(PartialBuf::new(HEADER_LEN), std::marker::PhantomData)
    }
}

/// Progress of the single front-of-queue message currently being drained to
/// the socket: at most one header write and one body write in flight at a
/// time.
enum WritePhase<K> {
    Idle,
    Header(Message<K>, PartialBuf),
    Body(PartialBuf),
}

/// Where a connection sits in its handshake before it is allowed into the
/// framed read/write loop.
pub(crate) enum HandshakePhase {
    /// Client: waiting to read the server's 8-byte challenge.
    ClientAwaitChallenge(PartialBuf),
    /// Client: writing back `scramble(challenge)`.
    ClientSendResponse(PartialBuf),
    /// Server: writing its freshly generated challenge.
    ServerSendChallenge(PartialBuf, u64),
    /// Server: reading the client's response, comparing against `expected`.
    ServerAwaitResponse(PartialBuf, u64),
}

pub(crate) enum Phase<K> {
    Handshaking(HandshakePhase, Instant),
    Live(ReadPhase<K>, WritePhase<K>),
    Closed,
}

/// The per-socket state machine. Lives inside the reactor's connection
/// table; never shared across threads.
pub(crate) struct ConnState<K> {
    pub id: u32,
    pub role: Role,
    pub token: Token,
    pub stream: TcpStream,
    pub peer_addr: Option<SocketAddr>,
    pub out_queue: TSQueue<Message<K>>,
    pub phase: Phase<K>,
    pub validated: bool,
    pub writable_interest: bool,
}

/// Outcome the reactor acts on after pumping a connection's state machine.
pub(crate) enum PumpOutcome<K> {
    /// Nothing of note; keep going.
    Continue,
    /// The connection just finished its handshake.
    Validated,
    /// A complete frame was assembled and should be delivered to the owner's
    /// inbound queue.
    Delivered(Message<K>),
    /// The connection suffered a fault and must be torn down.
    Failed(NetError),
}

impl<K: MessageKind> ConnState<K> {
    pub fn new_client(stream: TcpStream, token: Token) -> Self {
        ConnState {
            id: 0,
            role: Role::Client,
            token,
            peer_addr: stream.peer_addr().ok(),
            stream,
            out_queue: TSQueue::new(),
            phase: Phase::Handshaking(
                HandshakePhase::ClientAwaitChallenge(PartialBuf::new(8)),
                Instant::now(),
            ),
            validated: false,
            writable_interest: false,
        }
    }

    pub fn new_server(stream: TcpStream, token: Token, id: u32) -> Self {
        let challenge = crate::scramble::next_challenge();
        let expected = scramble(challenge);
        let mut challenge_buf = PartialBuf::new(8);
        LittleEndian::write_u64(&mut challenge_buf.buf, challenge);

        ConnState {
            id,
            role: Role::Server,
            token,
            peer_addr: stream.peer_addr().ok(),
            stream,
            out_queue: TSQueue::new(),
            phase: Phase::Handshaking(
                HandshakePhase::ServerSendChallenge(challenge_buf, expected),
                Instant::now(),
            ),
            validated: false,
            writable_interest: true,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.phase, Phase::Live(..))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    pub fn handshake_deadline_passed(&self, now: Instant) -> bool {
        matches!(&self.phase, Phase::Handshaking(_, started) if now.duration_since(*started) >= HANDSHAKE_TIMEOUT)
    }

    /// Mio readiness `Interest` this connection currently wants registered.
    pub fn desired_interest(&self) -> Interest {
        let want_write = match &self.phase {
            Phase::Handshaking(HandshakePhase::ClientSendResponse(_), _) => true,
            Phase::Handshaking(HandshakePhase::ServerSendChallenge(_, _), _) => true,
            Phase::Handshaking(_, _) => false,
            Phase::Live(_, write) => {
                !matches!(write, WritePhase::Idle) || self.writable_interest || !self.out_queue.empty()
            }
            Phase::Closed => false,
        };
        let want_read = match &self.phase {
            Phase::Handshaking(HandshakePhase::ClientAwaitChallenge(_), _) => true,
            Phase::Handshaking(HandshakePhase::ServerAwaitResponse(_, _), _) => true,
            Phase::Handshaking(_, _) => false,
            Phase::Live(..) => true,
            Phase::Closed => false,
        };
        match (want_read, want_write) {
            (true, true) => Interest::READABLE.add(Interest::WRITABLE),
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => Interest::READABLE,
        }
    }

    /// Queues `msg`. Returns `true` iff the queue was empty beforehand, i.e.
    /// the write pipeline needs priming (the empty-before-send check).
    pub fn enqueue_out(&self, msg: Message<K>) -> bool {
        let was_empty = self.out_queue.empty();
        self.out_queue.push_back(msg);
        was_empty
    }

    pub fn mark_closed(&mut self) {
        self.phase = Phase::Closed;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    /// Drives the state machine once in response to a readable/writable
    /// event. May produce several outcomes in sequence (e.g. validated then
    /// immediately the first delivered frame); the reactor calls this in a
    /// loop, pushing every outcome, until it returns `Continue` with nothing
    /// left to do or `Failed`/closed.
    pub fn pump(&mut self, readable: bool, writable: bool) -> Vec<PumpOutcome<K>> {
        let mut out = Vec::new();
        loop {
            match &mut self.phase {
                Phase::Closed => break,
                Phase::Handshaking(_, _) => match self.pump_handshake(readable, writable) {
                    Ok(Some(outcome)) => {
                        let keep_going = matches!(outcome, PumpOutcome::Validated);
                        out.push(outcome);
                        if !keep_going {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.mark_closed();
                        out.push(PumpOutcome::Failed(e));
                        break;
                    }
                },
                Phase::Live(..) => match self.pump_live(readable, writable) {
                    Ok(Some(outcome)) => out.push(outcome),
                    Ok(None) => break,
                    Err(e) => {
                        self.mark_closed();
                        out.push(PumpOutcome::Failed(e));
                        break;
                    }
                },
            }
        }
        out
    }

    fn pump_handshake(&mut self, readable: bool, writable: bool) -> io::Result<Option<PumpOutcome<K>>> {
        let Phase::Handshaking(state, _) = &mut self.phase else {
            return Ok(None);
        };

        match state {
            HandshakePhase::ClientAwaitChallenge(buf) => {
                if !readable {
                    return Ok(None);
                }
                if !buf.read_more(&mut self.stream)? {
                    return Ok(None);
                }
                let challenge = LittleEndian::read_u64(&buf.buf);
                let response = scramble(challenge);
                let mut response_buf = PartialBuf::new(8);
                LittleEndian::write_u64(&mut response_buf.buf, response);
                self.phase = Phase::Handshaking(
                    HandshakePhase::ClientSendResponse(response_buf),
                    Instant::now(),
                );
                self.writable_interest = true;
                Ok(None)
            }
            HandshakePhase::ClientSendResponse(buf) => {
                if !writable {
                    return Ok(None);
                }
                if !buf.write_more(&mut self.stream)? {
                    return Ok(None);
                }
                self.writable_interest = false;
                self.phase = Phase::Live(ReadPhase::new(), WritePhase::Idle);
                self.validated = true;
                Ok(Some(PumpOutcome::Validated))
            }
            HandshakePhase::ServerSendChallenge(buf, expected) => {
                if !writable {
                    return Ok(None);
                }
                if !buf.write_more(&mut self.stream)? {
                    return Ok(None);
                }
                let expected = *expected;
                self.phase = Phase::Handshaking(
                    HandshakePhase::ServerAwaitResponse(PartialBuf::new(8), expected),
                    Instant::now(),
                );
                self.writable_interest = false;
                Ok(None)
            }
            HandshakePhase::ServerAwaitResponse(buf, expected) => {
                if !readable {
                    return Ok(None);
                }
                if !buf.read_more(&mut self.stream)? {
                    return Ok(None);
                }
                let response = LittleEndian::read_u64(&buf.buf);
                if response != *expected {
                    self.mark_closed();
                    return Ok(Some(PumpOutcome::Failed(NetError::HandshakeMismatch)));
                }
                self.phase = Phase::Live(ReadPhase::new(), WritePhase::Idle);
                self.validated = true;
                Ok(Some(PumpOutcome::Validated))
            }
        }
    }

    fn pump_live(&mut self, readable: bool, writable: bool) -> io::Result<Option<PumpOutcome<K>>> {
        if writable {
            if let Some(outcome) = self.pump_write()? {
                return Ok(Some(outcome));
            }
        }
        if readable {
            if let Some(outcome) = self.pump_read()? {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    fn pump_read(&mut self) -> io::Result<Option<PumpOutcome<K>>> {
        let Phase::Live(read, _) = &mut self.phase else {
            return Ok(None);
        };

        match read {
            ReadPhase::Header(buf, _) => {
                if !buf.read_more(&mut self.stream)? {
                    return Ok(None);
                }
                let header: MessageHeader<K> = decode_header(&buf.buf);
                let body_len = (header.size as usize).saturating_sub(HEADER_LEN);

                if body_len == 0 {
                    let msg = Message { header, body: Vec::new() };
                    if let Phase::Live(read, _) = &mut self.phase {
                        *read = ReadPhase::new();
                    }
                    return Ok(Some(PumpOutcome::Delivered(msg)));
                }

                if let Phase::Live(read, _) = &mut self.phase {
                    *read = ReadPhase::Body(header, PartialBuf::new(body_len));
                }
                self.pump_read()
            }
            ReadPhase::Body(header, buf) => {
                if !buf.read_more(&mut self.stream)? {
                    return Ok(None);
                }
                let header = *header;
                let body = std::mem::take(&mut buf.buf);
                let msg = Message { header, body };
                if let Phase::Live(read, _) = &mut self.phase {
                    *read = ReadPhase::new();
                }
                Ok(Some(PumpOutcome::Delivered(msg)))
            }
        }
    }

    fn pump_write(&mut self) -> io::Result<Option<PumpOutcome<K>>> {
        let Phase::Live(_, write) = &mut self.phase else {
            return Ok(None);
        };

        if matches!(write, WritePhase::Idle) {
            match self.out_queue.pop_front() {
                Some(msg) => {
                    let header_buf = PartialBuf::from_vec(encode_header(&msg.header).to_vec());
                    if let Phase::Live(_, write) = &mut self.phase {
                        *write = WritePhase::Header(msg, header_buf);
                    }
                }
                None => return Ok(None),
            }
        }

        let Phase::Live(_, write) = &mut self.phase else {
            return Ok(None);
        };

        match write {
            WritePhase::Header(msg, buf) => {
                if !buf.write_more(&mut self.stream)? {
                    return Ok(None);
                }
                let is_empty = msg.body.is_empty();
                if is_empty {
                    if let Phase::Live(_, write) = &mut self.phase {
                        *write = WritePhase::Idle;
                    }
                } else {
                    let body = std::mem::take(&mut msg.body);
                    let body_buf = PartialBuf::from_vec(body);
                    if let Phase::Live(_, write) = &mut self.phase {
                        *write = WritePhase::Body(body_buf);
                    }
                }
                self.pump_write()
            }
            WritePhase::Body(buf) => {
                if !buf.write_more(&mut self.stream)? {
                    return Ok(None);
                }
                if let Phase::Live(_, write) = &mut self.phase {
                    *write = WritePhase::Idle;
                }
                self.pump_write()
            }
            WritePhase::Idle => Ok(None),
        }
    }
}
