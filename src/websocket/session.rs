//! WebSocket sessions over [`TcpConnection`]s.

use crate::error::{Error, Result};
use crate::http::{Method, RequestParser, Response};
use crate::net::{ConnectionHandler, TcpConnection};
use crate::websocket::frame::{Frame, MAX_CONTROL_PAYLOAD, Message, MessageReader, Opcode, Role, close_code};
use crate::websocket::handshake::{self, ResponseReader};

use futures::channel::oneshot;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub type WsOpenCallback = Arc<dyn Fn(&WsSession) + Send + Sync>;
pub type WsTextCallback = Arc<dyn Fn(&WsSession, &str) + Send + Sync>;
/// Receives binary messages, and the payload of PING and PONG frames.
pub type WsBytesCallback = Arc<dyn Fn(&WsSession, &[u8]) + Send + Sync>;
/// Receives the close code and reason. The code is 1005 when the peer sent
/// none and 1006 when the connection dropped without a close frame.
pub type WsCloseCallback = Arc<dyn Fn(&WsSession, u16, &str) + Send + Sync>;
pub type WsErrorCallback = Arc<dyn Fn(&WsSession, &Error) + Send + Sync>;

/// Closures invoked for the events of every session of a server or client.
///
/// Without a ping callback, PING frames are answered with PONG
/// automatically; a registered ping callback takes over that duty.
#[derive(Clone, Default)]
pub struct WsCallbacks {
    on_open: Option<WsOpenCallback>,
    on_text: Option<WsTextCallback>,
    on_binary: Option<WsBytesCallback>,
    on_ping: Option<WsBytesCallback>,
    on_pong: Option<WsBytesCallback>,
    on_close: Option<WsCloseCallback>,
    on_error: Option<WsErrorCallback>,
}

impl WsCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WsSession) + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(callback));
        self
    }

    pub fn on_text<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WsSession, &str) + Send + Sync + 'static,
    {
        self.on_text = Some(Arc::new(callback));
        self
    }

    pub fn on_binary<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WsSession, &[u8]) + Send + Sync + 'static,
    {
        self.on_binary = Some(Arc::new(callback));
        self
    }

    pub fn on_ping<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WsSession, &[u8]) + Send + Sync + 'static,
    {
        self.on_ping = Some(Arc::new(callback));
        self
    }

    pub fn on_pong<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WsSession, &[u8]) + Send + Sync + 'static,
    {
        self.on_pong = Some(Arc::new(callback));
        self
    }

    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WsSession, u16, &str) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WsSession, &Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for WsCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsCallbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_text", &self.on_text.is_some())
            .field("on_binary", &self.on_binary.is_some())
            .field("on_ping", &self.on_ping.is_some())
            .field("on_pong", &self.on_pong.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

struct SessionShared {
    connection: Arc<TcpConnection>,
    role: Role,
    /// Code of the close frame this side sent, once sent.
    close_sent: Mutex<Option<u16>>,
}

/// One end of an open WebSocket connection.
///
/// Cheap to clone; every clone refers to the same connection. Frames sent
/// from a client are masked with a fresh random key.
#[derive(Clone)]
pub struct WsSession {
    shared: Arc<SessionShared>,
}

impl WsSession {
    fn new(connection: Arc<TcpConnection>, role: Role) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                connection,
                role,
                close_sent: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.connection.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.connection.peer_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.connection.local_addr()
    }

    /// Whether messages may still be sent.
    pub fn is_open(&self) -> bool {
        self.shared.close_sent.lock().is_none() && self.shared.connection.is_open()
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_data(Frame::new(Opcode::Text, text))
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send_data(Frame::new(Opcode::Binary, data))
    }

    pub fn ping(&self, payload: &[u8]) -> Result<()> {
        self.send_control(Opcode::Ping, payload)
    }

    pub fn pong(&self, payload: &[u8]) -> Result<()> {
        self.send_control(Opcode::Pong, payload)
    }

    /// Starts the closing handshake. The connection is closed once the
    /// peer echoes the close frame.
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        if !close_code::is_sendable(code) {
            return Err(Error::protocol(format!("close code {code} may not be sent")));
        }
        if !self.send_close(code, reason) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn send_data(&self, frame: Frame) -> Result<()> {
        if self.shared.close_sent.lock().is_some() {
            return Err(Error::Closed);
        }
        self.send_frame(&frame)
    }

    fn send_control(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::protocol(format!(
                "control frame payload of {} bytes exceeds {MAX_CONTROL_PAYLOAD}",
                payload.len()
            )));
        }
        self.send_data(Frame::new(opcode, payload))
    }

    /// Sends the close frame unless one was already sent.
    fn send_close(&self, code: u16, reason: &str) -> bool {
        let mut sent = self.shared.close_sent.lock();
        if sent.is_some() {
            return false;
        }
        *sent = Some(code);
        // A failed send means the transport is already going away.
        let _ = self.send_frame(&Frame::close(Some(code), reason));
        true
    }

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mask = match self.shared.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };
        self.shared.connection.send(frame.encode(mask))
    }

    fn sent_close_code(&self) -> Option<u16> {
        *self.shared.close_sent.lock()
    }
}

impl fmt::Debug for WsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsSession")
            .field("id", &self.id())
            .field("role", &self.shared.role)
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

pub(crate) struct ClientStart {
    pub(crate) host: String,
    pub(crate) path: String,
    pub(crate) key: String,
    pub(crate) ready: oneshot::Sender<Result<WsSession>>,
}

enum Phase {
    Accepting(RequestParser),
    Upgrading(ResponseReader, Option<oneshot::Sender<Result<WsSession>>>),
    Open(MessageReader),
    Closed,
}

/// Runs the opening handshake, then frames and dispatches messages.
pub(crate) struct WsHandler {
    callbacks: WsCallbacks,
    role: Role,
    max_message: usize,
    phase: Phase,
    session: Option<WsSession>,
    start: Option<(String, String, String)>,
    /// Close code and reason received from the peer.
    received_close: Option<(u16, String)>,
}

impl WsHandler {
    pub(crate) fn server(callbacks: WsCallbacks, max_handshake: usize, max_message: usize) -> Self {
        Self {
            callbacks,
            role: Role::Server,
            max_message,
            phase: Phase::Accepting(RequestParser::new(max_handshake, 0)),
            session: None,
            start: None,
            received_close: None,
        }
    }

    pub(crate) fn client(
        callbacks: WsCallbacks,
        max_handshake: usize,
        max_message: usize,
        start: ClientStart,
    ) -> Self {
        let ClientStart { host, path, key, ready } = start;
        Self {
            callbacks,
            role: Role::Client,
            max_message,
            phase: Phase::Upgrading(ResponseReader::new(key.clone(), max_handshake), Some(ready)),
            session: None,
            start: Some((host, path, key)),
            received_close: None,
        }
    }

    fn session(&self, connection: &Arc<TcpConnection>) -> WsSession {
        match &self.session {
            Some(session) => session.clone(),
            None => WsSession::new(connection.clone(), self.role),
        }
    }

    /// Switches to framing and handles bytes that followed the handshake.
    fn open(&mut self, connection: &Arc<TcpConnection>, rest: &[u8]) -> Result<()> {
        let session = self.session(connection);
        self.session = Some(session.clone());
        self.phase = Phase::Open(MessageReader::new(self.role, self.max_message));
        debug!(connection = session.id(), peer = %session.peer_addr(), role = ?self.role, "websocket open");

        if let Some(on_open) = &self.callbacks.on_open {
            on_open(&session);
        }
        if rest.is_empty() {
            return Ok(());
        }
        self.on_frames(connection, &session, rest)
    }

    fn on_frames(&mut self, connection: &Arc<TcpConnection>, session: &WsSession, data: &[u8]) -> Result<()> {
        let Phase::Open(reader) = &mut self.phase else {
            return Ok(());
        };
        reader.extend(data);

        loop {
            let Phase::Open(reader) = &mut self.phase else {
                return Ok(());
            };
            let message = match reader.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(err) => {
                    warn!(connection = session.id(), error = %err, "websocket protocol error");
                    session.send_close(err.close_code(), "");
                    if let Some(on_error) = &self.callbacks.on_error {
                        on_error(session, &Error::from(err));
                    }
                    self.phase = Phase::Closed;
                    connection.close();
                    return Ok(());
                }
            };
            self.dispatch(connection, session, message);
        }
    }

    fn dispatch(&mut self, connection: &Arc<TcpConnection>, session: &WsSession, message: Message) {
        match message {
            Message::Text(text) => {
                if let Some(on_text) = &self.callbacks.on_text {
                    on_text(session, &text);
                }
            }
            Message::Binary(data) => {
                if let Some(on_binary) = &self.callbacks.on_binary {
                    on_binary(session, &data);
                }
            }
            Message::Ping(payload) => match &self.callbacks.on_ping {
                Some(on_ping) => on_ping(session, &payload),
                None => {
                    let _ = session.pong(&payload);
                }
            },
            Message::Pong(payload) => {
                if let Some(on_pong) = &self.callbacks.on_pong {
                    on_pong(session, &payload);
                }
            }
            Message::Close(code, reason) => {
                debug!(connection = session.id(), ?code, %reason, "close frame received");
                // Echo the peer's code; an empty close is answered with an empty one.
                let echo = code.unwrap_or(close_code::NORMAL);
                session.send_close(echo, "");
                self.received_close = Some((code.unwrap_or(close_code::NO_STATUS), reason));
                self.phase = Phase::Closed;
                connection.close();
            }
        }
    }
}

impl ConnectionHandler for WsHandler {
    fn on_open(&mut self, connection: &Arc<TcpConnection>) {
        if let Some((host, path, key)) = &self.start {
            let request = handshake::client_request(host, path, key);
            if let Err(err) = connection.send(request) {
                warn!(connection = connection.id(), error = %err, "cannot send upgrade request");
            }
        }
    }

    fn on_data(&mut self, connection: &Arc<TcpConnection>, data: &[u8]) -> Result<()> {
        match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Accepting(mut parser) => match parser.feed(data) {
                Ok(None) => {
                    self.phase = Phase::Accepting(parser);
                    Ok(())
                }
                Ok(Some(request)) => match handshake::accept(&request) {
                    Ok(response) => {
                        connection.send(response.to_bytes(Some(Method::Get)))?;
                        let rest = parser.into_remaining();
                        self.open(connection, &rest)
                    }
                    Err(err) => {
                        warn!(peer = %connection.peer_addr(), error = %err, "rejecting websocket upgrade");
                        let _ = connection.send(handshake::reject(&err).to_bytes(Some(request.method)));
                        connection.close();
                        Ok(())
                    }
                },
                Err(err) => {
                    warn!(peer = %connection.peer_addr(), error = %err, "malformed upgrade request");
                    let response = Response::status_page(err.status).with_header("Connection", "close");
                    let _ = connection.send(response.to_bytes(None));
                    connection.close();
                    Ok(())
                }
            },
            Phase::Upgrading(mut reader, mut ready) => match reader.feed(data) {
                Ok(None) => {
                    self.phase = Phase::Upgrading(reader, ready);
                    Ok(())
                }
                Ok(Some(rest)) => {
                    let session = self.session(connection);
                    self.session = Some(session.clone());
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(session));
                    }
                    self.open(connection, &rest)
                }
                Err(err) => {
                    warn!(peer = %connection.peer_addr(), error = %err, "websocket upgrade refused");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(err.into()));
                    }
                    connection.close();
                    Ok(())
                }
            },
            Phase::Open(reader) => {
                self.phase = Phase::Open(reader);
                let session = self.session(connection);
                self.on_frames(connection, &session, data)
            }
            Phase::Closed => Ok(()),
        }
    }

    fn on_close(&mut self, connection: &Arc<TcpConnection>, error: Option<&Error>) {
        if let Phase::Upgrading(_, Some(ready)) = std::mem::replace(&mut self.phase, Phase::Closed) {
            let err = match error {
                Some(err) => Error::protocol(format!("connection lost during upgrade: {err}")),
                None => Error::Closed,
            };
            let _ = ready.send(Err(err));
        }

        let Some(session) = self.session.take() else {
            return;
        };

        let (code, reason) = match self.received_close.take() {
            Some(received) => received,
            None => match (session.sent_close_code(), error) {
                (Some(code), _) => (code, String::new()),
                (None, Some(err)) => {
                    if let Some(on_error) = &self.callbacks.on_error {
                        on_error(&session, err);
                    }
                    (close_code::ABNORMAL, String::new())
                }
                (None, None) => (close_code::ABNORMAL, String::new()),
            },
        };

        debug!(connection = connection.id(), code, "websocket closed");
        if let Some(on_close) = &self.callbacks.on_close {
            on_close(&session, code, &reason);
        }
    }
}
