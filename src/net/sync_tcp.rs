//! Blocking TCP client with per-call deadlines.

use crate::config::SocketConfig;
use crate::error::{Error, Result};
use crate::net::tcp_stream::TcpStream;
use crate::reactor::Reactor;
use crate::runtime::block_on_for;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A TCP client whose calls block the calling thread for at most their
/// deadline.
///
/// Each client owns a private reactor that only runs during its own calls,
/// so it never occupies an executor thread. A zero deadline waits
/// indefinitely.
///
/// Socket options may only be changed before [`connect`](Self::connect);
/// afterwards the setters fail with [`Error::InvalidState`] and the getters
/// report the live socket values.
///
/// ```no_run
/// use netcore::SyncTcpClient;
/// use std::time::Duration;
///
/// let mut client = SyncTcpClient::new()?;
/// client.set_nodelay(true)?;
/// client.connect("127.0.0.1:7000".parse().unwrap())?;
/// client.send(b"ping", Duration::from_secs(1))?;
///
/// let mut buf = [0; 64];
/// let n = client.recv(&mut buf, Duration::from_secs(3))?;
/// # Ok::<(), netcore::Error>(())
/// ```
pub struct SyncTcpClient {
    stream: Option<TcpStream>,
    reactor: Arc<Reactor>,
    config: SocketConfig,
}

impl SyncTcpClient {
    pub fn new() -> Result<Self> {
        Self::with_config(SocketConfig::default())
    }

    pub fn with_config(config: SocketConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            stream: None,
            reactor: Arc::new(Reactor::new()?),
            config,
        })
    }

    fn options(&mut self) -> Result<&mut SocketConfig> {
        if self.stream.is_some() {
            return Err(Error::invalid_state(
                "socket options can only be changed before connect",
            ));
        }
        Ok(&mut self.config)
    }

    fn stream(&self) -> Result<&TcpStream> {
        self.stream.as_ref().ok_or(Error::NotConnected)
    }

    pub fn set_send_buffer_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::config("send buffer size must be greater than zero"));
        }
        self.options()?.send_buffer_size = Some(size);
        Ok(())
    }

    pub fn set_recv_buffer_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::config("receive buffer size must be greater than zero"));
        }
        self.options()?.recv_buffer_size = Some(size);
        Ok(())
    }

    /// `true` disables Nagle's algorithm.
    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        self.options()?.nodelay = Some(nodelay);
        Ok(())
    }

    /// Binds to `port` before connecting.
    pub fn set_local_port(&mut self, port: u16) -> Result<()> {
        self.options()?.local_port = port;
        Ok(())
    }

    /// The socket's `SO_SNDBUF`, or the configured value before connect.
    pub fn send_buffer_size(&self) -> Result<usize> {
        match &self.stream {
            Some(stream) => Ok(stream.socket().send_buffer_size()?),
            None => self.config.send_buffer_size.ok_or(Error::NotConnected),
        }
    }

    /// The socket's `SO_RCVBUF`, or the configured value before connect.
    pub fn recv_buffer_size(&self) -> Result<usize> {
        match &self.stream {
            Some(stream) => Ok(stream.socket().recv_buffer_size()?),
            None => self.config.recv_buffer_size.ok_or(Error::NotConnected),
        }
    }

    pub fn nodelay(&self) -> Result<bool> {
        match &self.stream {
            Some(stream) => Ok(stream.socket().nodelay()?),
            None => Ok(self.config.nodelay.unwrap_or(false)),
        }
    }

    /// Connects within the configured connect timeout.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        let timeout = self.config.connect_timeout;
        self.connect_timeout(addr, timeout)
    }

    pub fn connect_timeout(&mut self, addr: SocketAddr, timeout: Duration) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::invalid_state("already connected"));
        }

        let connect = TcpStream::connect(self.reactor.clone(), addr, &self.config);
        let stream = block_on_for(&self.reactor, connect, timeout).ok_or(Error::Timeout(timeout))??;
        debug!(%addr, local = ?stream.local_addr().ok(), "sync client connected");

        self.stream = Some(stream);
        Ok(())
    }

    /// Sends all of `data`.
    pub fn send(&self, data: &[u8], timeout: Duration) -> Result<()> {
        let stream = self.stream()?;
        block_on_for(&self.reactor, stream.write_all(data), timeout).ok_or(Error::Timeout(timeout))??;
        Ok(())
    }

    /// Receives into `buf`, returning as soon as any bytes arrive.
    ///
    /// `Ok(0)` means the peer closed the connection.
    pub fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream()?;
        let n = block_on_for(&self.reactor, stream.read(buf), timeout).ok_or(Error::Timeout(timeout))??;
        Ok(n)
    }

    /// Shuts down and releases the socket. Options may be changed again.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream()?.local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream()?.peer_addr()?)
    }
}

impl fmt::Debug for SyncTcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTcpClient")
            .field("connected", &self.is_connected())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_are_frozen_after_connect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = SyncTcpClient::new().unwrap();
        client.set_nodelay(true).unwrap();
        client.set_send_buffer_size(64 * 1024).unwrap();

        client
            .connect_timeout(listener.local_addr().unwrap(), Duration::from_secs(3))
            .unwrap();

        assert!(client.nodelay().unwrap());
        assert!(client.send_buffer_size().unwrap() > 0);
        assert!(matches!(client.set_nodelay(false), Err(Error::InvalidState(_))));
        assert!(matches!(
            client.connect(listener.local_addr().unwrap()),
            Err(Error::InvalidState(_))
        ));

        client.close();
        assert!(client.set_nodelay(false).is_ok());
    }

    #[test]
    fn send_requires_connection() {
        let client = SyncTcpClient::new().unwrap();
        assert!(matches!(
            client.send(b"x", Duration::from_millis(10)),
            Err(Error::NotConnected)
        ));
    }
}
