use crate::config::{SocketConfig, TlsConfig};
use crate::error::{Error, Result};
use crate::net::connection::{
    ConnectionCallbacks, ConnectionHandler, Establish, TcpConnection, TlsSettings, establish,
};
use crate::net::tcp_stream::TcpStream;
use crate::net::tls::TlsContext;
use crate::runtime::Handle;
use crate::time::timeout;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Outbound connections driven by an executor.
///
/// ```no_run
/// use netcore::{ConnectionCallbacks, Executor, SocketConfig, TcpClient};
///
/// let executor = Executor::new("client", 2)?;
/// let handle = executor.handle().clone();
/// let callbacks = ConnectionCallbacks::new()
///     .on_data(|_, data| println!("received {} bytes", data.len()));
///
/// let addr = "127.0.0.1:7000".parse().unwrap();
/// let connection = executor.block_on(TcpClient::connect(&handle, addr, SocketConfig::default(), callbacks))??;
/// connection.send(b"hello".to_vec())?;
/// # Ok::<(), netcore::Error>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TcpClient;

impl TcpClient {
    /// Connects to `addr` within `config.connect_timeout`.
    pub async fn connect(
        handle: &Handle,
        addr: SocketAddr,
        config: SocketConfig,
        callbacks: ConnectionCallbacks,
    ) -> Result<Arc<TcpConnection>> {
        Self::connect_with(handle, addr, config, None, callbacks).await
    }

    /// Connects to `addr` and completes a TLS handshake before reporting the
    /// connection open.
    pub async fn connect_tls(
        handle: &Handle,
        addr: SocketAddr,
        config: SocketConfig,
        tls: &TlsConfig,
        callbacks: ConnectionCallbacks,
    ) -> Result<Arc<TcpConnection>> {
        Self::connect_with(handle, addr, config, Some(tls), callbacks).await
    }

    /// Connects with a custom per-connection handler.
    pub async fn connect_with<H: ConnectionHandler>(
        handle: &Handle,
        addr: SocketAddr,
        config: SocketConfig,
        tls: Option<&TlsConfig>,
        handler: H,
    ) -> Result<Arc<TcpConnection>> {
        config.validate()?;
        let tls = match tls {
            Some(tls) => Some(TlsSettings {
                context: TlsContext::client(tls)?,
                handshake_timeout: tls.handshake_timeout,
            }),
            None => None,
        };

        let connect = TcpStream::connect(handle.reactor().clone(), addr, &config);
        let stream = match timeout(config.connect_timeout, connect).await {
            Ok(stream) => stream?,
            Err(_) => return Err(Error::Timeout(config.connect_timeout)),
        };
        debug!(%addr, "connected");

        let params = Establish {
            handle,
            tls: tls.as_ref(),
            read_len: config.read_len(),
            on_finish: None,
        };
        establish(params, stream, Box::new(handler)).await
    }
}
