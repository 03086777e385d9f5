use crate::config::{TlsConfig, WsConfig};
use crate::error::Result;
use crate::net::TcpServer;
use crate::runtime::Handle;
use crate::websocket::session::{WsCallbacks, WsHandler};

use std::fmt;
use std::net::SocketAddr;

/// WebSocket server accepting upgrades on any request path.
///
/// Requests that are not valid upgrades are answered with an HTTP error
/// status and closed.
pub struct WsServer {
    tcp: TcpServer,
}

impl WsServer {
    pub fn bind(
        handle: &Handle,
        addr: SocketAddr,
        config: WsConfig,
        tls: Option<&TlsConfig>,
        callbacks: WsCallbacks,
    ) -> Result<Self> {
        let (max_handshake, max_message) = (config.max_handshake_bytes, config.max_message_bytes);
        let tcp = TcpServer::bind_with(handle, addr, config.socket, tls, move || {
            WsHandler::server(callbacks.clone(), max_handshake, max_message)
        })?;
        Ok(Self { tcp })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.tcp.local_addr()
    }

    /// Connections accepted and not yet closed, including those still
    /// negotiating the upgrade.
    pub fn connection_count(&self) -> usize {
        self.tcp.connection_count()
    }

    pub fn stop(&self) {
        self.tcp.stop();
    }
}

impl fmt::Debug for WsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsServer")
            .field("local_addr", &self.local_addr())
            .finish()
    }
}
