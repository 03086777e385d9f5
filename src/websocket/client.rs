use crate::config::{TlsConfig, WsConfig};
use crate::error::{Error, Result};
use crate::net::TcpClient;
use crate::runtime::Handle;
use crate::time::timeout;
use crate::websocket::handshake::generate_client_key;
use crate::websocket::session::{ClientStart, WsCallbacks, WsHandler, WsSession};

use futures::channel::oneshot;
use std::net::SocketAddr;

/// Opens client WebSocket sessions.
pub struct WsClient;

impl WsClient {
    /// Connects to `addr` and completes the upgrade on `config.path`.
    ///
    /// The connect and the upgrade are each bounded by the socket's connect
    /// timeout. The `Host` header uses the TLS server name when one is set.
    pub async fn connect(
        handle: &Handle,
        addr: SocketAddr,
        config: WsConfig,
        tls: Option<&TlsConfig>,
        callbacks: WsCallbacks,
    ) -> Result<WsSession> {
        let (ready, upgraded) = oneshot::channel();
        let host = tls
            .and_then(|tls| tls.server_name.clone())
            .unwrap_or_else(|| addr.to_string());
        let handler = WsHandler::client(
            callbacks,
            config.max_handshake_bytes,
            config.max_message_bytes,
            ClientStart {
                host,
                path: config.path.clone(),
                key: generate_client_key(),
                ready,
            },
        );

        let limit = config.socket.connect_timeout;
        let connection = TcpClient::connect_with(handle, addr, config.socket, tls, handler).await?;

        match timeout(limit, upgraded).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed),
            Err(err) => {
                connection.close();
                Err(err)
            }
        }
    }
}
