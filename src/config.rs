//! Configuration types with documented defaults.

use crate::diagnose::Diagnose;
use crate::error::{Error, Result};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default size of the per-connection read buffer.
pub const DEFAULT_RECV_BUFFER: usize = 4096;

/// Default bound for connect and TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Executor construction parameters.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Executor name, also the prefix of its worker thread names.
    pub name: String,
    /// Number of worker threads. Zero is rejected.
    pub threads: usize,
    /// Optional diagnostics context receiving task lifecycle events.
    pub diagnose: Option<Arc<Diagnose>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "executor".to_string(),
            threads: 1,
            diagnose: None,
        }
    }
}

impl ExecutorConfig {
    pub fn new(name: impl Into<String>, threads: usize) -> Self {
        Self {
            name: name.into(),
            threads,
            diagnose: None,
        }
    }

    /// Attach a diagnostics context.
    pub fn with_diagnose(mut self, diagnose: Arc<Diagnose>) -> Self {
        self.diagnose = Some(diagnose);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::config(format!(
                "executor `{}` needs at least one worker thread",
                self.name
            )));
        }
        if self.name.is_empty() {
            return Err(Error::config("executor name must not be empty"));
        }
        Ok(())
    }
}

/// Socket options applied before a socket connects or opens.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Size of the buffer each read fills (minimum 256).
    pub recv_buffer: usize,
    /// `SO_SNDBUF`, left to the OS when `None`.
    pub send_buffer_size: Option<usize>,
    /// `SO_RCVBUF`, left to the OS when `None`.
    pub recv_buffer_size: Option<usize>,
    /// `true` disables Nagle's algorithm.
    pub nodelay: Option<bool>,
    /// `SO_REUSEADDR` for listeners and bound sockets.
    pub reuse_address: bool,
    /// Local port to bind before connecting (0 = ephemeral).
    pub local_port: u16,
    /// Deadline for establishing a connection.
    pub connect_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer: DEFAULT_RECV_BUFFER,
            send_buffer_size: None,
            recv_buffer_size: None,
            nodelay: None,
            reuse_address: true,
            local_port: 0,
            connect_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl SocketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.recv_buffer == 0 {
            return Err(Error::config("recv_buffer must be greater than zero"));
        }
        if self.send_buffer_size == Some(0) || self.recv_buffer_size == Some(0) {
            return Err(Error::config("socket buffer sizes must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect_timeout must be greater than zero"));
        }
        Ok(())
    }

    /// The read buffer length actually used.
    pub(crate) fn read_len(&self) -> usize {
        self.recv_buffer.max(256)
    }
}

/// UDP node parameters.
#[derive(Debug, Clone, Default)]
pub struct UdpConfig {
    /// Buffer sizes and address reuse; `nodelay` does not apply.
    pub socket: SocketConfig,
    /// `SO_BROADCAST`.
    pub broadcast: bool,
}

/// Encoding of certificate and key files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertFormat {
    /// Text, base64 armoured.
    Pem,
    /// Binary ASN.1.
    Der,
}

/// Which side presents certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Only the server authenticates.
    OneWay,
    /// Both server and client authenticate.
    Mutual,
}

/// TLS parameters for servers and clients.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub format: CertFormat,
    /// Certificate (chain) presented by this side.
    pub cert_file: Option<PathBuf>,
    /// Private key matching `cert_file`.
    pub key_file: Option<PathBuf>,
    /// Password of an encrypted private key.
    pub key_password: Option<String>,
    /// Trust anchors used to verify the peer.
    pub ca_file: Option<PathBuf>,
    pub verify: VerifyMode,
    /// Clients accept any server certificate when set.
    pub allow_self_signed: bool,
    /// Name the client expects in the server certificate.
    pub server_name: Option<String>,
    /// Bound on the whole handshake.
    pub handshake_timeout: Duration,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            format: CertFormat::Pem,
            cert_file: None,
            key_file: None,
            key_password: None,
            ca_file: None,
            verify: VerifyMode::OneWay,
            allow_self_signed: true,
            server_name: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl TlsConfig {
    /// Server configuration presenting the given certificate and key.
    pub fn server(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: Some(cert_file.into()),
            key_file: Some(key_file.into()),
            ..Self::default()
        }
    }

    /// Client configuration for one-way verification.
    pub fn client() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout.is_zero() {
            return Err(Error::config("handshake_timeout must be greater than zero"));
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(Error::config(
                "cert_file and key_file must be configured together",
            ));
        }
        Ok(())
    }
}

/// HTTP server limits.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub socket: SocketConfig,
    /// Upper bound on request line plus headers.
    pub max_header_bytes: usize,
    /// Upper bound on a request body.
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            max_header_bytes: 64 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// WebSocket limits.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub socket: SocketConfig,
    /// Upper bound on one frame or reassembled message.
    pub max_message_bytes: usize,
    /// Upper bound on the opening handshake.
    pub max_handshake_bytes: usize,
    /// Request path used by clients.
    pub path: String,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            max_message_bytes: 16 * 1024 * 1024,
            max_handshake_bytes: 16 * 1024,
            path: "/".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let socket = SocketConfig::default();
        assert_eq!(socket.recv_buffer, 4096);
        assert_eq!(socket.connect_timeout, Duration::from_secs(3));
        assert_eq!(TlsConfig::default().handshake_timeout, Duration::from_secs(3));
        assert!(socket.validate().is_ok());
    }

    #[test]
    fn rejects_zero_threads() {
        let err = ExecutorConfig::new("pool", 0).validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn small_read_buffers_are_raised() {
        let socket = SocketConfig {
            recv_buffer: 16,
            ..SocketConfig::default()
        };
        assert_eq!(socket.read_len(), 256);
    }

    #[test]
    fn tls_needs_cert_and_key_together() {
        let cfg = TlsConfig {
            cert_file: Some("server.crt".into()),
            ..TlsConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(TlsConfig::server("server.crt", "server.key").validate().is_ok());
    }
}
