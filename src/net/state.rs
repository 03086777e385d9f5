//! Connection lifecycle as a pure state machine.
//!
//! ```text
//! Connecting --Established{tls}--> Handshaking --HandshakeSucceeded--> Open
//!      |                               |                                 |
//!      |                        HandshakeFailed --> Closed               |
//!      +---- CloseRequested / RemoteClosed / Failed ----> Closing <------+
//!                                                            |
//!                                                        Finished --> Closed
//! ```

use crate::error::{Error, Result};

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The socket connected or was accepted.
    Established { tls: bool },
    HandshakeSucceeded,
    HandshakeFailed,
    /// The local side called `close`.
    CloseRequested,
    /// The peer closed its end.
    RemoteClosed,
    /// An I/O or protocol error occurred.
    Failed,
    /// Pending writes were flushed and the socket released.
    Finished,
}

impl ConnectionState {
    /// The state reached by applying `event`, or an error if `event` is not
    /// valid in this state.
    pub fn transition(self, event: ConnectionEvent) -> Result<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (self, event) {
            (S::Connecting, E::Established { tls: true }) => S::Handshaking,
            (S::Connecting, E::Established { tls: false }) => S::Open,
            (S::Handshaking, E::HandshakeSucceeded) => S::Open,
            (S::Handshaking, E::HandshakeFailed) => S::Closed,
            (
                S::Connecting | S::Handshaking | S::Open | S::Closing,
                E::CloseRequested | E::RemoteClosed | E::Failed,
            ) => S::Closing,
            (S::Closing, E::Finished) => S::Closed,
            (state, event) => {
                return Err(Error::invalid_state(format!(
                    "{event:?} is not valid while {state}"
                )));
            }
        };

        Ok(next)
    }

    pub fn is_open(&self) -> bool {
        *self == ConnectionState::Open
    }

    /// Closing or closed: no new data is accepted.
    pub fn is_terminating(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionEvent as E;
    use super::ConnectionState as S;
    use super::*;

    fn run(events: &[ConnectionEvent]) -> Result<ConnectionState> {
        events
            .iter()
            .try_fold(S::Connecting, |state, event| state.transition(*event))
    }

    #[test]
    fn plain_connection_lifecycle() {
        let state = run(&[E::Established { tls: false }]).unwrap();
        assert!(state.is_open());
        assert_eq!(
            run(&[E::Established { tls: false }, E::RemoteClosed, E::Finished]).unwrap(),
            S::Closed
        );
    }

    #[test]
    fn tls_connection_goes_through_handshake() {
        assert_eq!(run(&[E::Established { tls: true }]).unwrap(), S::Handshaking);
        assert_eq!(
            run(&[E::Established { tls: true }, E::HandshakeSucceeded]).unwrap(),
            S::Open
        );
    }

    #[test]
    fn failed_handshake_never_opens() {
        let state = run(&[E::Established { tls: true }, E::HandshakeFailed]).unwrap();
        assert_eq!(state, S::Closed);
        assert!(state.transition(E::HandshakeSucceeded).is_err());
    }

    #[test]
    fn close_is_idempotent_while_closing() {
        let state = run(&[E::Established { tls: false }, E::CloseRequested]).unwrap();
        assert_eq!(state, S::Closing);
        assert_eq!(state.transition(E::CloseRequested).unwrap(), S::Closing);
        assert_eq!(state.transition(E::Failed).unwrap(), S::Closing);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert!(S::Open.transition(E::HandshakeSucceeded).is_err());
        assert!(S::Connecting.transition(E::Finished).is_err());
        assert!(S::Closed.transition(E::CloseRequested).is_err());
        assert!(S::Open.transition(E::Established { tls: false }).is_err());
    }
}
