/// Errors raised by the DTC client.
#[derive(Debug, thiserror::Error)]
pub enum DtcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Not connected")]
    NotConnected,
    /// The server refused the logon; carries its reason text.
    #[error("Logon rejected: {0}")]
    LogonRejected(String),
    #[error("Subscription to {symbol}@{exchange} rejected: {reason}")]
    SubscriptionRejected {
        symbol: String,
        exchange: String,
        reason: String,
    },
    #[error("Response carried request id {got}, expected {expected}")]
    CorrelationMismatch { expected: u32, got: u32 },
    #[error("Unexpected message type {0}")]
    UnexpectedMessage(u16),
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

impl DtcError {
    /// Transport-level failures that a fresh connection may cure. A
    /// malformed frame counts: the byte stream is out of sync, not the peer
    /// out of protocol.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DtcError::Io(_)
                | DtcError::Timeout(_)
                | DtcError::ConnectionClosed
                | DtcError::NotConnected
                | DtcError::Malformed(_)
        )
    }

    /// The peer broke the message or correlation rules; the session can't be trusted.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DtcError::CorrelationMismatch { .. } | DtcError::UnexpectedMessage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_frame_is_a_connection_error() {
        let err = DtcError::Malformed("frame size 2 smaller than header".into());
        assert!(err.is_connection_error());
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn test_correlation_and_type_errors_are_violations() {
        let mismatch = DtcError::CorrelationMismatch { expected: 1, got: 2 };
        assert!(mismatch.is_protocol_violation());
        assert!(!mismatch.is_connection_error());
        assert!(DtcError::UnexpectedMessage(999).is_protocol_violation());
        assert!(!DtcError::LogonRejected("no".into()).is_connection_error());
    }
}
