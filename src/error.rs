use thiserror::Error;

/// Why a server turned down a connection. The display text is what goes over the wire, so
///  it must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Bad magic number")]
    BadMagic,
    #[error("Bad revision number")]
    BadRevision,
    #[error("Protocol not supported")]
    ProtocolNotSupported,
    #[error("Bad version number for protocol")]
    BadVersion,
    #[error("Connection limit reached for protocol")]
    ConnectionLimit,
    #[error("Authorisation failed")]
    AuthorisationFailed,
}

/// Reasons for a failed [crate::conn::ConnectionManager::attempt_connection] that callers may
///  want to distinguish from plain I/O errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("connection rejected by server: {reason}")]
    Rejected { reason: String },

    #[error("protocol {protocol:?} is not registered as a client protocol")]
    UnknownProtocol { protocol: String },

    #[error("connection limit reached for client protocol {protocol:?}")]
    LimitReached { protocol: String },

    #[error("connection for protocol {protocol:?} vetoed by its validate callback")]
    Vetoed { protocol: String },

    #[error("refusing to connect to port {port}, which this module serves itself")]
    SelfConnection { port: u16 },
}

impl ConnectError {
    /// the rejection reason the server sent, if that is what the error is about
    pub fn rejection_reason(e: &anyhow::Error) -> Option<&str> {
        match e.downcast_ref::<ConnectError>() {
            Some(ConnectError::Rejected { reason }) => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::magic(Rejection::BadMagic, "Bad magic number")]
    #[case::revision(Rejection::BadRevision, "Bad revision number")]
    #[case::protocol(Rejection::ProtocolNotSupported, "Protocol not supported")]
    #[case::version(Rejection::BadVersion, "Bad version number for protocol")]
    #[case::limit(Rejection::ConnectionLimit, "Connection limit reached for protocol")]
    #[case::auth(Rejection::AuthorisationFailed, "Authorisation failed")]
    fn test_rejection_text(#[case] rejection: Rejection, #[case] expected: &str) {
        assert_eq!(rejection.to_string(), expected);
    }

    #[test]
    fn test_rejection_reason() {
        let e: anyhow::Error = ConnectError::Rejected { reason: "Authorisation failed".to_string() }.into();
        assert_eq!(ConnectError::rejection_reason(&e), Some("Authorisation failed"));

        let e: anyhow::Error = ConnectError::SelfConnection { port: 3 }.into();
        assert_eq!(ConnectError::rejection_reason(&e), None);
    }
}
