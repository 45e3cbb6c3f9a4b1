//! Error types and problem codes for DComm.

use thiserror::Error;

/// Codes carried in the `explain~l10n` block of outgoing problem reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemCode {
    /// Version string or message type could not be parsed.
    MalformedType,
    /// Payload was oversize, not JSON, or otherwise rejected before dispatch.
    MalformedMessage,
    /// No registered handler accepts the message type.
    UnsupportedType,
    /// Message was legal in isolation but not in the current thread state.
    ProtocolAnomaly,
    /// Required trust (confidentiality, integrity, origin) was not proven.
    InsufficientTrust,
    /// Anything the receiver could not attribute to the sender.
    InternalError,
}

impl std::fmt::Display for ProblemCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedType => write!(f, "malformed_type"),
            Self::MalformedMessage => write!(f, "malformed_message"),
            Self::UnsupportedType => write!(f, "unsupported_type"),
            Self::ProtocolAnomaly => write!(f, "protocol_anomaly"),
            Self::InsufficientTrust => write!(f, "insufficient_trust"),
            Self::InternalError => write!(f, "internal_error"),
        }
    }
}

/// DComm errors.
#[derive(Debug, Error)]
pub enum DcommError {
    /// Unparseable semver or message-type URI. Never retried.
    #[error("format error: {0}")]
    Format(String),

    /// An event the machine was never told about. This is a protocol-definition bug.
    #[error("unknown event \"{event}\" for {protocol} role {role}")]
    UnknownEvent {
        protocol: String,
        role: String,
        event: String,
    },

    /// A declared event that is illegal from the current state.
    #[error("Anomaly in the {protocol}@{role} protocol with state=\"{state}\". {detail}")]
    ProtocolAnomaly {
        protocol: String,
        role: String,
        state: String,
        detail: String,
    },

    /// Failure reaching a destination or reading a queue.
    #[error("transport error: {0}")]
    Transport(String),

    /// Envelope-level rejection (oversize or malformed) before protocol logic.
    #[error("message rejected: {0}")]
    Rejected(String),

    /// Pack/unpack failure in the crypto service.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Interaction store failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DcommError {
    /// Whether a caller may reasonably retry the operation after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }

    /// Problem code to send back to a peer when this error ends a handling path.
    pub fn problem_code(&self) -> ProblemCode {
        match self {
            Self::Format(_) => ProblemCode::MalformedType,
            Self::ProtocolAnomaly { .. } => ProblemCode::ProtocolAnomaly,
            Self::Rejected(_) | Self::Serialization(_) => ProblemCode::MalformedMessage,
            _ => ProblemCode::InternalError,
        }
    }
}

/// Result type alias for DComm operations.
pub type DcommResult<T> = Result<T, DcommError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_code_display() {
        assert_eq!(ProblemCode::MalformedType.to_string(), "malformed_type");
        assert_eq!(ProblemCode::ProtocolAnomaly.to_string(), "protocol_anomaly");
        assert_eq!(ProblemCode::InsufficientTrust.to_string(), "insufficient_trust");
    }

    #[test]
    fn problem_code_serde() {
        let code = ProblemCode::UnsupportedType;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"unsupported_type\"");

        let parsed: ProblemCode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, code);
    }

    #[test]
    fn anomaly_message_names_protocol_role_and_state() {
        let err = DcommError::ProtocolAnomaly {
            protocol: "connections/1.0".into(),
            role: "inviter".into(),
            state: "null".into(),
            detail: "Can't receive_ack from null.".into(),
        };
        assert_eq!(
            err.to_string(),
            "Anomaly in the connections/1.0@inviter protocol with state=\"null\". Can't receive_ack from null."
        );
        assert_eq!(err.problem_code(), ProblemCode::ProtocolAnomaly);
    }

    #[test]
    fn only_transport_and_io_retry() {
        assert!(DcommError::Transport("refused".into()).is_retryable());
        assert!(DcommError::Io(std::io::Error::other("disk")).is_retryable());
        assert!(!DcommError::Format("x".into()).is_retryable());
        assert!(!DcommError::Rejected("big".into()).is_retryable());
    }
}
