use thiserror::Error;

use crate::alert::{AlertDescription, AlertLevel};

/// Error categories surfaced to callers of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    ClosedConnection,
    AbruptClose,
    ProtocolVersion,
    InsufficientSecurity,
    HandshakeFailure,
    IllegalParameter,
    DecodeError,
    UnexpectedMessage,
    RecordOverflow,
    DecryptionFailed,
    BadRecordMac,
    UnknownPskIdentity,
    FingerprintMismatch,
    AuthenticationFailure,
    AuthorizationFailure,
    InternalError,
}

/// Single error type for everything that can go wrong on a connection.
///
/// Local protocol failures carry the alert that should be (or was) sent to the
/// peer so that the shutdown path can be funneled through one place.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{kind:?}: {message}")]
    Local {
        kind: ErrorKind,
        alert: AlertDescription,
        message: String,
    },

    /// The peer sent us an alert.
    #[error("remote alert: {description:?} ({level:?})")]
    RemoteAlert {
        description: AlertDescription,
        level: AlertLevel,
    },

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TlsError>;

impl TlsError {
    pub fn local<S: Into<String>>(kind: ErrorKind, alert: AlertDescription, message: S) -> Self {
        Self::Local {
            kind,
            alert,
            message: message.into(),
        }
    }

    /// The alert that should be sent to the peer before tearing down the
    /// connection. None for i/o failures and received alerts where sending
    /// anything else is pointless.
    pub fn alert_to_send(&self) -> Option<AlertDescription> {
        match self {
            Self::Local { alert, .. } => Some(*alert),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Local { kind, .. } => *kind,
            Self::RemoteAlert { description, .. } => match description {
                AlertDescription::close_notify => ErrorKind::ClosedConnection,
                _ => ErrorKind::HandshakeFailure,
            },
            Self::Io(_) => ErrorKind::AbruptClose,
        }
    }

    pub fn is_close_notify(&self) -> bool {
        matches!(
            self,
            Self::RemoteAlert {
                description: AlertDescription::close_notify,
                ..
            }
        )
    }

    pub fn decode_error<S: Into<String>>(message: S) -> Self {
        Self::local(ErrorKind::DecodeError, AlertDescription::decode_error, message)
    }

    pub fn illegal_parameter<S: Into<String>>(message: S) -> Self {
        Self::local(
            ErrorKind::IllegalParameter,
            AlertDescription::illegal_parameter,
            message,
        )
    }

    pub fn unexpected_message<S: Into<String>>(message: S) -> Self {
        Self::local(
            ErrorKind::UnexpectedMessage,
            AlertDescription::unexpected_message,
            message,
        )
    }

    pub fn handshake_failure<S: Into<String>>(message: S) -> Self {
        Self::local(
            ErrorKind::HandshakeFailure,
            AlertDescription::handshake_failure,
            message,
        )
    }

    pub fn protocol_version<S: Into<String>>(message: S) -> Self {
        Self::local(
            ErrorKind::ProtocolVersion,
            AlertDescription::protocol_version,
            message,
        )
    }

    pub fn insufficient_security<S: Into<String>>(message: S) -> Self {
        Self::local(
            ErrorKind::InsufficientSecurity,
            AlertDescription::insufficient_security,
            message,
        )
    }

    pub fn bad_record_mac<S: Into<String>>(message: S) -> Self {
        Self::local(
            ErrorKind::BadRecordMac,
            AlertDescription::bad_record_mac,
            message,
        )
    }

    pub fn record_overflow<S: Into<String>>(message: S) -> Self {
        Self::local(
            ErrorKind::RecordOverflow,
            AlertDescription::record_overflow,
            message,
        )
    }

    pub fn decrypt_error<S: Into<String>>(message: S) -> Self {
        Self::local(
            ErrorKind::DecryptionFailed,
            AlertDescription::decrypt_error,
            message,
        )
    }

    pub fn unknown_psk_identity<S: Into<String>>(message: S) -> Self {
        Self::local(
            ErrorKind::UnknownPskIdentity,
            AlertDescription::unknown_psk_identity,
            message,
        )
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::local(
            ErrorKind::InternalError,
            AlertDescription::internal_error,
            message,
        )
    }

    pub fn closed<S: Into<String>>(message: S) -> Self {
        Self::local(
            ErrorKind::ClosedConnection,
            AlertDescription::close_notify,
            message,
        )
    }
}
