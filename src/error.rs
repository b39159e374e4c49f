use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    NegotiationError(#[from] NegotiationError),
    #[error(transparent)]
    ProtocolError(#[from] ProtocolError),
    #[error(transparent)]
    SessionError(#[from] SessionError),
}

/// The control channel is unreachable or rejected a request.
#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

/// Offer, answer or remote description failures of a negotiation peer.
#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct NegotiationError {
    pub kind: NegotiationErrorKind,
    pub message: String,
}

/// A domain error reported by the backend. `code` is kept verbatim.
#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
    pub code: Option<i64>,
}

/// Local misuse of the session API.
#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportErrorKind {
    #[error("connection error")]
    ConnectionError,
    #[error("request rejected error")]
    RequestRejectedError,
    #[error("channel closed error")]
    ChannelClosedError,
    #[error("peer connection error")]
    PeerConnectionError,
    #[error("local description error")]
    LocalDescriptionError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationErrorKind {
    #[error("create offer error")]
    CreateOfferError,
    #[error("create answer error")]
    CreateAnswerError,
    #[error("remote description error")]
    RemoteDescriptionError,
    #[error("missing description error")]
    MissingDescriptionError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolErrorKind {
    #[error("room not found error")]
    RoomNotFoundError,
    #[error("room destroyed error")]
    RoomDestroyedError,
    #[error("backend error")]
    BackendError,
    #[error("malformed message error")]
    MalformedMessageError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionErrorKind {
    #[error("invalid state error")]
    InvalidStateError,
    #[error("invalid config error")]
    InvalidConfigError,
    #[error("subscription limit error")]
    SubscriptionLimitError,
    #[error("self subscription error")]
    SelfSubscriptionError,
    #[error("feed not found error")]
    FeedNotFoundError,
    #[error("no subscribable streams error")]
    NoStreamsError,
}

/// Error code the backend answers with when a room does not exist.
pub const ROOM_NOT_FOUND_CODE: i64 = 485;

impl Error {
    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error::TransportError(TransportError { kind, message })
    }

    pub fn new_negotiation(message: String, kind: NegotiationErrorKind) -> Error {
        Error::NegotiationError(NegotiationError { kind, message })
    }

    pub fn new_protocol(message: String, kind: ProtocolErrorKind, code: Option<i64>) -> Error {
        Error::ProtocolError(ProtocolError {
            kind,
            message,
            code,
        })
    }

    pub fn new_session(message: String, kind: SessionErrorKind) -> Error {
        Error::SessionError(SessionError { kind, message })
    }

    /// Errors after which the signaling session cannot continue and a full
    /// teardown is required.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Error::TransportError(e) => e.kind == TransportErrorKind::ChannelClosedError,
            Error::ProtocolError(e) => e.kind == ProtocolErrorKind::RoomDestroyedError,
            _ => false,
        }
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("videoroom_client::TransportError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("videoroom_client::NegotiationError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("videoroom_client::ProtocolError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);
        builder.field("code", &self.code);

        builder.finish()
    }
}

impl fmt::Debug for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("videoroom_client::SessionError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        let destroyed = Error::new_protocol(
            "room destroyed".to_owned(),
            ProtocolErrorKind::RoomDestroyedError,
            None,
        );
        assert!(destroyed.is_session_fatal());

        let closed = Error::new_transport(
            "channel closed".to_owned(),
            TransportErrorKind::ChannelClosedError,
        );
        assert!(closed.is_session_fatal());

        let rejected = Error::new_negotiation(
            "answer rejected".to_owned(),
            NegotiationErrorKind::RemoteDescriptionError,
        );
        assert!(!rejected.is_session_fatal());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = Error::new_protocol(
            "No such room (1234)".to_owned(),
            ProtocolErrorKind::RoomNotFoundError,
            Some(ROOM_NOT_FOUND_CODE),
        );
        assert_eq!(err.to_string(), "room not found error: No such room (1234)");
        match err {
            Error::ProtocolError(e) => assert_eq!(e.code, Some(485)),
            _ => panic!("unexpected error variant"),
        }
    }
}
