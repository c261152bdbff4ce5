//! Error types for the XMPP endpoint.

use thiserror::Error;

/// Errors produced by the endpoint core.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected XML on the stream
    #[error("XML error: {0}")]
    Xml(String),

    /// JID string that does not parse or fails stringprep
    #[error("malformed JID: {0}")]
    Jid(String),

    /// Mailbox over its message cap with no pending receive
    #[error("mailbox queue limit exceeded")]
    QueueLimit,

    /// Socket send did not complete within the configured timeout
    #[error("send timed out")]
    Timeout,

    /// Peer closed the connection
    #[error("connection closed")]
    Closed,

    /// Authentication failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Stream-level protocol violation
    #[error("stream error: {0}")]
    Stream(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new XML error.
    pub fn xml(msg: impl Into<String>) -> Self {
        Self::Xml(msg.into())
    }

    /// Create a new JID error.
    pub fn jid(msg: impl Into<String>) -> Self {
        Self::Jid(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// XMPP stanza error conditions with their legacy numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed payload)
    BadRequest,
    /// Conflict (e.g. resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden
    Forbidden,
    /// Gone
    Gone,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Payment required
    PaymentRequired,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Redirect
    Redirect,
    /// Registration required
    RegistrationRequired,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Subscription required
    SubscriptionRequired,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PaymentRequired => "payment-required",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    /// The legacy HTTP-like numeric code carried in the `code` attribute.
    pub fn code(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Conflict => 409,
            Self::FeatureNotImplemented => 501,
            Self::Forbidden => 403,
            Self::Gone => 302,
            Self::InternalServerError => 500,
            Self::ItemNotFound => 404,
            Self::JidMalformed => 400,
            Self::NotAcceptable => 406,
            Self::NotAllowed => 405,
            Self::NotAuthorized => 401,
            Self::PaymentRequired => 402,
            Self::RecipientUnavailable => 404,
            Self::Redirect => 302,
            Self::RegistrationRequired => 407,
            Self::RemoteServerNotFound => 404,
            Self::RemoteServerTimeout => 504,
            Self::ResourceConstraint => 500,
            Self::ServiceUnavailable => 503,
            Self::SubscriptionRequired => 407,
            Self::UnexpectedRequest => 400,
        }
    }

    /// The error type the condition belongs to.
    pub fn error_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest => StanzaErrorType::Modify,
            Self::Conflict => StanzaErrorType::Cancel,
            Self::FeatureNotImplemented => StanzaErrorType::Cancel,
            Self::Forbidden => StanzaErrorType::Auth,
            Self::Gone => StanzaErrorType::Modify,
            Self::InternalServerError => StanzaErrorType::Wait,
            Self::ItemNotFound => StanzaErrorType::Cancel,
            Self::JidMalformed => StanzaErrorType::Modify,
            Self::NotAcceptable => StanzaErrorType::Modify,
            Self::NotAllowed => StanzaErrorType::Cancel,
            Self::NotAuthorized => StanzaErrorType::Auth,
            Self::PaymentRequired => StanzaErrorType::Auth,
            Self::RecipientUnavailable => StanzaErrorType::Wait,
            Self::Redirect => StanzaErrorType::Modify,
            Self::RegistrationRequired => StanzaErrorType::Auth,
            Self::RemoteServerNotFound => StanzaErrorType::Cancel,
            Self::RemoteServerTimeout => StanzaErrorType::Wait,
            Self::ResourceConstraint => StanzaErrorType::Wait,
            Self::ServiceUnavailable => StanzaErrorType::Cancel,
            Self::SubscriptionRequired => StanzaErrorType::Auth,
            Self::UnexpectedRequest => StanzaErrorType::Wait,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting
    Wait,
}

impl StanzaErrorType {
    /// Get the `type` attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stream error conditions used by the C2S automaton.
pub mod stream_errors {
    /// Stream error: conflict (session replaced by a newer connection)
    pub const CONFLICT: &str = "conflict";
    /// Stream error: host unknown
    pub const HOST_UNKNOWN: &str = "host-unknown";
    /// Stream error: invalid from
    pub const INVALID_FROM: &str = "invalid-from";
    /// Stream error: invalid namespace
    pub const INVALID_NAMESPACE: &str = "invalid-namespace";
    /// Stream error: not well-formed XML
    pub const XML_NOT_WELL_FORMED: &str = "xml-not-well-formed";
    /// Stream error: see other host
    pub const SEE_OTHER_HOST: &str = "see-other-host";
    /// Stream error: system shutdown
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_code_and_type_pairs() {
        assert_eq!(StanzaErrorCondition::BadRequest.code(), 400);
        assert_eq!(
            StanzaErrorCondition::BadRequest.error_type(),
            StanzaErrorType::Modify
        );
        assert_eq!(StanzaErrorCondition::ServiceUnavailable.code(), 503);
        assert_eq!(
            StanzaErrorCondition::ServiceUnavailable.error_type(),
            StanzaErrorType::Cancel
        );
        assert_eq!(StanzaErrorCondition::NotAuthorized.code(), 401);
        assert_eq!(
            StanzaErrorCondition::NotAuthorized.error_type(),
            StanzaErrorType::Auth
        );
    }

    #[test]
    fn condition_names() {
        assert_eq!(StanzaErrorCondition::JidMalformed.as_str(), "jid-malformed");
        assert_eq!(
            StanzaErrorCondition::RecipientUnavailable.as_str(),
            "recipient-unavailable"
        );
    }
}
