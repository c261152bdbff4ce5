//! SASL negotiation engine.
//!
//! A mechanism is a steppable state machine fed base64-decoded client input
//! and producing either a completion, a challenge to send back, or a
//! failure. The registry is populated at startup and read-only afterwards.
//! Whatever the mechanism reports, the engine post-validates the
//! authenticated username: it must nodeprep to a non-empty value.

pub mod digest_md5;
pub mod plain;

use std::sync::Arc;

use crate::auth::AuthBackend;
use crate::jid::nodeprep;

/// Failure conditions carried inside a `<failure/>` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslError {
    /// The client aborted the exchange
    Aborted,
    /// Input violated the mechanism's grammar or ordering
    BadProtocol,
    /// Base64 payload did not decode
    IncorrectEncoding,
    /// The requested mechanism is not offered
    InvalidMechanism,
    /// Credentials rejected
    NotAuthorized,
}

impl SaslError {
    /// The condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::BadProtocol => "bad-protocol",
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::NotAuthorized => "not-authorized",
        }
    }
}

/// Properties of a completed negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslProps {
    /// Authenticated (canonical) username
    pub username: String,
    /// Requested authorization identity, empty when none
    pub authzid: String,
    /// Backend module that accepted the credentials
    pub auth_module: String,
}

/// Outcome of feeding one client input to a mechanism.
#[derive(Debug)]
pub enum SaslOutcome {
    /// Negotiation finished successfully
    Done(SaslProps),
    /// Send this server output in a `<challenge>` and await a `<response>`
    Continue(Vec<u8>),
    /// Negotiation failed; `username` names the offending account for logs
    Failure {
        /// The failure condition
        error: SaslError,
        /// Offending username, when one was presented
        username: Option<String>,
    },
}

impl SaslOutcome {
    pub(crate) fn failure(error: SaslError) -> Self {
        Self::Failure {
            error,
            username: None,
        }
    }

    pub(crate) fn failure_user(error: SaslError, username: impl Into<String>) -> Self {
        Self::Failure {
            error,
            username: Some(username.into()),
        }
    }
}

/// Shared inputs every mechanism step sees.
pub struct SaslContext<A> {
    /// The served (canonical) host the stream was opened against
    pub server: String,
    /// The server's FQDN, validated against DIGEST-MD5 `digest-uri`
    pub fqdn: String,
    /// The credential backend
    pub auth: Arc<A>,
}

/// A mechanism instance mid-negotiation.
pub enum Mechanism {
    /// RFC 4616 PLAIN
    Plain(plain::Plain),
    /// RFC 2831 DIGEST-MD5
    DigestMd5(digest_md5::DigestMd5),
}

impl Mechanism {
    /// The SASL mechanism name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain(_) => plain::MECH_NAME,
            Self::DigestMd5(_) => digest_md5::MECH_NAME,
        }
    }

    /// Feed one client input to the mechanism.
    pub async fn step<A: AuthBackend>(
        &mut self,
        ctx: &SaslContext<A>,
        input: &[u8],
    ) -> SaslOutcome {
        match self {
            Self::Plain(mech) => mech.step(ctx, input).await,
            Self::DigestMd5(mech) => mech.step(ctx, input).await,
        }
    }
}

/// Registry of the mechanisms the server offers.
///
/// Populated once at startup; the feature advertisement and mechanism
/// instantiation both read from it.
pub struct SaslRegistry {
    names: Vec<&'static str>,
}

impl SaslRegistry {
    /// Registry with every built-in mechanism.
    pub fn new() -> Self {
        Self {
            names: vec![digest_md5::MECH_NAME, plain::MECH_NAME],
        }
    }

    /// Mechanism names for the `<mechanisms>` feature advertisement.
    pub fn mechanisms(&self) -> &[&'static str] {
        &self.names
    }

    fn create(&self, name: &str) -> Option<Mechanism> {
        if !self.names.contains(&name) {
            return None;
        }
        match name {
            plain::MECH_NAME => Some(Mechanism::Plain(plain::Plain::new())),
            digest_md5::MECH_NAME => Some(Mechanism::DigestMd5(digest_md5::DigestMd5::new())),
            _ => None,
        }
    }

    /// Start a negotiation with the named mechanism and the initial client
    /// input. Returns the mechanism instance to keep stepping alongside the
    /// first outcome.
    pub async fn server_start<A: AuthBackend>(
        &self,
        ctx: &SaslContext<A>,
        mech_name: &str,
        initial: &[u8],
    ) -> (Option<Mechanism>, SaslOutcome) {
        let Some(mut mech) = self.create(mech_name) else {
            return (None, SaslOutcome::failure(SaslError::InvalidMechanism));
        };
        let outcome = post_validate(mech.step(ctx, initial).await);
        (Some(mech), outcome)
    }

    /// Continue a negotiation with the next client response.
    pub async fn server_step<A: AuthBackend>(
        &self,
        ctx: &SaslContext<A>,
        mech: &mut Mechanism,
        input: &[u8],
    ) -> SaslOutcome {
        post_validate(mech.step(ctx, input).await)
    }
}

impl Default for SaslRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine-level check on completed negotiations: the username must
/// nodeprep to a non-empty value, or the result becomes `not-authorized`.
fn post_validate(outcome: SaslOutcome) -> SaslOutcome {
    match outcome {
        SaslOutcome::Done(props) => match nodeprep(&props.username) {
            Ok(username) if !username.is_empty() => SaslOutcome::Done(SaslProps {
                username,
                ..props
            }),
            _ => SaslOutcome::failure_user(SaslError::NotAuthorized, props.username),
        },
        other => other,
    }
}
