//! # rookery-xmpp
//!
//! XMPP client-to-server endpoint core (RFC 6120 opening handshake, SASL,
//! resource binding, session establishment, stanza routing).
//!
//! ## Architecture
//!
//! - **Process runtime**: every connection and every served host's delivery
//!   loop is a tokio task owning a bounded mailbox ([`process`])
//! - **Connection automaton**: a seven-state machine per client connection
//!   drives the stream from open to established ([`c2s`])
//! - **Routing fabric**: domain table ([`router`]) in front of the session
//!   manager ([`session`]) and the per-host local handler ([`local`])
//! - **Stream parsing**: incremental depth-1 XML events ([`parser`]) over a
//!   plain element tree ([`xml`])
//! - **SASL**: PLAIN and DIGEST-MD5 state machines behind a registry
//!   ([`sasl`]); credentials come from an [`auth::AuthBackend`]
//!
//! Federation, TLS and compression exist only as seams: the router falls
//! back to a logging stub, and the pre-authentication feature list accepts
//! extra advertisements through configuration.

pub mod auth;
pub mod c2s;
pub mod jid;
pub mod local;
pub mod parser;
pub mod process;
pub mod router;
pub mod sasl;
pub mod server;
pub mod session;
pub mod socket;
pub mod stanza;
pub mod xml;

mod error;

pub use error::{stream_errors, StanzaErrorCondition, StanzaErrorType, XmppError};
pub use jid::Jid;
pub use server::{Server, ServerConfig};
