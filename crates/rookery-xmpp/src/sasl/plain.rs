//! SASL PLAIN mechanism (RFC 4616).
//!
//! The single client input is `authzid NUL authcid NUL password`. The
//! authcid may carry an `@domain` suffix, which is stripped; the domain the
//! account lives on is the one the stream was opened against.

use crate::auth::AuthBackend;
use crate::jid::nodeprep;

use super::{SaslContext, SaslError, SaslOutcome, SaslProps};

/// Mechanism name on the wire.
pub const MECH_NAME: &str = "PLAIN";

/// PLAIN completes in one step and carries no state.
pub struct Plain;

impl Plain {
    pub(super) fn new() -> Self {
        Self
    }

    pub(super) async fn step<A: AuthBackend>(
        &mut self,
        ctx: &SaslContext<A>,
        input: &[u8],
    ) -> SaslOutcome {
        let mut parts = input.split(|&b| b == 0);
        let (authzid, user, password) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(authzid), Some(user), Some(password), None) => (authzid, user, password),
            _ => return SaslOutcome::failure(SaslError::BadProtocol),
        };

        let (Ok(authzid), Ok(user), Ok(password)) = (
            std::str::from_utf8(authzid),
            std::str::from_utf8(user),
            std::str::from_utf8(password),
        ) else {
            return SaslOutcome::failure(SaslError::BadProtocol);
        };

        // `user@domain` means the bare account name plus the served domain.
        let user = user.split('@').next().unwrap_or(user);

        let prepped = match nodeprep(user) {
            Ok(prepped) if !prepped.is_empty() => prepped,
            _ => return SaslOutcome::failure_user(SaslError::NotAuthorized, user),
        };

        match ctx.auth.check_password(&prepped, &ctx.server, password).await {
            Some(auth_module) => SaslOutcome::Done(SaslProps {
                username: prepped,
                authzid: authzid.to_string(),
                auth_module,
            }),
            None => SaslOutcome::failure_user(SaslError::NotAuthorized, user),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryAuthBackend;
    use std::sync::Arc;

    fn ctx() -> SaslContext<InMemoryAuthBackend> {
        let auth = InMemoryAuthBackend::new();
        auth.add_user("alice", "example.net", "secret");
        SaslContext {
            server: "example.net".to_string(),
            fqdn: "example.net".to_string(),
            auth: Arc::new(auth),
        }
    }

    #[tokio::test]
    async fn accepts_valid_credentials() {
        let ctx = ctx();
        let mut mech = Plain::new();
        match mech.step(&ctx, b"\0alice\0secret").await {
            SaslOutcome::Done(props) => {
                assert_eq!(props.username, "alice");
                assert_eq!(props.authzid, "");
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn strips_domain_suffix_and_keeps_authzid() {
        let ctx = ctx();
        let mut mech = Plain::new();
        match mech.step(&ctx, b"alice\0alice@example.net\0secret").await {
            SaslOutcome::Done(props) => {
                assert_eq!(props.username, "alice");
                assert_eq!(props.authzid, "alice");
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_password_names_the_user() {
        let ctx = ctx();
        let mut mech = Plain::new();
        match mech.step(&ctx, b"\0alice\0wrong").await {
            SaslOutcome::Failure { error, username } => {
                assert_eq!(error, SaslError::NotAuthorized);
                assert_eq!(username.as_deref(), Some("alice"));
            }
            other => panic!("expected Failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_input_is_bad_protocol() {
        let ctx = ctx();
        let mut mech = Plain::new();
        for input in [&b"alice"[..], b"\0alice", b"\0a\0b\0c\0d"] {
            assert!(matches!(
                mech.step(&ctx, input).await,
                SaslOutcome::Failure {
                    error: SaslError::BadProtocol,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn case_folds_the_username() {
        let ctx = ctx();
        let mut mech = Plain::new();
        match mech.step(&ctx, b"\0Alice\0secret").await {
            SaslOutcome::Done(props) => assert_eq!(props.username, "alice"),
            other => panic!("expected Done, got {:?}", other),
        }
    }
}
