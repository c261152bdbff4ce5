//! SASL DIGEST-MD5 mechanism (RFC 2831 subset).
//!
//! Three server-side states: the first step emits the challenge, the second
//! verifies the client's digest response and answers with `rspauth`, the
//! third accepts the client's empty acknowledgement. MD5 is mandated by the
//! mechanism; the nonce comes from the CSPRNG-backed random token generator.

use md5::{Digest, Md5};

use crate::auth::AuthBackend;
use crate::jid::nodeprep;
use crate::stanza::get_random_string;

use super::{SaslContext, SaslError, SaslOutcome, SaslProps};

/// Mechanism name on the wire.
pub const MECH_NAME: &str = "DIGEST-MD5";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    One,
    Three,
    Five,
}

/// Server-side DIGEST-MD5 state machine.
pub struct DigestMd5 {
    step: Step,
    nonce: String,
    username: String,
    authzid: String,
    auth_module: String,
}

impl DigestMd5 {
    pub(super) fn new() -> Self {
        Self::with_nonce(get_random_string())
    }

    fn with_nonce(nonce: String) -> Self {
        Self {
            step: Step::One,
            nonce,
            username: String::new(),
            authzid: String::new(),
            auth_module: String::new(),
        }
    }

    pub(super) async fn step<A: AuthBackend>(
        &mut self,
        ctx: &SaslContext<A>,
        input: &[u8],
    ) -> SaslOutcome {
        match self.step {
            Step::One => {
                let challenge = format!(
                    "nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
                    self.nonce
                );
                self.step = Step::Three;
                SaslOutcome::Continue(challenge.into_bytes())
            }
            Step::Three => self.step_three(ctx, input).await,
            Step::Five => {
                if input.is_empty() {
                    SaslOutcome::Done(SaslProps {
                        username: self.username.clone(),
                        authzid: self.authzid.clone(),
                        auth_module: self.auth_module.clone(),
                    })
                } else {
                    SaslOutcome::failure(SaslError::BadProtocol)
                }
            }
        }
    }

    async fn step_three<A: AuthBackend>(
        &mut self,
        ctx: &SaslContext<A>,
        input: &[u8],
    ) -> SaslOutcome {
        let Ok(input) = std::str::from_utf8(input) else {
            return SaslOutcome::failure(SaslError::BadProtocol);
        };
        let Some(fields) = parse_key_values(input) else {
            return SaslOutcome::failure(SaslError::BadProtocol);
        };
        let get = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        let Some(username) = get("username") else {
            return SaslOutcome::failure(SaslError::BadProtocol);
        };
        let username = username.to_string();
        let (Some(digest_uri), Some(response), Some(cnonce)) =
            (get("digest-uri"), get("response"), get("cnonce"))
        else {
            return SaslOutcome::failure(SaslError::BadProtocol);
        };
        let realm = get("realm").unwrap_or("");
        let nc = get("nc").unwrap_or("");
        let qop = get("qop").unwrap_or("");
        let authzid = get("authzid").unwrap_or("").to_string();

        if !digest_uri_valid(digest_uri, &ctx.fqdn) {
            return SaslOutcome::failure_user(SaslError::NotAuthorized, username);
        }

        let prepped = match nodeprep(&username) {
            Ok(prepped) if !prepped.is_empty() => prepped,
            _ => return SaslOutcome::failure_user(SaslError::NotAuthorized, username),
        };

        let Some((password, auth_module)) = ctx.auth.get_password(&prepped, &ctx.server).await
        else {
            return SaslOutcome::failure_user(SaslError::NotAuthorized, username);
        };

        let expected = compute_response(
            &username,
            realm,
            &password,
            &self.nonce,
            cnonce,
            &authzid,
            nc,
            qop,
            "AUTHENTICATE",
            digest_uri,
        );
        if !expected.eq_ignore_ascii_case(response) {
            return SaslOutcome::failure_user(SaslError::NotAuthorized, username);
        }

        let rspauth = compute_response(
            &username,
            realm,
            &password,
            &self.nonce,
            cnonce,
            &authzid,
            nc,
            qop,
            "",
            digest_uri,
        );
        self.username = prepped;
        self.authzid = authzid;
        self.auth_module = auth_module;
        self.step = Step::Five;
        SaslOutcome::Continue(format!("rspauth={}", rspauth).into_bytes())
    }
}

/// Accept `xmpp/<host>` where host is our FQDN, or `xmpp/<host>/<servname>`
/// where the service name is our FQDN.
fn digest_uri_valid(digest_uri: &str, fqdn: &str) -> bool {
    let lowered = digest_uri.to_ascii_lowercase();
    let fqdn = fqdn.to_ascii_lowercase();
    let mut parts = lowered.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("xmpp"), Some(host), None, _) => host == fqdn,
        (Some("xmpp"), Some(_host), Some(servname), None) => servname == fqdn,
        _ => false,
    }
}

/// The RFC 2831 digest computation.
///
/// `A1 = MD5(user:realm:pass) ":" nonce ":" cnonce [":" authzid]`,
/// `A2 = prefix ":" digest-uri` (for `qop` other than `auth` with the
/// 32-zero suffix), and the result is
/// `HEX(MD5(HEX(MD5(A1)) ":" nonce ":" nc ":" cnonce ":" qop ":" HEX(MD5(A2))))`.
/// The prefix is `AUTHENTICATE` for the client response and empty for
/// `rspauth`.
#[allow(clippy::too_many_arguments)]
fn compute_response(
    user: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    authzid: &str,
    nc: &str,
    qop: &str,
    a2_prefix: &str,
    digest_uri: &str,
) -> String {
    let mut a1 = md5_raw(format!("{}:{}:{}", user, realm, password).as_bytes()).to_vec();
    a1.extend_from_slice(format!(":{}:{}", nonce, cnonce).as_bytes());
    if !authzid.is_empty() {
        a1.extend_from_slice(format!(":{}", authzid).as_bytes());
    }

    let a2 = if qop == "auth" {
        format!("{}:{}", a2_prefix, digest_uri)
    } else {
        format!("{}:{}:00000000000000000000000000000000", a2_prefix, digest_uri)
    };

    let t = format!(
        "{}:{}:{}:{}:{}:{}",
        hex(&md5_raw(&a1)),
        nonce,
        nc,
        cnonce,
        qop,
        hex(&md5_raw(a2.as_bytes()))
    );
    hex(&md5_raw(t.as_bytes()))
}

fn md5_raw(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Parse an RFC 2831 key/value list.
///
/// Values are tokens or quoted strings with backslash escapes. Returns
/// `None` on grammar violations, including an unterminated quote.
fn parse_key_values(input: &str) -> Option<Vec<(String, String)>> {
    let mut fields = Vec::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if rest.is_empty() {
            return Some(fields);
        }

        let eq = rest.find('=')?;
        let key = rest[..eq].trim().to_ascii_lowercase();
        if key.is_empty() {
            return None;
        }
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = quoted.char_indices();
            let mut end = None;
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some((_, escaped)) => out.push(escaped),
                        None => return None,
                    },
                    '"' => {
                        end = Some(i);
                        break;
                    }
                    _ => out.push(c),
                }
            }
            let end = end?;
            value = out;
            rest = &quoted[end + 1..];
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }

        fields.push((key, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryAuthBackend;
    use std::sync::Arc;

    fn ctx() -> SaslContext<InMemoryAuthBackend> {
        let auth = InMemoryAuthBackend::new();
        auth.add_user("chris", "elwood.innosoft.com", "secret");
        SaslContext {
            server: "elwood.innosoft.com".to_string(),
            fqdn: "elwood.innosoft.com".to_string(),
            auth: Arc::new(auth),
        }
    }

    #[test]
    fn rfc_2831_response_vectors() {
        // The worked example from RFC 2831 section 4.
        let response = compute_response(
            "chris",
            "elwood.innosoft.com",
            "secret",
            "OA6MG9tEQGm2hh",
            "OA6MHXh6VqTrRk",
            "",
            "00000001",
            "auth",
            "AUTHENTICATE",
            "imap/elwood.innosoft.com",
        );
        assert_eq!(response, "d388dad90d4bbd760a152321f2143af7");

        let rspauth = compute_response(
            "chris",
            "elwood.innosoft.com",
            "secret",
            "OA6MG9tEQGm2hh",
            "OA6MHXh6VqTrRk",
            "",
            "00000001",
            "auth",
            "",
            "imap/elwood.innosoft.com",
        );
        assert_eq!(rspauth, "ea40f60335c427b5527b84dbabcdfffd");
    }

    #[test]
    fn key_value_parsing() {
        let fields = parse_key_values(
            "username=\"chris\",realm=\"elwood.innosoft.com\",nc=00000001,\
             qop=auth,escaped=\"a\\\"b\"",
        )
        .unwrap();
        let get = |k: &str| {
            fields
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("username"), Some("chris"));
        assert_eq!(get("nc"), Some("00000001"));
        assert_eq!(get("qop"), Some("auth"));
        assert_eq!(get("escaped"), Some("a\"b"));
    }

    #[test]
    fn unterminated_quote_is_malformed() {
        assert!(parse_key_values("username=\"chris").is_none());
        assert!(parse_key_values("username=\"chris\\").is_none());
    }

    #[test]
    fn digest_uri_forms() {
        assert!(digest_uri_valid("xmpp/example.net", "example.net"));
        assert!(digest_uri_valid("XMPP/Example.Net", "example.net"));
        assert!(digest_uri_valid("xmpp/backend7/example.net", "example.net"));
        assert!(!digest_uri_valid("xmpp/other.net", "example.net"));
        assert!(!digest_uri_valid("imap/example.net", "example.net"));
        assert!(!digest_uri_valid("xmpp", "example.net"));
    }

    #[tokio::test]
    async fn full_exchange_succeeds() {
        let ctx = ctx();
        let mut mech = DigestMd5::with_nonce("OA6MG9tEQGm2hh".to_string());

        // Step one: the server challenge.
        let challenge = match mech.step(&ctx, b"").await {
            SaslOutcome::Continue(data) => String::from_utf8(data).unwrap(),
            other => panic!("expected Continue, got {:?}", other),
        };
        assert!(challenge.contains("nonce=\"OA6MG9tEQGm2hh\""));
        assert!(challenge.contains("qop=\"auth\""));

        // Step three: a response the client would compute.
        let response = compute_response(
            "chris",
            "elwood.innosoft.com",
            "secret",
            "OA6MG9tEQGm2hh",
            "OA6MHXh6VqTrRk",
            "",
            "00000001",
            "auth",
            "AUTHENTICATE",
            "xmpp/elwood.innosoft.com",
        );
        let client = format!(
            "charset=utf-8,username=\"chris\",realm=\"elwood.innosoft.com\",\
             nonce=\"OA6MG9tEQGm2hh\",nc=00000001,cnonce=\"OA6MHXh6VqTrRk\",\
             digest-uri=\"xmpp/elwood.innosoft.com\",response={},qop=auth",
            response
        );
        let rspauth = match mech.step(&ctx, client.as_bytes()).await {
            SaslOutcome::Continue(data) => String::from_utf8(data).unwrap(),
            other => panic!("expected Continue, got {:?}", other),
        };
        assert!(rspauth.starts_with("rspauth="));

        // Step five: empty client acknowledgement completes the exchange.
        match mech.step(&ctx, b"").await {
            SaslOutcome::Done(props) => {
                assert_eq!(props.username, "chris");
                assert_eq!(props.auth_module, "internal");
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_response_is_rejected() {
        let ctx = ctx();
        let mut mech = DigestMd5::with_nonce("abc".to_string());
        let _ = mech.step(&ctx, b"").await;

        let client = "username=\"chris\",realm=\"elwood.innosoft.com\",\
                      nonce=\"abc\",nc=00000001,cnonce=\"def\",\
                      digest-uri=\"xmpp/elwood.innosoft.com\",\
                      response=00000000000000000000000000000000,qop=auth";
        match mech.step(&ctx, client.as_bytes()).await {
            SaslOutcome::Failure { error, username } => {
                assert_eq!(error, SaslError::NotAuthorized);
                assert_eq!(username.as_deref(), Some("chris"));
            }
            other => panic!("expected Failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_empty_input_at_final_step_is_bad_protocol() {
        let ctx = ctx();
        let mut mech = DigestMd5::with_nonce("OA6MG9tEQGm2hh".to_string());
        let _ = mech.step(&ctx, b"").await;
        let response = compute_response(
            "chris",
            "elwood.innosoft.com",
            "secret",
            "OA6MG9tEQGm2hh",
            "OA6MHXh6VqTrRk",
            "",
            "00000001",
            "auth",
            "AUTHENTICATE",
            "xmpp/elwood.innosoft.com",
        );
        let client = format!(
            "username=\"chris\",realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",\
             nc=00000001,cnonce=\"OA6MHXh6VqTrRk\",digest-uri=\"xmpp/elwood.innosoft.com\",\
             response={},qop=auth",
            response
        );
        let _ = mech.step(&ctx, client.as_bytes()).await;
        assert!(matches!(
            mech.step(&ctx, b"extra").await,
            SaslOutcome::Failure {
                error: SaslError::BadProtocol,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn malformed_field_list_is_bad_protocol() {
        let ctx = ctx();
        let mut mech = DigestMd5::with_nonce("abc".to_string());
        let _ = mech.step(&ctx, b"").await;
        assert!(matches!(
            mech.step(&ctx, b"username=\"chris").await,
            SaslOutcome::Failure {
                error: SaslError::BadProtocol,
                ..
            }
        ));
    }
}
