//! RFC 6120 stream negotiation tests: stream open, SASL PLAIN, resource
//! binding, session establishment, legacy authentication, and fatal stream
//! errors.

mod common;

use common::{establish, plain_credentials, RawClient, TestServer};
use sha1::{Digest, Sha1};

/// The full happy path: stream open, SASL PLAIN, stream restart, bind with a
/// requested resource, session establishment.
#[tokio::test]
async fn sasl_plain_bind_session_happy_path() {
    let server = TestServer::start().await;
    let mut client = RawClient::connect(server.addr).await;

    let header = client.open_stream().await;
    assert!(header.contains("xmlns='jabber:client'"));
    assert!(header.contains("from='localhost'"));
    assert!(header.contains("version='1.0'"));
    assert!(header.contains("id='"));

    let features = client.recv_until("</stream:features>").await;
    assert!(features.contains("<mechanisms"));
    assert!(features.contains("<mechanism>PLAIN</mechanism>"));
    assert!(features.contains("<mechanism>DIGEST-MD5</mechanism>"));

    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            plain_credentials("test", "secret")
        ))
        .await;
    client.recv_until("<success").await;

    // The stream restarts after SASL; bind and session are advertised.
    client.open_stream().await;
    let features = client.recv_until("</stream:features>").await;
    assert!(features.contains("<bind"));
    assert!(features.contains("<session"));

    client
        .send(
            "<iq type='set' id='bind_1'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>x</resource></bind></iq>",
        )
        .await;
    let bind_reply = client.recv_until("</iq>").await;
    assert!(bind_reply.contains("type='result'"));
    assert!(bind_reply.contains("id='bind_1'"));
    assert!(bind_reply.contains("<jid>test@localhost/x</jid>"));

    client
        .send(
            "<iq type='set' id='sess_1'>\
             <session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
        )
        .await;
    let session_reply = client.recv_until("</iq>").await;
    assert!(session_reply.contains("type='result'"));
    assert!(session_reply.contains("id='sess_1'"));

    // The session is now live in the manager.
    let mut found = false;
    for _ in 0..50 {
        if !server
            .server
            .session_manager()
            .find_sids_by_usr("test", "localhost", "x")
            .is_empty()
        {
            found = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(found, "session not present in the session manager");
}

/// A wrong stream namespace earns a header, an `invalid-namespace` stream
/// error, and a disconnect.
#[tokio::test]
async fn wrong_stream_namespace_is_fatal() {
    let server = TestServer::start().await;
    let mut client = RawClient::connect(server.addr).await;

    client
        .send(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://wrong.example/streams' \
             to='localhost' version='1.0'>",
        )
        .await;

    let transcript = client.recv_until("</stream:stream>").await;
    assert!(transcript.contains("<stream:stream"));
    assert!(transcript.contains("<stream:error>"));
    assert!(transcript.contains("<invalid-namespace"));
    client.expect_close().await;
}

/// A stream opened against a host we do not serve is refused.
#[tokio::test]
async fn unknown_host_is_refused() {
    let server = TestServer::start().await;
    let mut client = RawClient::connect(server.addr).await;

    client
        .send(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             to='nowhere.example' version='1.0'>",
        )
        .await;

    let transcript = client.recv_until("</stream:stream>").await;
    assert!(transcript.contains("<host-unknown"));
    client.expect_close().await;
}

/// Wrong SASL credentials produce a `<failure>` and the stream stays usable
/// for another attempt.
#[tokio::test]
async fn sasl_plain_failure_allows_retry() {
    let server = TestServer::start().await;
    let mut client = RawClient::connect(server.addr).await;

    client.open_stream().await;
    client.recv_until("</stream:features>").await;

    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            plain_credentials("test", "wrong-password")
        ))
        .await;
    let failure = client.recv_until("</failure>").await;
    assert!(failure.contains("<not-authorized"));

    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            plain_credentials("test", "secret")
        ))
        .await;
    client.recv_until("<success").await;
}

/// An unknown mechanism is refused without closing the stream.
#[tokio::test]
async fn unknown_sasl_mechanism_is_refused() {
    let server = TestServer::start().await;
    let mut client = RawClient::connect(server.addr).await;

    client.open_stream().await;
    client.recv_until("</stream:features>").await;

    client
        .send("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='EXTERNAL'>=</auth>")
        .await;
    let failure = client.recv_until("</failure>").await;
    assert!(failure.contains("<invalid-mechanism"));
}

/// The legacy pre-1.0 `jabber:iq:auth` path with a SHA1 stream digest.
#[tokio::test]
async fn legacy_digest_authentication() {
    let server = TestServer::start().await;
    let mut client = RawClient::connect(server.addr).await;

    // No version attribute: the server takes the legacy path.
    client
        .send(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             to='localhost'>",
        )
        .await;
    client.recv_until("<stream:stream").await;
    let header = client.recv_until(">").await;
    assert!(!header.contains("version="));

    let stream_id = extract_attr(&header, "id").expect("stream id in header");

    // Field discovery.
    client
        .send(
            "<iq type='get' id='auth_1'>\
             <query xmlns='jabber:iq:auth'><username>test</username></query></iq>",
        )
        .await;
    let fields = client.recv_until("</iq>").await;
    assert!(fields.contains("<username>test</username>"));
    assert!(fields.contains("<password/>"));
    assert!(fields.contains("<digest/>"));
    assert!(fields.contains("<resource/>"));

    // Authenticate with SHA1(streamid || password).
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(b"secret");
    let digest: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    client
        .send(&format!(
            "<iq type='set' id='auth_2'>\
             <query xmlns='jabber:iq:auth'>\
             <username>test</username>\
             <digest>{}</digest>\
             <resource>legacy</resource></query></iq>",
            digest
        ))
        .await;
    let reply = client.recv_until("</iq>").await;
    assert!(reply.contains("type='result'"), "reply: {}", reply);
    assert!(reply.contains("id='auth_2'"));

    // The session is established: a message to our own bare JID comes back.
    client
        .send("<message to='test@localhost' type='chat'><body>echo-check</body></message>")
        .await;
    client.recv_until("echo-check").await;
}

/// A legacy auth set without a resource is not acceptable, and the error
/// reply does not echo credentials.
#[tokio::test]
async fn legacy_auth_requires_a_resource() {
    let server = TestServer::start().await;
    let mut client = RawClient::connect(server.addr).await;

    client
        .send(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             to='localhost'>",
        )
        .await;
    client.recv_until(">").await;

    client
        .send(
            "<iq type='set' id='auth_1'>\
             <query xmlns='jabber:iq:auth'>\
             <username>test</username>\
             <password>hunter2-plaintext</password></query></iq>",
        )
        .await;
    let reply = client.recv_until("</iq>").await;
    assert!(reply.contains("<not-acceptable"));
    assert!(reply.contains("No resource provided"));
    assert!(!reply.contains("hunter2-plaintext"));
}

/// A stanza with a forged `from` terminates the stream.
#[tokio::test]
async fn forged_from_is_an_invalid_from_stream_error() {
    let server = TestServer::start().await;
    let mut client = establish(server.addr, "alice", "secret", "home").await;

    client
        .send(
            "<message from='mallory@localhost/evil' to='bob@localhost' type='chat'>\
             <body>spoof</body></message>",
        )
        .await;
    let transcript = client.recv_until("</stream:stream>").await;
    assert!(transcript.contains("<invalid-from"));
    client.expect_close().await;
}

/// A malformed recipient address earns a `jid-malformed` error reply and the
/// session survives.
#[tokio::test]
async fn malformed_to_address_is_bounced() {
    let server = TestServer::start().await;
    let mut client = establish(server.addr, "alice", "secret", "home").await;

    client
        .send("<message to='@broken' type='chat'><body>lost</body></message>")
        .await;
    let reply = client.recv_until("</message>").await;
    assert!(reply.contains("type='error'"));
    assert!(reply.contains("<jid-malformed"));

    // Still established: self-addressed traffic flows.
    client
        .send("<message to='alice@localhost' type='chat'><body>still-alive</body></message>")
        .await;
    client.recv_until("still-alive").await;
}

/// Closing the stream cleanly removes the session.
#[tokio::test]
async fn stream_end_closes_the_session() {
    let server = TestServer::start().await;
    let mut client = establish(server.addr, "alice", "secret", "home").await;

    client.send("</stream:stream>").await;
    client.recv_until("</stream:stream>").await;

    let mut gone = false;
    for _ in 0..50 {
        if server
            .server
            .session_manager()
            .find_sids_by_us("alice", "localhost")
            .is_empty()
        {
            gone = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(gone, "session lingered after stream end");
}

/// Extract a single-quoted attribute from raw XML text.
fn extract_attr(xml: &str, name: &str) -> Option<String> {
    let pattern = format!("{}='", name);
    let start = xml.find(&pattern)? + pattern.len();
    let end = xml[start..].find('\'')? + start;
    Some(xml[start..end].to_string())
}
