//! The client-to-server connection state machine.
//!
//! One process per accepted connection. Socket bytes arrive in the mailbox,
//! go through the incremental stream parser, and the resulting events drive
//! a seven-state automaton from stream open through SASL (or the legacy
//! `jabber:iq:auth` path), resource binding and session establishment into
//! the stanza pump. Stanzas routed to the session arrive in the same mailbox
//! and are written to the socket.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::prelude::*;
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthBackend;
use crate::error::{stream_errors, StanzaErrorCondition};
use crate::jid::{nameprep, resourceprep, Jid};
use crate::parser::{StreamEvent, StreamParser};
use crate::process::{self, Mailbox, Pid};
use crate::router::{RoutedPacket, Router};
use crate::sasl::{Mechanism, SaslContext, SaslError, SaslOutcome, SaslRegistry};
use crate::server::ServerConfig;
use crate::session::{SessionId, SessionInfo, SessionManager};
use crate::socket::{Socket, SocketEvent};
use crate::stanza::{
    get_random_string, iq_query_info, make_error_reply, make_result_iq_reply, ns, replace_from_to,
    stanza_error, stanza_error_with_text, stream_error, stream_error_with_text, stream_header,
    IqQuery, IqRequest, STREAM_TRAILER,
};
use crate::xml::Element;

/// Messages a connection process receives.
pub enum C2sMsg {
    /// Bytes or close from the owned socket
    Socket(SocketEvent),
    /// A stanza routed to this session
    Route(RoutedPacket),
    /// This session lost a resource collision; terminate
    Replaced,
}

impl From<SocketEvent> for C2sMsg {
    fn from(event: SocketEvent) -> Self {
        Self::Socket(event)
    }
}

/// The connection automaton states.
#[derive(Default)]
enum C2sState {
    /// Awaiting the client's stream open
    #[default]
    WaitForStream,
    /// Legacy pre-XMPP-1.0 `jabber:iq:auth` negotiation
    WaitForAuth,
    /// Stream 1.0 advertised, awaiting the SASL `<auth>`
    WaitForFeatureRequest,
    /// Mid-SASL, awaiting the next `<response>`
    WaitForSaslResponse(Mechanism),
    /// Authenticated, awaiting the bind IQ
    WaitForBind,
    /// Bound, awaiting the session IQ
    WaitForSession,
    /// Stanza pump
    SessionEstablished,
}

impl C2sState {
    fn name(&self) -> &'static str {
        match self {
            Self::WaitForStream => "wait_for_stream",
            Self::WaitForAuth => "wait_for_auth",
            Self::WaitForFeatureRequest => "wait_for_feature_request",
            Self::WaitForSaslResponse(_) => "wait_for_sasl_response",
            Self::WaitForBind => "wait_for_bind",
            Self::WaitForSession => "wait_for_session",
            Self::SessionEstablished => "session_established",
        }
    }
}

/// Whether the connection keeps running after an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Shared fabric a connection works against.
pub struct C2sDeps<A> {
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// The domain routing table
    pub router: Arc<Router>,
    /// The session manager
    pub sm: Arc<SessionManager<A>>,
    /// Offered SASL mechanisms
    pub sasl: Arc<SaslRegistry>,
    /// Credential backend
    pub auth: Arc<A>,
}

impl<A> Clone for C2sDeps<A> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
            sm: Arc::clone(&self.sm),
            sasl: Arc::clone(&self.sasl),
            auth: Arc::clone(&self.auth),
        }
    }
}

/// Spawn the connection process for an accepted socket.
pub fn start<A: AuthBackend>(
    stream: TcpStream,
    peer: SocketAddr,
    deps: C2sDeps<A>,
) -> Pid<C2sMsg> {
    process::spawn(move |pid, mailbox| async move {
        let socket = Socket::from_stream(stream, pid.clone(), deps.config.socket.clone());
        let connection = C2sConnection {
            pid,
            socket,
            parser: StreamParser::new(),
            state: C2sState::WaitForStream,
            stream_id: get_random_string(),
            server: String::new(),
            authenticated: false,
            user: String::new(),
            resource: String::new(),
            jid: None,
            sid: None,
            lang: String::new(),
            pres_t: HashSet::new(),
            pres_f: HashSet::new(),
            pres_a: HashSet::new(),
            pres_i: HashSet::new(),
            pres_last: None,
            pres_last_at: None,
            pres_invis: false,
            peer,
            deps,
        };
        connection.run(mailbox).await
    })
}

struct C2sConnection<A: AuthBackend> {
    pid: Pid<C2sMsg>,
    socket: Socket<C2sMsg>,
    parser: StreamParser,
    state: C2sState,
    stream_id: String,
    /// Canonical host this stream was opened against
    server: String,
    authenticated: bool,
    /// Canonical authenticated user
    user: String,
    /// Canonical bound resource
    resource: String,
    jid: Option<Jid>,
    sid: Option<SessionId>,
    lang: String,
    /// Peers I may see (probe targets on first presence)
    pres_t: HashSet<Jid>,
    /// Peers who may see me
    pres_f: HashSet<Jid>,
    /// Peers currently shown my presence
    pres_a: HashSet<Jid>,
    /// Peers I am invisible to
    pres_i: HashSet<Jid>,
    pres_last: Option<Element>,
    pres_last_at: Option<SystemTime>,
    pres_invis: bool,
    peer: SocketAddr,
    deps: C2sDeps<A>,
}

impl<A: AuthBackend> C2sConnection<A> {
    #[instrument(name = "c2s", skip(self, mailbox), fields(peer = %self.peer))]
    async fn run(mut self, mut mailbox: Mailbox<C2sMsg>) -> Result<(), crate::XmppError> {
        info!("client connected");
        self.socket.activate();

        while let Some(msg) = mailbox.receive().await {
            let flow = match msg {
                C2sMsg::Socket(SocketEvent::Data(bytes)) => {
                    let events = self.parser.feed(&bytes);
                    let mut flow = Flow::Continue;
                    for event in events {
                        flow = self.handle_stream_event(event).await;
                        if flow == Flow::Stop {
                            break;
                        }
                    }
                    if flow == Flow::Continue {
                        self.socket.activate();
                    }
                    flow
                }
                C2sMsg::Socket(SocketEvent::Closed) => {
                    debug!("connection closed by peer");
                    Flow::Stop
                }
                C2sMsg::Route(packet) => {
                    self.handle_routed(packet).await;
                    Flow::Continue
                }
                C2sMsg::Replaced => {
                    debug!("session replaced by a newer connection");
                    let error =
                        stream_error_with_text(stream_errors::CONFLICT, "Replaced by new connection");
                    let _ = self
                        .send_text(&format!("{}{}", error.to_xml(), STREAM_TRAILER))
                        .await;
                    Flow::Stop
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }

        self.terminate().await;
        Ok(())
    }

    /// Final cleanup: close the session, tell available peers we are gone.
    async fn terminate(&mut self) {
        if let Some(sid) = self.sid.take() {
            self.deps.sm.close_session(sid);
            if let Some(jid) = self.jid.clone() {
                let unavailable = Element::new("presence").attr_set("type", "unavailable");
                let peers: Vec<Jid> = self.pres_a.union(&self.pres_i).cloned().collect();
                for peer in peers {
                    self.deps.router.route(&jid, &peer, &unavailable);
                }
            }
            info!(jid = %self.jid.as_ref().map(Jid::to_string).unwrap_or_default(), "session closed");
        }
        self.socket.close();
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) -> Flow {
        match event {
            StreamEvent::StreamStart { name: _, attrs } => self.on_stream_start(&attrs).await,
            StreamEvent::Element(el) => self.on_element(el).await,
            StreamEvent::StreamEnd(_) => {
                debug!("client closed the stream");
                let _ = self.send_text(STREAM_TRAILER).await;
                Flow::Stop
            }
            StreamEvent::Error(msg) => {
                debug!(error = %msg, "stream parse error");
                if matches!(self.state, C2sState::WaitForStream) {
                    let _ = self.send_default_header().await;
                }
                self.stream_error_and_stop(stream_errors::XML_NOT_WELL_FORMED)
                    .await
            }
        }
    }

    /// The stream open handshake.
    async fn on_stream_start(&mut self, attrs: &[(String, String)]) -> Flow {
        let attr = |name: &str| {
            attrs
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };

        if attr("xmlns:stream") != Some(ns::STREAM) {
            let _ = self.send_default_header().await;
            return self
                .stream_error_and_stop(stream_errors::INVALID_NAMESPACE)
                .await;
        }

        let to = attr("to").unwrap_or("");
        let server = nameprep(to).unwrap_or_default();
        let version = attr("version").unwrap_or("");
        self.lang = match attr("xml:lang") {
            Some(lang) => lang.chars().take(35).collect(),
            None => self.deps.config.default_lang.clone(),
        };

        if !self.deps.config.hosts.contains(&server) {
            debug!(host = %server, "stream opened against an unserved host");
            let shown = if to.is_empty() {
                self.deps.config.hosts.first().cloned().unwrap_or_default()
            } else {
                to.to_string()
            };
            let header = stream_header(&self.stream_id, &shown, "", &self.lang);
            let _ = self.send_text(&header).await;
            return self.stream_error_and_stop(stream_errors::HOST_UNKNOWN).await;
        }
        self.server = server;

        let version_out = if version == "1.0" { "1.0" } else { "" };
        let header = stream_header(&self.stream_id, &self.server, version_out, &self.lang);
        if self.send_text(&header).await == Flow::Stop {
            return Flow::Stop;
        }

        if version == "1.0" {
            if !self.authenticated {
                let flow = self.send_element(&self.features_pre_auth()).await;
                self.state = C2sState::WaitForFeatureRequest;
                flow
            } else if self.resource.is_empty() {
                let features = Element::new("stream:features")
                    .child(Element::new("bind").attr_set("xmlns", ns::BIND))
                    .child(Element::new("session").attr_set("xmlns", ns::SESSION));
                let flow = self.send_element(&features).await;
                self.state = C2sState::WaitForBind;
                flow
            } else {
                let flow = self.send_element(&Element::new("stream:features")).await;
                self.state = C2sState::WaitForSession;
                flow
            }
        } else {
            self.state = C2sState::WaitForAuth;
            Flow::Continue
        }
    }

    /// Stream features offered before authentication.
    fn features_pre_auth(&self) -> Element {
        let mut mechanisms = Element::new("mechanisms").attr_set("xmlns", ns::SASL);
        for name in self.deps.sasl.mechanisms() {
            mechanisms.append_child(Element::new("mechanism").text_node(*name));
        }
        let mut features = Element::new("stream:features").child(mechanisms);
        for extra in &self.deps.config.extra_stream_features {
            features.append_child(extra.clone());
        }
        features
    }

    async fn on_element(&mut self, el: Element) -> Flow {
        let state = std::mem::take(&mut self.state);
        let (next, flow) = match state {
            C2sState::WaitForStream => {
                // The parser only reports depth-1 elements under an open
                // root, so this input is out of order by construction.
                let _ = self.send_default_header().await;
                let flow = self
                    .stream_error_and_stop(stream_errors::XML_NOT_WELL_FORMED)
                    .await;
                (C2sState::WaitForStream, flow)
            }
            C2sState::WaitForAuth => self.wait_for_auth(el).await,
            C2sState::WaitForFeatureRequest => self.wait_for_feature_request(el).await,
            C2sState::WaitForSaslResponse(mech) => self.wait_for_sasl_response(mech, el).await,
            C2sState::WaitForBind => self.wait_for_bind(el).await,
            C2sState::WaitForSession => self.wait_for_session(el).await,
            C2sState::SessionEstablished => self.session_established(el).await,
        };
        debug!(state = next.name(), "automaton state");
        self.state = next;
        flow
    }

    // ------------------------------------------------------------------
    // Legacy jabber:iq:auth
    // ------------------------------------------------------------------

    async fn wait_for_auth(&mut self, el: Element) -> (C2sState, Flow) {
        match iq_query_info(&el) {
            IqQuery::Request { kind: IqRequest::Get, xmlns, payload } if xmlns == ns::AUTH => {
                // Advertise the fields we accept; echo the username if the
                // client already supplied one.
                let username = match payload.get_child("username") {
                    Some(u) if !u.text().is_empty() => {
                        Element::new("username").text_node(u.text())
                    }
                    _ => Element::new("username"),
                };
                let query = Element::new("query")
                    .attr_set("xmlns", ns::AUTH)
                    .child(username)
                    .child(Element::new("password"))
                    .child(Element::new("digest"))
                    .child(Element::new("resource"));
                let mut reply = make_result_iq_reply(&el);
                reply.clear_children();
                reply.append_child(query);
                let flow = self.send_element(&reply).await;
                (C2sState::WaitForAuth, flow)
            }
            IqQuery::Request { kind: IqRequest::Set, xmlns, payload } if xmlns == ns::AUTH => {
                self.legacy_auth_set(&el, &payload).await
            }
            IqQuery::Request { .. } | IqQuery::Invalid => {
                let flow = self
                    .send_element(&sanitized_error_reply(
                        &el,
                        stanza_error(StanzaErrorCondition::ServiceUnavailable),
                    ))
                    .await;
                (C2sState::WaitForAuth, flow)
            }
            IqQuery::Reply(_) | IqQuery::NotIq => {
                debug!(stanza = el.name(), "dropping stanza before authentication");
                (C2sState::WaitForAuth, Flow::Continue)
            }
        }
    }

    async fn legacy_auth_set(&mut self, el: &Element, payload: &Element) -> (C2sState, Flow) {
        let child_text = |name: &str| {
            payload
                .get_child(name)
                .map(|c| c.text())
                .unwrap_or_default()
        };
        let username = child_text("username");
        let password = child_text("password");
        let digest = child_text("digest");
        let resource = child_text("resource");

        if resource.is_empty() {
            let error = stanza_error_with_text(
                StanzaErrorCondition::NotAcceptable,
                "No resource provided",
            );
            let flow = self.send_element(&sanitized_error_reply(el, error)).await;
            return (C2sState::WaitForAuth, flow);
        }

        let jid = match Jid::new(&username, &self.server, &resource) {
            Ok(jid) => jid,
            Err(e) => {
                debug!(error = %e, "legacy auth with malformed JID");
                let flow = self
                    .send_element(&sanitized_error_reply(
                        el,
                        stanza_error(StanzaErrorCondition::JidMalformed),
                    ))
                    .await;
                return (C2sState::WaitForAuth, flow);
            }
        };

        if !self.access_allowed(&jid) {
            let flow = self
                .send_element(&sanitized_error_reply(
                    el,
                    stanza_error(StanzaErrorCondition::NotAllowed),
                ))
                .await;
            return (C2sState::WaitForAuth, flow);
        }

        let stream_id = self.stream_id.clone();
        let accepted = self
            .deps
            .auth
            .check_password_digest(
                jid.luser(),
                jid.lserver(),
                &password,
                &digest,
                move |stored| legacy_auth_digest(&stream_id, stored),
            )
            .await;

        match accepted {
            Some(_module) => {
                info!(jid = %jid, "legacy authentication succeeded");
                let mut reply = make_result_iq_reply(el);
                reply.clear_children();
                if self.send_element(&reply).await == Flow::Stop {
                    return (C2sState::WaitForAuth, Flow::Stop);
                }
                self.authenticated = true;
                self.user = jid.luser().to_string();
                self.resource = jid.lresource().to_string();
                self.jid = Some(jid);
                self.open_session();
                (C2sState::SessionEstablished, Flow::Continue)
            }
            None => {
                warn!(user = %username, server = %self.server, ip = %self.peer,
                    "legacy authentication failed");
                let flow = self
                    .send_element(&sanitized_error_reply(
                        el,
                        stanza_error(StanzaErrorCondition::NotAuthorized),
                    ))
                    .await;
                (C2sState::WaitForAuth, flow)
            }
        }
    }

    // ------------------------------------------------------------------
    // SASL
    // ------------------------------------------------------------------

    async fn wait_for_feature_request(&mut self, el: Element) -> (C2sState, Flow) {
        if el.attr("xmlns") == Some(ns::SASL) && el.name() == "auth" {
            let mech_name = el.attr("mechanism").unwrap_or("").to_string();
            let input = match decode_sasl_payload(&el.text()) {
                Ok(input) => input,
                Err(()) => {
                    let flow = self.send_sasl_failure(SaslError::IncorrectEncoding).await;
                    return (C2sState::WaitForFeatureRequest, flow);
                }
            };
            let ctx = self.sasl_context();
            let registry = Arc::clone(&self.deps.sasl);
            let (mech, outcome) = registry.server_start(&ctx, &mech_name, &input).await;
            return self.handle_sasl_outcome(mech, outcome).await;
        }
        if el.attr("xmlns") == Some(ns::SASL) && el.name() == "abort" {
            let flow = self.send_sasl_failure(SaslError::Aborted).await;
            return (C2sState::WaitForFeatureRequest, flow);
        }
        let flow = self.unauthenticated_stanza(&el).await;
        (C2sState::WaitForFeatureRequest, flow)
    }

    async fn wait_for_sasl_response(
        &mut self,
        mut mech: Mechanism,
        el: Element,
    ) -> (C2sState, Flow) {
        if el.attr("xmlns") == Some(ns::SASL) && el.name() == "response" {
            let input = match decode_sasl_payload(&el.text()) {
                Ok(input) => input,
                Err(()) => {
                    let flow = self.send_sasl_failure(SaslError::IncorrectEncoding).await;
                    return (C2sState::WaitForFeatureRequest, flow);
                }
            };
            let ctx = self.sasl_context();
            let registry = Arc::clone(&self.deps.sasl);
            let outcome = registry.server_step(&ctx, &mut mech, &input).await;
            return self.handle_sasl_outcome(Some(mech), outcome).await;
        }
        if el.attr("xmlns") == Some(ns::SASL) && el.name() == "abort" {
            let flow = self.send_sasl_failure(SaslError::Aborted).await;
            return (C2sState::WaitForFeatureRequest, flow);
        }
        let flow = self.unauthenticated_stanza(&el).await;
        (C2sState::WaitForSaslResponse(mech), flow)
    }

    fn sasl_context(&self) -> SaslContext<A> {
        let fqdn = self
            .deps
            .config
            .fqdn
            .clone()
            .unwrap_or_else(|| self.server.clone());
        SaslContext {
            server: self.server.clone(),
            fqdn,
            auth: Arc::clone(&self.deps.auth),
        }
    }

    async fn handle_sasl_outcome(
        &mut self,
        mech: Option<Mechanism>,
        outcome: SaslOutcome,
    ) -> (C2sState, Flow) {
        match outcome {
            SaslOutcome::Done(props) => {
                info!(user = %props.username, module = %props.auth_module,
                    "SASL authentication succeeded");
                let success = Element::new("success").attr_set("xmlns", ns::SASL);
                let flow = self.send_element(&success).await;
                // The client restarts the stream; so do we.
                self.parser.reset();
                self.authenticated = true;
                self.user = props.username;
                self.stream_id = get_random_string();
                (C2sState::WaitForStream, flow)
            }
            SaslOutcome::Continue(output) => {
                let challenge = Element::new("challenge")
                    .attr_set("xmlns", ns::SASL)
                    .text_node(BASE64_STANDARD.encode(&output));
                let flow = self.send_element(&challenge).await;
                match mech {
                    Some(mech) => (C2sState::WaitForSaslResponse(mech), flow),
                    // A mechanism that continues must exist; recover to the
                    // feature request state if not.
                    None => (C2sState::WaitForFeatureRequest, flow),
                }
            }
            SaslOutcome::Failure { error, username } => {
                match username {
                    Some(user) => warn!(user = %user, ip = %self.peer,
                        condition = error.as_str(), "SASL authentication failed"),
                    None => debug!(condition = error.as_str(), "SASL negotiation failed"),
                }
                let flow = self.send_sasl_failure(error).await;
                (C2sState::WaitForFeatureRequest, flow)
            }
        }
    }

    async fn send_sasl_failure(&mut self, error: SaslError) -> Flow {
        let failure = Element::new("failure")
            .attr_set("xmlns", ns::SASL)
            .child(Element::new(error.as_str()));
        self.send_element(&failure).await
    }

    /// Pre-authentication stanzas: IQ requests bounce, everything else is
    /// dropped. Credential sub-trees are never echoed.
    async fn unauthenticated_stanza(&mut self, el: &Element) -> Flow {
        match iq_query_info(el) {
            IqQuery::Request { .. } => {
                self.send_element(&sanitized_error_reply(
                    el,
                    stanza_error(StanzaErrorCondition::ServiceUnavailable),
                ))
                .await
            }
            _ => {
                debug!(stanza = el.name(), "dropping stanza before authentication");
                Flow::Continue
            }
        }
    }

    // ------------------------------------------------------------------
    // Bind and session
    // ------------------------------------------------------------------

    async fn wait_for_bind(&mut self, el: Element) -> (C2sState, Flow) {
        let IqQuery::Request { kind: IqRequest::Set, xmlns, payload } = iq_query_info(&el) else {
            debug!(stanza = el.name(), "ignoring stanza while awaiting bind");
            return (C2sState::WaitForBind, Flow::Continue);
        };
        if xmlns != ns::BIND {
            debug!("ignoring non-bind IQ while awaiting bind");
            return (C2sState::WaitForBind, Flow::Continue);
        }

        let requested = payload
            .get_child("resource")
            .map(|r| r.text())
            .unwrap_or_default();
        let resource = if requested.is_empty() {
            format!("{}{}", get_random_string(), unix_time())
        } else {
            requested
        };

        let resource = match resourceprep(&resource) {
            Ok(prepped) if !prepped.is_empty() => prepped,
            _ => {
                let flow = self
                    .send_element(&make_error_reply(
                        &el,
                        stanza_error(StanzaErrorCondition::BadRequest),
                    ))
                    .await;
                return (C2sState::WaitForBind, flow);
            }
        };

        let jid = match Jid::new(&self.user, &self.server, &resource) {
            Ok(jid) => jid,
            Err(e) => {
                debug!(error = %e, "bind produced a malformed JID");
                let flow = self
                    .send_element(&make_error_reply(
                        &el,
                        stanza_error(StanzaErrorCondition::BadRequest),
                    ))
                    .await;
                return (C2sState::WaitForBind, flow);
            }
        };

        let bind = Element::new("bind")
            .attr_set("xmlns", ns::BIND)
            .child(Element::new("jid").text_node(jid.to_string()));
        let mut reply = make_result_iq_reply(&el);
        reply.clear_children();
        reply.append_child(bind);
        let flow = self.send_element(&reply).await;

        debug!(jid = %jid, "resource bound");
        self.resource = resource;
        self.jid = Some(jid);
        (C2sState::WaitForSession, flow)
    }

    async fn wait_for_session(&mut self, el: Element) -> (C2sState, Flow) {
        let IqQuery::Request { kind: IqRequest::Set, xmlns, .. } = iq_query_info(&el) else {
            debug!(stanza = el.name(), "ignoring stanza while awaiting session");
            return (C2sState::WaitForSession, Flow::Continue);
        };
        if xmlns != ns::SESSION {
            debug!("ignoring non-session IQ while awaiting session");
            return (C2sState::WaitForSession, Flow::Continue);
        }

        let Some(jid) = self.jid.clone() else {
            let flow = self
                .send_element(&make_error_reply(
                    &el,
                    stanza_error(StanzaErrorCondition::NotAllowed),
                ))
                .await;
            return (C2sState::WaitForSession, flow);
        };

        if !self.access_allowed(&jid) {
            let flow = self
                .send_element(&make_error_reply(
                    &el,
                    stanza_error(StanzaErrorCondition::NotAllowed),
                ))
                .await;
            return (C2sState::WaitForSession, flow);
        }

        let flow = self.send_element(&make_result_iq_reply(&el)).await;
        self.open_session();
        info!(jid = %jid, "session established");
        (C2sState::SessionEstablished, flow)
    }

    /// Record the session in the SM and seed the presence sets from the
    /// roster hook (stubbed to the user's own bare JID).
    fn open_session(&mut self) {
        let Some(jid) = self.jid.clone() else {
            return;
        };
        let sid = SessionId::next(self.pid.id());
        self.sid = Some(sid);
        self.deps.sm.open_session(
            sid,
            self.pid.clone(),
            &self.user,
            &self.server,
            &self.resource,
            0,
            SessionInfo {
                ip: Some(self.peer),
            },
        );
        let bare = jid.bare();
        self.pres_f.insert(bare.clone());
        self.pres_t.insert(bare);
    }

    /// Session access rule. A policy hook in a full deployment; the default
    /// allows.
    fn access_allowed(&self, _jid: &Jid) -> bool {
        true
    }

    // ------------------------------------------------------------------
    // The stanza pump
    // ------------------------------------------------------------------

    async fn session_established(&mut self, el: Element) -> (C2sState, Flow) {
        let Some(own) = self.jid.clone() else {
            return (C2sState::SessionEstablished, Flow::Continue);
        };

        if !matches!(el.name(), "message" | "presence" | "iq") {
            debug!(stanza = el.name(), "dropping unknown stanza");
            return (C2sState::SessionEstablished, Flow::Continue);
        }

        // A from attribute, when present, must name this session.
        if let Some(from_attr) = el.attr("from") {
            let valid = from_attr.parse::<Jid>().is_ok_and(|from| {
                from.luser() == own.luser()
                    && from.lserver() == own.lserver()
                    && (from.lresource() == own.lresource() || from.lresource().is_empty())
            });
            if !valid {
                debug!(from = %from_attr, "stanza with a foreign from address");
                let flow = self.stream_error_and_stop(stream_errors::INVALID_FROM).await;
                return (C2sState::SessionEstablished, flow);
            }
        }

        let to = match el.attr("to") {
            None | Some("") => own.bare(),
            Some(to_attr) => match to_attr.parse::<Jid>() {
                Ok(to) => to,
                Err(e) => {
                    debug!(to = %to_attr, error = %e, "stanza with malformed to address");
                    let stanza_type = el.attr("type").unwrap_or("");
                    if stanza_type != "error" && stanza_type != "result" {
                        let reply = make_error_reply(
                            &el,
                            stanza_error(StanzaErrorCondition::JidMalformed),
                        );
                        let flow = self.send_element(&reply).await;
                        return (C2sState::SessionEstablished, flow);
                    }
                    return (C2sState::SessionEstablished, Flow::Continue);
                }
            },
        };

        let mut el = el;
        el.remove_attr("xmlns");
        if el.attr("xml:lang").is_none() && !self.lang.is_empty() {
            el.set_attr("xml:lang", self.lang.clone());
        }

        match el.name() {
            "presence" => {
                if to == own.bare() {
                    self.presence_update(&own, &el);
                } else {
                    self.presence_track(&own, &to, &el);
                }
            }
            "iq" | "message" => {
                if self.privacy_allow(&own, &to, &el) {
                    self.deps.router.route(&own, &to, &el);
                } else {
                    let reply = make_error_reply(
                        &el,
                        stanza_error_with_text(
                            StanzaErrorCondition::NotAcceptable,
                            "Rejected by the recipient's privacy policy",
                        ),
                    );
                    let flow = self.send_element(&reply).await;
                    return (C2sState::SessionEstablished, flow);
                }
            }
            _ => {}
        }

        (C2sState::SessionEstablished, Flow::Continue)
    }

    /// Presence directed at the session's own bare JID: a status update.
    fn presence_update(&mut self, own: &Jid, packet: &Element) {
        match packet.attr("type").unwrap_or("") {
            "unavailable" => {
                let targets: Vec<Jid> = self.pres_a.union(&self.pres_i).cloned().collect();
                for peer in &targets {
                    self.deps.router.route(own, peer, packet);
                }
                if let Some(sid) = self.sid {
                    self.deps.sm.set_priority(sid, 0);
                }
                self.pres_last = None;
                self.pres_last_at = None;
                self.pres_invis = false;
                self.pres_a.clear();
                self.pres_i.clear();
            }
            "invisible" => {
                if !self.pres_invis {
                    let targets: Vec<Jid> = self.pres_a.union(&self.pres_i).cloned().collect();
                    for peer in &targets {
                        self.deps.router.route(own, peer, packet);
                    }
                    self.pres_a.clear();
                    self.pres_i.clear();
                    self.pres_invis = true;
                    self.pres_last = None;
                    self.pres_last_at = None;
                    self.presence_broadcast_first(own, packet);
                }
            }
            "error" | "probe" | "subscribe" | "subscribed" | "unsubscribe" | "unsubscribed" => {
                // Subscription traffic directed at oneself carries no state.
            }
            _ => {
                let priority = presence_priority(packet);
                let old_priority = self
                    .pres_last
                    .as_ref()
                    .map(presence_priority)
                    .unwrap_or(0);
                let from_unavailable = self.pres_last.is_none() || self.pres_invis;

                if let Some(sid) = self.sid {
                    self.deps.sm.set_priority(sid, priority);
                }
                self.pres_invis = false;
                self.pres_last = Some(packet.clone());
                self.pres_last_at = Some(SystemTime::now());

                if from_unavailable {
                    self.presence_broadcast_first(own, packet);
                } else {
                    let targets: Vec<Jid> =
                        self.pres_f.intersection(&self.pres_a).cloned().collect();
                    for peer in &targets {
                        self.deps.router.route(own, peer, packet);
                    }
                }

                if old_priority < 0 && priority >= 0 {
                    self.resend_offline_messages();
                }
            }
        }
    }

    /// The transition out of unavailability: probe everyone we watch, then
    /// (unless invisible) show ourselves to everyone allowed to watch us.
    fn presence_broadcast_first(&mut self, own: &Jid, packet: &Element) {
        let probe = Element::new("presence").attr_set("type", "probe");
        let watch_targets: Vec<Jid> = self.pres_t.iter().cloned().collect();
        for peer in &watch_targets {
            self.deps.router.route(own, peer, &probe);
        }
        if !self.pres_invis {
            let watchers: Vec<Jid> = self.pres_f.iter().cloned().collect();
            for peer in watchers {
                if self.privacy_allow(own, &peer, packet) {
                    self.deps.router.route(own, &peer, packet);
                    self.pres_a.insert(peer);
                }
            }
        }
    }

    /// Presence directed at another JID: track who sees us.
    fn presence_track(&mut self, own: &Jid, to: &Jid, packet: &Element) {
        match packet.attr("type").unwrap_or("") {
            "unavailable" => {
                self.privacy_route(own, to, packet);
                self.pres_i.remove(to);
                self.pres_a.remove(to);
            }
            "invisible" => {
                self.privacy_route(own, to, packet);
                self.pres_i.insert(to.clone());
                self.pres_a.remove(to);
            }
            "subscribe" | "subscribed" | "unsubscribe" | "unsubscribed" => {
                // Roster subscription bookkeeping is an external concern; the
                // stanza itself goes out from the bare JID.
                let bare = own.bare();
                self.privacy_route(&bare, to, packet);
            }
            "error" | "probe" => {
                self.privacy_route(own, to, packet);
            }
            _ => {
                self.privacy_route(own, to, packet);
                self.pres_a.insert(to.clone());
                self.pres_i.remove(to);
            }
        }
    }

    fn privacy_route(&mut self, from: &Jid, to: &Jid, packet: &Element) {
        if self.privacy_allow(from, to, packet) {
            self.deps.router.route(from, to, packet);
        } else {
            let reply = make_error_reply(
                packet,
                stanza_error_with_text(
                    StanzaErrorCondition::NotAcceptable,
                    "Rejected by the recipient's privacy policy",
                ),
            );
            self.socket.send_async(reply.to_xml().into_bytes());
        }
    }

    /// Privacy lists are an external concern; the default policy allows.
    fn privacy_allow(&self, _from: &Jid, _to: &Jid, _packet: &Element) -> bool {
        true
    }

    /// Offline storage is an external concern; nothing to resend without it.
    fn resend_offline_messages(&mut self) {
        debug!("no offline store configured, nothing to resend");
    }

    // ------------------------------------------------------------------
    // Routed delivery
    // ------------------------------------------------------------------

    async fn handle_routed(&mut self, packet: RoutedPacket) {
        if !matches!(self.state, C2sState::SessionEstablished) {
            debug!("dropping routed stanza before session establishment");
            return;
        }
        let RoutedPacket { from, to, stanza } = packet;

        // Presence probes are answered from the last broadcast presence
        // instead of reaching the client.
        if stanza.name() == "presence" && stanza.attr("type") == Some("probe") {
            self.answer_presence_probe(&from);
            return;
        }

        let fixed = replace_from_to(&from.to_string(), &to.to_string(), &stanza);
        let _ = self.send_element(&fixed).await;
    }

    fn answer_presence_probe(&mut self, prober: &Jid) {
        let Some(own) = self.jid.clone() else {
            return;
        };
        if self.pres_invis {
            return;
        }
        let Some(last) = self.pres_last.clone() else {
            return;
        };
        debug!(prober = %prober, broadcast_at = ?self.pres_last_at, "answering presence probe");
        if self.privacy_allow(&own, prober, &last) {
            self.deps.router.route(&own, prober, &last);
        }
    }

    // ------------------------------------------------------------------
    // Output helpers
    // ------------------------------------------------------------------

    async fn send_text(&mut self, text: &str) -> Flow {
        match self.socket.send(text.as_bytes().to_vec()).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                debug!(error = %e, "socket write failed");
                Flow::Stop
            }
        }
    }

    async fn send_element(&mut self, el: &Element) -> Flow {
        self.send_text(&el.to_xml()).await
    }

    async fn send_default_header(&mut self) -> Flow {
        let host = self.deps.config.hosts.first().cloned().unwrap_or_default();
        let header = stream_header(&self.stream_id, &host, "", "");
        self.send_text(&header).await
    }

    async fn stream_error_and_stop(&mut self, condition: &str) -> Flow {
        let text = format!("{}{}", stream_error(condition).to_xml(), STREAM_TRAILER);
        let _ = self.send_text(&text).await;
        Flow::Stop
    }
}

/// The `<priority>` child as an integer; absent or non-numeric counts as 0.
fn presence_priority(packet: &Element) -> i32 {
    packet
        .get_child("priority")
        .and_then(|p| p.text().trim().parse().ok())
        .unwrap_or(0)
}

/// The legacy digest: lowercase hex of `SHA1(streamid ‖ password)`.
fn legacy_auth_digest(stream_id: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Base64-decode a SASL payload; `=` denotes an empty initial response.
fn decode_sasl_payload(text: &str) -> Result<Vec<u8>, ()> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD.decode(trimmed).map_err(|_| ())
}

/// Error reply that never echoes credential sub-trees: children of any
/// `jabber:iq:auth` payload are removed.
fn sanitized_error_reply(el: &Element, error: Element) -> Element {
    let mut sanitized = el.clone();
    for child in sanitized.children_mut() {
        if child.attr("xmlns") == Some(ns::AUTH) {
            child.clear_children();
        }
    }
    make_error_reply(&sanitized, error)
}

/// Seconds since the Unix epoch, for generated resource names.
fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
