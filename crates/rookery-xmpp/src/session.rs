//! Session manager: the table of live client sessions and the stanza
//! dispatch among them.
//!
//! A session exists from resource binding's session establishment until its
//! connection terminates. The primary table maps session ids to records; a
//! secondary index by canonical `(user, server)` answers both full-JID and
//! bare-JID lookups. Delivery to a session is a message send to the owning
//! connection process; the tables themselves are concurrent maps.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument, warn};

use crate::auth::AuthBackend;
use crate::c2s::C2sMsg;
use crate::error::StanzaErrorCondition;
use crate::jid::Jid;
use crate::process::{Pid, ProcessId};
use crate::router::{RoutedPacket, Router};
use crate::stanza::{iq_query_info, make_error_reply, stanza_error, IqQuery};
use crate::xml::Element;

static NEXT_SESSION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a session: a monotonic sequence number paired with the
/// owning process. Ordering on the pair decides collisions — the newest
/// session wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId {
    seq: u64,
    owner: ProcessId,
}

impl SessionId {
    /// Allocate the next session id for a connection process.
    pub fn next(owner: ProcessId) -> Self {
        Self {
            seq: NEXT_SESSION_SEQ.fetch_add(1, Ordering::Relaxed),
            owner,
        }
    }

    /// The owning process.
    pub fn owner(&self) -> ProcessId {
        self.owner
    }
}

/// Opaque per-session connection details.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Peer address of the client connection
    pub ip: Option<SocketAddr>,
}

/// One live session.
#[derive(Clone)]
pub struct SessionRecord {
    /// Session id
    pub sid: SessionId,
    /// Mailbox of the owning connection process
    pub pid: Pid<C2sMsg>,
    /// Canonical (user, server, resource)
    pub usr: (String, String, String),
    /// Presence priority last advertised by the session
    pub priority: i32,
    /// Opaque connection info
    pub info: SessionInfo,
}

/// Hook receiving messages for users with no positive-priority session.
pub type OfflineHandler = Arc<dyn Fn(&Jid, &Jid, &Element) + Send + Sync>;

/// The session manager.
pub struct SessionManager<A> {
    sessions: DashMap<SessionId, SessionRecord>,
    by_us: DashMap<(String, String), Vec<(String, SessionId)>>,
    router: Arc<Router>,
    auth: Arc<A>,
    offline: Option<OfflineHandler>,
    max_user_sessions: usize,
}

impl<A: AuthBackend> SessionManager<A> {
    /// Create a session manager.
    pub fn new(
        router: Arc<Router>,
        auth: Arc<A>,
        offline: Option<OfflineHandler>,
        max_user_sessions: usize,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            by_us: DashMap::new(),
            router,
            auth,
            offline,
            max_user_sessions,
        }
    }

    /// Cap on concurrent sessions for one account.
    fn max_user_sessions(&self, _user: &str, _server: &str) -> usize {
        self.max_user_sessions
    }

    /// Record a new session.
    ///
    /// Duplicate `(user, server, resource)` sessions are resolved by session
    /// id: the newest survives, every other holder is asked to terminate
    /// with a `replaced` hint. If the account then exceeds its session cap,
    /// the oldest session is evicted the same way.
    #[instrument(skip(self, pid, info))]
    pub fn open_session(
        &self,
        sid: SessionId,
        pid: Pid<C2sMsg>,
        user: &str,
        server: &str,
        resource: &str,
        priority: i32,
        info: SessionInfo,
    ) {
        let record = SessionRecord {
            sid,
            pid,
            usr: (user.to_string(), server.to_string(), resource.to_string()),
            priority,
            info,
        };
        self.sessions.insert(sid, record);
        self.by_us
            .entry((user.to_string(), server.to_string()))
            .or_default()
            .push((resource.to_string(), sid));

        // Same full JID: everyone but the newest gets replaced.
        let colliding = self.find_sids_by_usr(user, server, resource);
        if let Some(&survivor) = colliding.iter().max() {
            for sid in colliding {
                if sid != survivor {
                    self.send_replaced(sid);
                }
            }
        }

        // Account over its cap: evict the oldest.
        let all = self.find_sids_by_us(user, server);
        if all.len() > self.max_user_sessions(user, server) {
            if let Some(&oldest) = all.iter().min() {
                self.send_replaced(oldest);
            }
        }
    }

    fn send_replaced(&self, sid: SessionId) {
        if let Some(record) = self.sessions.get(&sid) {
            debug!(session = ?sid, "session replaced");
            if let Err(e) = record.pid.send(C2sMsg::Replaced) {
                warn!(error = %e, "failed to deliver replaced hint");
            }
        }
    }

    /// Remove a session. Dangling ids are tolerated.
    pub fn close_session(&self, sid: SessionId) {
        let Some((_, record)) = self.sessions.remove(&sid) else {
            return;
        };
        let (user, server, _) = record.usr;
        if let Some(mut entry) = self.by_us.get_mut(&(user.clone(), server.clone())) {
            entry.retain(|(_, entry_sid)| *entry_sid != sid);
            let emptied = entry.is_empty();
            drop(entry);
            if emptied {
                self.by_us
                    .remove_if(&(user, server), |_, entries| entries.is_empty());
            }
        }
    }

    /// Rewrite the presence priority of an open session.
    pub fn set_priority(&self, sid: SessionId, priority: i32) {
        if let Some(mut record) = self.sessions.get_mut(&sid) {
            record.priority = priority;
        }
    }

    /// Session ids bound to an exact `(user, server, resource)`.
    pub fn find_sids_by_usr(&self, user: &str, server: &str, resource: &str) -> Vec<SessionId> {
        self.by_us
            .get(&(user.to_string(), server.to_string()))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(r, _)| r == resource)
                    .map(|(_, sid)| *sid)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Session ids of every resource of `(user, server)`.
    pub fn find_sids_by_us(&self, user: &str, server: &str) -> Vec<SessionId> {
        self.by_us
            .get(&(user.to_string(), server.to_string()))
            .map(|entries| entries.iter().map(|(_, sid)| *sid).collect())
            .unwrap_or_default()
    }

    /// Number of open sessions (all users).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn record(&self, sid: SessionId) -> Option<SessionRecord> {
        self.sessions.get(&sid).map(|r| r.clone())
    }

    /// The stanza entry point for locally-served user targets.
    #[instrument(skip(self, packet), fields(from = %from, to = %to, stanza = packet.name()))]
    pub fn route(&self, from: &Jid, to: &Jid, packet: &Element) {
        let (user, server, resource) = to.usr();
        if resource.is_empty() {
            self.route_bare(from, to, packet, &user, &server);
        } else {
            self.route_full(from, to, packet, &user, &server, &resource);
        }
    }

    fn route_bare(&self, from: &Jid, to: &Jid, packet: &Element, user: &str, server: &str) {
        match packet.name() {
            "presence" => {
                // Presence to the bare JID fans out to every live resource;
                // the receiving connection re-targets it to its full JID.
                for sid in self.find_sids_by_us(user, server) {
                    self.deliver(sid, from, to, packet);
                }
            }
            "broadcast" => {
                // Once per live resource, addressed to the full JID.
                for sid in self.find_sids_by_us(user, server) {
                    if let Some(record) = self.record(sid) {
                        match Jid::new(user, server, &record.usr.2) {
                            Ok(full) => self.deliver(sid, from, &full, packet),
                            Err(e) => warn!(error = %e, "skipping broadcast target"),
                        }
                    }
                }
            }
            "message" => self.route_message_bare(from, to, packet, user, server),
            "iq" => match iq_query_info(packet) {
                IqQuery::Request { .. } => {
                    // SM-level IQ handlers are an external concern; with none
                    // registered every request bounces.
                    self.bounce(from, to, packet, StanzaErrorCondition::ServiceUnavailable);
                }
                IqQuery::Reply(_) => debug!("dropping IQ reply to bare JID"),
                IqQuery::Invalid | IqQuery::NotIq => debug!("dropping invalid IQ to bare JID"),
            },
            other => debug!(stanza = other, "dropping unroutable stanza"),
        }
    }

    fn route_message_bare(
        &self,
        from: &Jid,
        to: &Jid,
        packet: &Element,
        user: &str,
        server: &str,
    ) {
        let sessions: Vec<SessionRecord> = self
            .find_sids_by_us(user, server)
            .into_iter()
            .filter_map(|sid| self.record(sid))
            .collect();
        let max_priority = sessions.iter().map(|r| r.priority).max();

        match max_priority {
            Some(max) if max >= 0 => {
                for record in sessions.iter().filter(|r| r.priority == max) {
                    self.deliver(record.sid, from, to, packet);
                }
            }
            _ => self.message_to_unavailable(from, to, packet),
        }
    }

    /// Policy for a message with no positive-priority recipient session.
    fn message_to_unavailable(&self, from: &Jid, to: &Jid, packet: &Element) {
        match packet.attr("type").unwrap_or("") {
            "error" => debug!("dropping error message to unavailable user"),
            "groupchat" | "headline" => {
                self.bounce(from, to, packet, StanzaErrorCondition::ServiceUnavailable)
            }
            _ => {
                // Whether the account exists decides between offline storage
                // and a bounce; the backend lookup may suspend, so finish on
                // a separate task.
                let auth = Arc::clone(&self.auth);
                let router = Arc::clone(&self.router);
                let offline = self.offline.clone();
                let from = from.clone();
                let to = to.clone();
                let packet = packet.clone();
                tokio::spawn(async move {
                    let exists = auth.user_exists(to.luser(), to.lserver()).await;
                    match (exists, offline) {
                        (true, Some(handler)) => handler(&from, &to, &packet),
                        _ => {
                            let err = make_error_reply(
                                &packet,
                                stanza_error(StanzaErrorCondition::ServiceUnavailable),
                            );
                            router.route(&to, &from, &err);
                        }
                    }
                });
            }
        }
    }

    fn route_full(
        &self,
        from: &Jid,
        to: &Jid,
        packet: &Element,
        user: &str,
        server: &str,
        resource: &str,
    ) {
        let sids = self.find_sids_by_usr(user, server, resource);
        match sids.iter().max() {
            Some(&sid) => self.deliver(sid, from, to, packet),
            None => match packet.name() {
                "message" => self.message_to_unavailable(from, to, packet),
                "iq" => match iq_query_info(packet) {
                    IqQuery::Request { .. } => {
                        self.bounce(from, to, packet, StanzaErrorCondition::ServiceUnavailable)
                    }
                    _ => debug!("dropping IQ reply to missing resource"),
                },
                other => debug!(stanza = other, "dropping stanza to missing resource"),
            },
        }
    }

    fn deliver(&self, sid: SessionId, from: &Jid, to: &Jid, packet: &Element) {
        let Some(record) = self.record(sid) else {
            return;
        };
        let result = record.pid.send(C2sMsg::Route(RoutedPacket {
            from: from.clone(),
            to: to.clone(),
            stanza: packet.clone(),
        }));
        if let Err(e) = result {
            warn!(error = %e, session = ?sid, "session delivery failed");
        }
    }

    fn bounce(&self, from: &Jid, to: &Jid, packet: &Element, condition: StanzaErrorCondition) {
        let err = make_error_reply(packet, stanza_error(condition));
        self.router.route(to, from, &err);
    }
}
