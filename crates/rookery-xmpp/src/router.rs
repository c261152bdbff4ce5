//! Domain routing table.
//!
//! Maps a canonical server name to the handler responsible for it: a process
//! mailbox, optionally short-circuited by an in-process function so local
//! delivery avoids a mailbox hop. Each served domain registers itself at
//! startup from the component that owns it; lookups are concurrent and see
//! the latest committed mapping.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument, warn};

use crate::jid::Jid;
use crate::process::Pid;
use crate::xml::Element;
use crate::XmppError;

/// A stanza in flight between components.
#[derive(Debug)]
pub struct RoutedPacket {
    /// Sender address
    pub from: Jid,
    /// Recipient address
    pub to: Jid,
    /// The stanza itself
    pub stanza: Element,
}

/// In-process delivery shortcut invoked synchronously on a route hit.
pub type RouteShortcut =
    Arc<dyn Fn(&Jid, &Jid, &Element) -> Result<(), XmppError> + Send + Sync>;

struct Route {
    pid: Pid<RoutedPacket>,
    shortcut: Option<RouteShortcut>,
}

/// The routing table. A domain has at most one route.
pub struct Router {
    routes: DashMap<String, Route>,
}

impl Router {
    /// Create an empty routing table.
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    /// Register a handler for a domain, replacing any previous one.
    pub fn register_route(
        &self,
        domain: &str,
        pid: Pid<RoutedPacket>,
        shortcut: Option<RouteShortcut>,
    ) {
        debug!(domain, process = %pid.id(), "registering route");
        self.routes
            .insert(domain.to_string(), Route { pid, shortcut });
    }

    /// Remove a domain's route if it is still owned by `pid`. No-op when the
    /// domain is absent or owned by someone else.
    pub fn unregister_route(&self, domain: &str, pid: &Pid<RoutedPacket>) {
        self.routes
            .remove_if(domain, |_, route| route.pid.id() == pid.id());
    }

    /// Whether a domain is served locally.
    pub fn has_route(&self, domain: &str) -> bool {
        self.routes.contains_key(domain)
    }

    /// Route a stanza towards `to`.
    ///
    /// A handler failure is logged and swallowed; routing must never tear
    /// down the router or the caller.
    #[instrument(skip(self, packet), fields(from = %from, to = %to, stanza = packet.name()))]
    pub fn route(&self, from: &Jid, to: &Jid, packet: &Element) {
        // Clone the handler out of the table before invoking it: a shortcut
        // may legitimately re-enter the router (bounces).
        let handler = self
            .routes
            .get(to.lserver())
            .map(|route| (route.pid.clone(), route.shortcut.clone()));

        match handler {
            Some((_, Some(shortcut))) => {
                if let Err(e) = shortcut(from, to, packet) {
                    warn!(error = %e, "route shortcut failed");
                }
            }
            Some((pid, None)) => {
                if let Err(e) = pid.send(RoutedPacket {
                    from: from.clone(),
                    to: to.clone(),
                    stanza: packet.clone(),
                }) {
                    warn!(error = %e, process = %pid.id(), "route delivery failed");
                }
            }
            None => s2s_route(from, to, packet),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-to-server fallback. Federation is a stub: the packet is logged
/// and dropped.
fn s2s_route(from: &Jid, to: &Jid, packet: &Element) {
    warn!(
        from = %from,
        to = %to,
        stanza = packet.name(),
        "no route for domain and federation is not available, dropping"
    );
}
