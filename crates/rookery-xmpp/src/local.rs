//! Local host handler.
//!
//! Registered as the route for every served host. Stanzas addressed to a
//! bare host dispatch into the IQ-handler table keyed by `(xmlns, host)`;
//! stanzas addressed to a user delegate to the session manager.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::auth::AuthBackend;
use crate::error::StanzaErrorCondition;
use crate::jid::Jid;
use crate::process::{self, Mailbox};
use crate::router::{RoutedPacket, RouteShortcut, Router};
use crate::session::SessionManager;
use crate::stanza::{iq_query_info, make_error_reply, stanza_error, IqQuery};
use crate::xml::Element;

/// Handler for IQ requests addressed to a served host. Returns the reply to
/// route back to the sender, or `None` to stay silent.
pub type IqHandler = Arc<dyn Fn(&Jid, &Jid, &Element) -> Option<Element> + Send + Sync>;

/// Delivery endpoint for locally-served domains.
pub struct LocalHandler<A> {
    router: Arc<Router>,
    sm: Arc<SessionManager<A>>,
    iq_handlers: DashMap<(String, String), IqHandler>,
}

impl<A: AuthBackend> LocalHandler<A> {
    /// Create the handler over the shared routing fabric.
    pub fn new(router: Arc<Router>, sm: Arc<SessionManager<A>>) -> Arc<Self> {
        Arc::new(Self {
            router,
            sm,
            iq_handlers: DashMap::new(),
        })
    }

    /// Install an IQ handler for a payload namespace on a host.
    pub fn register_iq_handler(&self, xmlns: &str, host: &str, handler: IqHandler) {
        self.iq_handlers
            .insert((xmlns.to_string(), host.to_string()), handler);
    }

    /// Remove an IQ handler. No-op if absent.
    pub fn unregister_iq_handler(&self, xmlns: &str, host: &str) {
        self.iq_handlers
            .remove(&(xmlns.to_string(), host.to_string()));
    }

    /// Become the route for a served host: spawn the host's delivery process
    /// and install the in-process shortcut that skips the mailbox hop.
    pub fn register_host(this: &Arc<Self>, domain: &str) {
        let mailbox_handler = Arc::clone(this);
        let pid = process::spawn(move |_, mut mailbox: Mailbox<RoutedPacket>| async move {
            while let Some(packet) = mailbox.receive().await {
                mailbox_handler.route(&packet.from, &packet.to, &packet.stanza);
            }
            Ok(())
        });

        let shortcut_handler = Arc::clone(this);
        let shortcut: RouteShortcut = Arc::new(move |from, to, packet| {
            shortcut_handler.route(from, to, packet);
            Ok(())
        });

        this.router.register_route(domain, pid, Some(shortcut));
    }

    /// Deliver a stanza addressed to this host's domain.
    #[instrument(skip(self, packet), fields(from = %from, to = %to, stanza = packet.name()))]
    pub fn route(&self, from: &Jid, to: &Jid, packet: &Element) {
        if !to.luser().is_empty() {
            self.sm.route(from, to, packet);
            return;
        }
        if !to.lresource().is_empty() {
            debug!("dropping stanza addressed to a host resource");
            return;
        }
        match packet.name() {
            "iq" => self.process_iq(from, to, packet),
            other => debug!(stanza = other, "dropping non-IQ stanza addressed to host"),
        }
    }

    fn process_iq(&self, from: &Jid, to: &Jid, packet: &Element) {
        match iq_query_info(packet) {
            IqQuery::Request { xmlns, .. } => {
                let handler = self
                    .iq_handlers
                    .get(&(xmlns.clone(), to.lserver().to_string()))
                    .map(|entry| Arc::clone(entry.value()));
                match handler {
                    Some(handler) => {
                        if let Some(reply) = handler(from, to, packet) {
                            self.router.route(to, from, &reply);
                        }
                    }
                    None => {
                        debug!(xmlns = %xmlns, "no IQ handler for namespace");
                        let err = make_error_reply(
                            packet,
                            stanza_error(StanzaErrorCondition::ServiceUnavailable),
                        );
                        self.router.route(to, from, &err);
                    }
                }
            }
            IqQuery::Reply(_) => debug!("dropping IQ reply addressed to host"),
            IqQuery::Invalid | IqQuery::NotIq => debug!("dropping invalid IQ addressed to host"),
        }
    }
}
