//! JID (Jabber ID) handling.
//!
//! A JID addresses a principal and optional endpoint as
//! `[user@]server[/resource]`. Each part is kept in both its raw form (as the
//! peer wrote it, used when printing) and its canonical form after the
//! matching stringprep profile (nodeprep, nameprep, resourceprep), used for
//! every comparison, table key and routing decision.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::XmppError;

/// A parsed JID with raw and canonicalised forms.
#[derive(Debug, Clone)]
pub struct Jid {
    user: String,
    server: String,
    resource: String,
    luser: String,
    lserver: String,
    lresource: String,
}

impl Jid {
    /// Build a JID from raw parts, applying stringprep to each.
    ///
    /// `user` and `resource` may be empty; `server` must survive nameprep
    /// non-empty.
    pub fn new(user: &str, server: &str, resource: &str) -> Result<Self, XmppError> {
        let luser = nodeprep(user)?;
        let lserver = nameprep(server)?;
        if lserver.is_empty() {
            return Err(XmppError::jid("empty server part"));
        }
        let lresource = resourceprep(resource)?;
        Ok(Self {
            user: user.to_string(),
            server: server.to_string(),
            resource: resource.to_string(),
            luser,
            lserver,
            lresource,
        })
    }

    /// Raw user part (may be empty).
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Raw server part.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Raw resource part (may be empty).
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Canonical (nodeprepped) user part.
    pub fn luser(&self) -> &str {
        &self.luser
    }

    /// Canonical (nameprepped) server part.
    pub fn lserver(&self) -> &str {
        &self.lserver
    }

    /// Canonical (resourceprepped) resource part.
    pub fn lresource(&self) -> &str {
        &self.lresource
    }

    /// Whether this JID carries no resource.
    pub fn is_bare(&self) -> bool {
        self.resource.is_empty() && self.lresource.is_empty()
    }

    /// The bare form of this JID (resource removed).
    pub fn bare(&self) -> Jid {
        Jid {
            user: self.user.clone(),
            server: self.server.clone(),
            resource: String::new(),
            luser: self.luser.clone(),
            lserver: self.lserver.clone(),
            lresource: String::new(),
        }
    }

    /// The canonical `(user, server, resource)` triple.
    pub fn usr(&self) -> (String, String, String) {
        (
            self.luser.clone(),
            self.lserver.clone(),
            self.lresource.clone(),
        )
    }

    /// Whether two JIDs name the same bare principal.
    pub fn same_bare(&self, other: &Jid) -> bool {
        self.luser == other.luser && self.lserver == other.lserver
    }
}

impl FromStr for Jid {
    type Err = XmppError;

    /// Parse the textual form `[user@]server[/resource]`.
    ///
    /// Fails on a leading `@` or `/`, an `@` with an empty local part, a
    /// second `@` before the resource separator, an empty server part, and a
    /// `/` with nothing after it.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(XmppError::jid("empty JID"));
        }
        if s.starts_with('@') || s.starts_with('/') {
            return Err(XmppError::jid(s));
        }

        let (head, resource) = match s.find('/') {
            Some(pos) => {
                let resource = &s[pos + 1..];
                if resource.is_empty() {
                    return Err(XmppError::jid(s));
                }
                (&s[..pos], resource)
            }
            None => (s, ""),
        };

        let (user, server) = match head.find('@') {
            Some(pos) => {
                let user = &head[..pos];
                let server = &head[pos + 1..];
                if user.is_empty() || server.is_empty() || server.contains('@') {
                    return Err(XmppError::jid(s));
                }
                (user, server)
            }
            None => ("", head),
        };

        Jid::new(user, server, resource)
    }
}

impl fmt::Display for Jid {
    /// Print the raw wire form `[user@]server[/resource]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.user.is_empty() {
            write!(f, "{}@", self.user)?;
        }
        write!(f, "{}", self.server)?;
        if !self.resource.is_empty() {
            write!(f, "/{}", self.resource)?;
        }
        Ok(())
    }
}

impl PartialEq for Jid {
    fn eq(&self, other: &Self) -> bool {
        self.luser == other.luser
            && self.lserver == other.lserver
            && self.lresource == other.lresource
    }
}

impl Eq for Jid {}

impl Hash for Jid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.luser.hash(state);
        self.lserver.hash(state);
        self.lresource.hash(state);
    }
}

impl PartialOrd for Jid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Jid {
    /// Lexicographic ordering on the canonical triple.
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.luser, &self.lserver, &self.lresource).cmp(&(
            &other.luser,
            &other.lserver,
            &other.lresource,
        ))
    }
}

/// Apply the nodeprep profile to a user part.
pub fn nodeprep(s: &str) -> Result<String, XmppError> {
    if s.is_empty() {
        return Ok(String::new());
    }
    stringprep::nodeprep(s)
        .map(|c| c.into_owned())
        .map_err(|_| XmppError::jid(format!("nodeprep failed: {}", s)))
}

/// Apply the nameprep profile to a server part.
pub fn nameprep(s: &str) -> Result<String, XmppError> {
    if s.is_empty() {
        return Ok(String::new());
    }
    stringprep::nameprep(s)
        .map(|c| c.into_owned())
        .map_err(|_| XmppError::jid(format!("nameprep failed: {}", s)))
}

/// Apply the resourceprep profile to a resource part.
pub fn resourceprep(s: &str) -> Result<String, XmppError> {
    if s.is_empty() {
        return Ok(String::new());
    }
    stringprep::resourceprep(s)
        .map(|c| c.into_owned())
        .map_err(|_| XmppError::jid(format!("resourceprep failed: {}", s)))
}
