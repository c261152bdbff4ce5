//! Authentication backend contract.
//!
//! The endpoint core never stores credentials; it asks a backend through
//! this trait. Lookups may suspend (a real backend talks to storage), so the
//! methods return futures. The crate ships an in-memory implementation used
//! by the daemon's default configuration and by the tests.

use std::future::Future;

use dashmap::DashMap;

/// Password store / verifier consulted during SASL and legacy auth.
///
/// Each check returns the name of the backend module that accepted the
/// credentials, or `None` on rejection.
pub trait AuthBackend: Send + Sync + 'static {
    /// Verify a plaintext password.
    fn check_password(
        &self,
        user: &str,
        server: &str,
        password: &str,
    ) -> impl Future<Output = Option<String>> + Send;

    /// Verify either a plaintext password or a digest over the stored one.
    ///
    /// `digest_fn` maps a stored password to the digest the client should
    /// have produced; it is used when `digest` is non-empty.
    fn check_password_digest(
        &self,
        user: &str,
        server: &str,
        password: &str,
        digest: &str,
        digest_fn: impl Fn(&str) -> String + Send,
    ) -> impl Future<Output = Option<String>> + Send;

    /// Fetch the stored password, with the owning module name.
    fn get_password(
        &self,
        user: &str,
        server: &str,
    ) -> impl Future<Output = Option<(String, String)>> + Send;

    /// Whether an account exists at all.
    fn user_exists(&self, user: &str, server: &str) -> impl Future<Output = bool> + Send;
}

/// Module name reported by [`InMemoryAuthBackend`].
const INTERNAL_MODULE: &str = "internal";

/// Credential store backed by a concurrent map. Suitable for tests and
/// single-node deployments without external storage.
#[derive(Debug, Default)]
pub struct InMemoryAuthBackend {
    passwords: DashMap<(String, String), String>,
}

impl InMemoryAuthBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an account.
    pub fn add_user(&self, user: &str, server: &str, password: &str) {
        self.passwords
            .insert((user.to_string(), server.to_string()), password.to_string());
    }

    /// Remove an account.
    pub fn remove_user(&self, user: &str, server: &str) {
        self.passwords
            .remove(&(user.to_string(), server.to_string()));
    }

    fn lookup(&self, user: &str, server: &str) -> Option<String> {
        self.passwords
            .get(&(user.to_string(), server.to_string()))
            .map(|entry| entry.value().clone())
    }
}

impl AuthBackend for InMemoryAuthBackend {
    fn check_password(
        &self,
        user: &str,
        server: &str,
        password: &str,
    ) -> impl Future<Output = Option<String>> + Send {
        let accepted = !password.is_empty()
            && self.lookup(user, server).as_deref() == Some(password);
        async move { accepted.then(|| INTERNAL_MODULE.to_string()) }
    }

    fn check_password_digest(
        &self,
        user: &str,
        server: &str,
        password: &str,
        digest: &str,
        digest_fn: impl Fn(&str) -> String + Send,
    ) -> impl Future<Output = Option<String>> + Send {
        let accepted = match self.lookup(user, server) {
            Some(stored) => {
                if !digest.is_empty() {
                    digest_fn(&stored).eq_ignore_ascii_case(digest)
                } else {
                    !password.is_empty() && stored == password
                }
            }
            None => false,
        };
        async move { accepted.then(|| INTERNAL_MODULE.to_string()) }
    }

    fn get_password(
        &self,
        user: &str,
        server: &str,
    ) -> impl Future<Output = Option<(String, String)>> + Send {
        let found = self
            .lookup(user, server)
            .map(|password| (password, INTERNAL_MODULE.to_string()));
        async move { found }
    }

    fn user_exists(&self, user: &str, server: &str) -> impl Future<Output = bool> + Send {
        let exists = self
            .passwords
            .contains_key(&(user.to_string(), server.to_string()));
        async move { exists }
    }
}
