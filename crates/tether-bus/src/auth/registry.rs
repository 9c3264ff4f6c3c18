//! Name-to-constructor registry for authentication mechanisms.

use crate::auth::mechanism::AuthMechanism;
use crate::error::{BusError, BusResult};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Builds a fresh mechanism instance for one conversation.
///
/// Credentials (such as a pre-shared secret) are captured by the
/// closure at registration time.
pub type MechanismCtor = Box<dyn Fn() -> Box<dyn AuthMechanism> + Send + Sync>;

/// Registry of available authentication mechanisms.
///
/// Held as ordinary instance state on the bus context; nothing here is
/// process-global. Preference order comes from the caller's name list,
/// not from registration order.
#[derive(Default)]
pub struct AuthRegistry {
    ctors: RwLock<HashMap<String, MechanismCtor>>,
}

impl AuthRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ctor` under `name`, replacing any previous entry.
    pub fn register(&self, name: &str, ctor: MechanismCtor) {
        debug!(mechanism = name, "registering auth mechanism");
        self.ctors.write().unwrap().insert(name.to_string(), ctor);
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.ctors.read().unwrap().contains_key(name)
    }

    /// Build a fresh instance of the mechanism registered under `name`.
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Box<dyn AuthMechanism>> {
        self.ctors.read().unwrap().get(name).map(|ctor| ctor())
    }

    /// Parse a space-separated preference list, requiring every name to
    /// be registered.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidMechanism`] naming the first unknown
    /// mechanism; an empty list is [`BusError::NoAuthMechanism`].
    pub fn check_names(&self, names: &str) -> BusResult<Vec<String>> {
        let ctors = self.ctors.read().unwrap();
        let mut out = Vec::new();
        for name in names.split_whitespace() {
            if !ctors.contains_key(name) {
                return Err(BusError::InvalidMechanism(name.to_string().into()));
            }
            out.push(name.to_string());
        }
        if out.is_empty() {
            return Err(BusError::NoAuthMechanism);
        }
        Ok(out)
    }

    /// The registered subset of `names`, preference order preserved.
    #[must_use]
    pub fn filter(&self, names: &[String]) -> Vec<String> {
        let ctors = self.ctors.read().unwrap();
        names
            .iter()
            .filter(|name| ctors.contains_key(name.as_str()))
            .cloned()
            .collect()
    }
}
