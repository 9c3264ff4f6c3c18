//! Header compression token table.
//!
//! Senders replace the compressible header fields of chatty messages
//! with a single u32 token; receivers expand the token back into the
//! original fields. Tokens are random nonzero u32s so two nodes never
//! accidentally agree on one by arithmetic. A receiver that does not
//! know a token yet asks the sender for the expansion and records it
//! here via [`CompressionTable::add_expansion`].
//!
//! The table is keyed both ways: canonical field bytes to token for the
//! send path and token to fields for the receive path. When full, the
//! least recently used entry is dropped.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use tether_crypto::random;

use crate::error::WireError;
use crate::header::HeaderFields;

/// Maximum number of expansions retained before eviction.
pub const MAX_EXPANSIONS: usize = 4096;

#[derive(Debug)]
struct Entry {
    fields: HeaderFields,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Inner {
    by_token: HashMap<u32, Entry>,
    by_fields: HashMap<Vec<u8>, u32>,
    tick: u64,
}

impl Inner {
    fn touch(&mut self, token: u32) {
        self.tick += 1;
        if let Some(entry) = self.by_token.get_mut(&token) {
            entry.last_used = self.tick;
        }
    }

    fn evict_lru(&mut self) {
        let Some((&victim, _)) = self
            .by_token
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
        else {
            return;
        };
        if let Some(entry) = self.by_token.remove(&victim) {
            self.by_fields.remove(&entry.fields.canonical_bytes());
            debug!(token = victim, "evicted compression token");
        }
    }

    fn insert(&mut self, token: u32, fields: HeaderFields, capacity: usize) {
        self.tick += 1;
        let key = fields.canonical_bytes();
        if self.by_token.len() >= capacity {
            self.evict_lru();
        }
        self.by_fields.entry(key).or_insert(token);
        self.by_token.insert(
            token,
            Entry {
                fields,
                last_used: self.tick,
            },
        );
    }
}

/// Two-way map between compressible header fields and tokens.
#[derive(Debug)]
pub struct CompressionTable {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl CompressionTable {
    /// Create a table holding up to [`MAX_EXPANSIONS`] entries.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MAX_EXPANSIONS)
    }

    /// Create a table with an explicit entry limit.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Token for `fields`, allocating a fresh one if none exists.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if random token generation fails.
    pub fn compress(&self, fields: &HeaderFields) -> Result<u32, WireError> {
        let key = fields.canonical_bytes();
        let mut inner = self.inner.lock().unwrap();
        if let Some(&token) = inner.by_fields.get(&key) {
            inner.touch(token);
            return Ok(token);
        }

        let mut token = random::random_nonzero_u32()?;
        while inner.by_token.contains_key(&token) {
            token = random::random_nonzero_u32()?;
        }
        debug!(token, "allocated compression token");
        inner.insert(token, fields.clone(), self.capacity);
        Ok(token)
    }

    /// Expansion for `token`, if known.
    #[must_use]
    pub fn expand(&self, token: u32) -> Option<HeaderFields> {
        let mut inner = self.inner.lock().unwrap();
        inner.touch(token);
        inner
            .by_token
            .get(&token)
            .map(|entry| entry.fields.clone())
    }

    /// Record an expansion learned from a peer.
    ///
    /// Token zero is reserved and ignored. A token already mapped to
    /// different fields keeps its existing mapping.
    pub fn add_expansion(&self, token: u32, fields: HeaderFields) {
        if token == 0 {
            warn!("ignoring reserved compression token 0");
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.by_token.get(&token) {
            if existing.fields != fields {
                warn!(token, "compression token collision, keeping existing expansion");
            }
            inner.touch(token);
            return;
        }
        inner.insert(token, fields, self.capacity);
    }

    /// Number of expansions currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_token.len()
    }

    /// Whether the table holds no expansions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CompressionTable {
    fn default() -> Self {
        Self::new()
    }
}
