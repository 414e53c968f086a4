//! Per-user pantry embedding cache.
//!
//! Each user owns a single slot holding the fingerprint of their most recent
//! pantry and its embedding. A repeated query with an unchanged pantry is
//! answered from the slot without calling the embedding provider.
//!
//! Slots live in a sharded map and each slot has its own async mutex, held
//! across the provider call. Requests for the same user are serialized;
//! requests for different users never wait on each other's provider calls.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use pantry_embeddings::Embedding;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

/// Separator placed between normalized pantry items before hashing.
pub const FINGERPRINT_DELIMITER: char = '\u{1f}';

/// Trim and lowercase each item, dropping empty ones. Order is kept.
pub fn normalize_pantry(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Text sent to the embedding provider for a pantry.
pub fn pantry_text(items: &[String]) -> String {
    normalize_pantry(items).join(" ")
}

/// Stable content hash of a pantry.
///
/// Item order is significant: `["egg", "milk"]` and `["milk", "egg"]`
/// fingerprint differently.
pub fn fingerprint(items: &[String]) -> String {
    let joined = normalize_pantry(items).join(&FINGERPRINT_DELIMITER.to_string());
    format!("{:x}", Sha256::digest(joined.as_bytes()))
}

#[derive(Debug, Clone)]
struct CachedPantry {
    fingerprint: String,
    embedding: Embedding,
}

struct UserSlot {
    /// Logical time of the last access, for eviction.
    last_used: AtomicU64,

    entry: Mutex<Option<CachedPantry>>,
}

impl UserSlot {
    fn new(tick: u64) -> Self {
        Self {
            last_used: AtomicU64::new(tick),
            entry: Mutex::new(None),
        }
    }

    fn touch(&self, tick: u64) {
        self.last_used.fetch_max(tick, Ordering::Relaxed);
    }
}

/// Single-slot-per-user cache of pantry embeddings.
pub struct QueryCache {
    slots: DashMap<String, Arc<UserSlot>>,

    /// Maximum number of user slots. Zero disables caching.
    max_users: usize,

    clock: AtomicU64,
}

impl QueryCache {
    /// Create a cache holding at most `max_users` slots.
    pub fn new(max_users: usize) -> Self {
        Self {
            slots: DashMap::new(),
            max_users,
            clock: AtomicU64::new(0),
        }
    }

    /// Return the cached embedding for this user's pantry, or compute it.
    ///
    /// Without a user id nothing is read or stored. A failed `compute` leaves
    /// the user's previous slot untouched and evicts no other user.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        user_id: Option<&str>,
        pantry_items: &[String],
        compute: F,
    ) -> std::result::Result<Embedding, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Embedding, E>>,
    {
        let Some(user_id) = user_id.filter(|_| self.max_users > 0) else {
            return compute().await;
        };

        let fingerprint = fingerprint(pantry_items);
        let slot = self.slot(user_id);
        let mut entry = slot.entry.lock().await;

        if let Some(cached) = entry.as_ref()
            && cached.fingerprint == fingerprint
        {
            debug!("Query cache hit for user {user_id}");
            return Ok(cached.embedding.clone());
        }

        debug!("Query cache miss for user {user_id}");
        let embedding = match compute().await {
            Ok(embedding) => embedding,
            Err(e) => {
                let was_empty = entry.is_none();
                drop(entry);
                if was_empty {
                    self.discard_empty(user_id, &slot);
                }
                return Err(e);
            }
        };

        *entry = Some(CachedPantry {
            fingerprint,
            embedding: embedding.clone(),
        });
        drop(entry);

        self.evict_over_capacity(user_id);
        Ok(embedding)
    }

    /// Fingerprint currently cached for a user.
    pub async fn cached_fingerprint(&self, user_id: &str) -> Option<String> {
        let slot = self.slots.get(user_id).map(|slot| Arc::clone(&slot))?;
        let entry = slot.entry.lock().await;
        entry.as_ref().map(|cached| cached.fingerprint.clone())
    }

    /// Drop a user's slot unless a request for that user is in flight.
    pub fn invalidate(&self, user_id: &str) {
        self.slots.remove_if(user_id, |_, slot| Arc::strong_count(slot) == 1);
    }

    /// Drop every slot not held by an in-flight request.
    pub fn clear(&self) {
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    /// Number of user slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if no user has a slot.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Configured slot limit.
    pub fn max_users(&self) -> usize {
        self.max_users
    }

    fn slot(&self, user_id: &str) -> Arc<UserSlot> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);

        if let Some(slot) = self.slots.get(user_id) {
            slot.touch(tick);
            return Arc::clone(&slot);
        }

        let slot = Arc::clone(
            self.slots
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(UserSlot::new(tick)))
                .value(),
        );
        slot.touch(tick);
        slot
    }

    /// Remove a slot created for a request that stored nothing, unless
    /// another request for the same user is holding it.
    fn discard_empty(&self, user_id: &str, slot: &Arc<UserSlot>) {
        // One reference in the map, one held by the caller.
        self.slots.remove_if(user_id, |_, current| {
            Arc::ptr_eq(current, slot)
                && Arc::strong_count(current) == 2
                && current.entry.try_lock().is_ok_and(|entry| entry.is_none())
        });
    }

    /// Remove least recently used idle slots until within `max_users`.
    ///
    /// A slot referenced by an in-flight request is never removed, so the
    /// map can briefly exceed `max_users` while such requests finish.
    fn evict_over_capacity(&self, keep: &str) {
        let mut attempts = self.slots.len();

        while self.slots.len() > self.max_users && attempts > 0 {
            attempts -= 1;

            let oldest = self
                .slots
                .iter()
                .filter(|slot| slot.key() != keep && Arc::strong_count(slot.value()) == 1)
                .min_by_key(|slot| slot.value().last_used.load(Ordering::Relaxed))
                .map(|slot| slot.key().clone());

            let Some(user_id) = oldest else {
                break;
            };

            // Re-checked under the shard lock: a request may have picked the
            // slot up since the scan.
            if self
                .slots
                .remove_if(&user_id, |_, slot| Arc::strong_count(slot) == 1)
                .is_some()
            {
                debug!("Evicted query cache slot for user {user_id}");
            }
        }
    }
}
