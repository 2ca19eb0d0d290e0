//! In-memory storage: the default backend.
//!
//! A coarse read-write lock guards the registry maps (create, remove,
//! lookup); each entry carries its own mutex so appends and drains on
//! different clients never contend. Entries expire a fixed interval after
//! their last touch; the sweep runs from a background task in `main`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use subtle::ConstantTimeEq;

use super::crypto;
use super::{Drained, InteractionStorage};
use crate::correlation::LiveIdView;
use crate::error::StorageError;
use crate::metrics::CacheStats;

pub const DEFAULT_RING_CAPACITY: usize = 5000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

struct ClientEntry {
    secret: String,
    session_key: [u8; crypto::SESSION_KEY_LEN],
    wrapped_key: String,
    ring: VecDeque<String>,
    deadline: Instant,
}

struct ChannelEntry {
    ring: VecDeque<String>,
    deadline: Instant,
}

struct Inner {
    entries: RwLock<HashMap<String, Arc<Mutex<ClientEntry>>>>,
    channels: RwLock<HashMap<String, Arc<Mutex<ChannelEntry>>>>,
    ring_capacity: usize,
    ttl: Duration,
    evictions: AtomicU64,
}

impl LiveIdView for Inner {
    fn contains(&self, correlation_id: &str) -> bool {
        read(&self.entries).contains_key(correlation_id)
    }
}

#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    pub fn new(ring_capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                ring_capacity,
                ttl,
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Append and return the sealed blob, or `None` when the id is unknown.
    /// The disk backend reuses the returned ciphertext for its journal.
    pub(crate) fn add_interaction_sealed(
        &self,
        correlation_id: &str,
        blob: &[u8],
    ) -> Result<Option<String>, StorageError> {
        let entry = match read(&self.inner.entries).get(correlation_id) {
            Some(entry) => Arc::clone(entry),
            None => {
                tracing::debug!(correlation_id, "dropping interaction for unknown id");
                return Ok(None);
            }
        };
        let mut entry = lock(&entry);
        let sealed = crypto::seal_blob(&entry.session_key, blob)?;
        if entry.ring.len() >= self.inner.ring_capacity {
            entry.ring.pop_front();
            self.inner.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entry.ring.push_back(sealed.clone());
        entry.deadline = Instant::now() + self.inner.ttl;
        Ok(Some(sealed))
    }

    /// Remove expired client entries, returning the evicted ids.
    pub(crate) fn evict_expired_entries(&self) -> Vec<String> {
        let now = Instant::now();
        let mut entries = write(&self.inner.entries);
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| lock(entry).deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        self.inner
            .evictions
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired
    }

    /// Remove expired literal-key channels, returning how many were dropped.
    pub(crate) fn evict_expired_channels(&self) -> usize {
        let now = Instant::now();
        let mut channels = write(&self.inner.channels);
        let before = channels.len();
        channels.retain(|_, channel| lock(channel).deadline > now);
        let removed = before - channels.len();
        self.inner
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY, DEFAULT_TTL)
    }
}

impl InteractionStorage for MemoryStorage {
    fn register(
        &self,
        correlation_id: &str,
        secret: &str,
        public_key_pem: &str,
    ) -> Result<(), StorageError> {
        if read(&self.inner.entries).contains_key(correlation_id) {
            return Err(StorageError::DuplicateId);
        }
        let session_key = crypto::generate_session_key();
        let wrapped_key = crypto::wrap_session_key(public_key_pem, &session_key)?;

        let mut entries = write(&self.inner.entries);
        if entries.contains_key(correlation_id) {
            return Err(StorageError::DuplicateId);
        }
        entries.insert(
            correlation_id.to_string(),
            Arc::new(Mutex::new(ClientEntry {
                secret: secret.to_string(),
                session_key,
                wrapped_key,
                ring: VecDeque::new(),
                deadline: Instant::now() + self.inner.ttl,
            })),
        );
        Ok(())
    }

    fn add_interaction(&self, correlation_id: &str, blob: &[u8]) -> Result<(), StorageError> {
        self.add_interaction_sealed(correlation_id, blob).map(|_| ())
    }

    fn add_interaction_with_id(&self, id: &str, blob: &[u8]) -> Result<(), StorageError> {
        let channel = {
            let channels = read(&self.inner.channels);
            channels.get(id).map(Arc::clone)
        };
        let channel = match channel {
            Some(channel) => channel,
            None => {
                let mut channels = write(&self.inner.channels);
                Arc::clone(channels.entry(id.to_string()).or_insert_with(|| {
                    Arc::new(Mutex::new(ChannelEntry {
                        ring: VecDeque::new(),
                        deadline: Instant::now() + self.inner.ttl,
                    }))
                }))
            }
        };
        let mut channel = lock(&channel);
        if channel.ring.len() >= self.inner.ring_capacity {
            channel.ring.pop_front();
            self.inner.evictions.fetch_add(1, Ordering::Relaxed);
        }
        channel
            .ring
            .push_back(String::from_utf8_lossy(blob).into_owned());
        channel.deadline = Instant::now() + self.inner.ttl;
        Ok(())
    }

    fn get_interactions(
        &self,
        correlation_id: &str,
        secret: &str,
    ) -> Result<Drained, StorageError> {
        let entry = read(&self.inner.entries)
            .get(correlation_id)
            .map(Arc::clone)
            .ok_or(StorageError::IdNotFound)?;
        let mut entry = lock(&entry);
        if !bool::from(entry.secret.as_bytes().ct_eq(secret.as_bytes())) {
            return Err(StorageError::WrongSecret);
        }
        let data: Vec<String> = entry.ring.drain(..).collect();
        entry.deadline = Instant::now() + self.inner.ttl;
        Ok(Drained {
            data,
            aes_key: entry.wrapped_key.clone(),
        })
    }

    fn get_interactions_with_id(&self, id: &str) -> Result<Vec<String>, StorageError> {
        let channel = match read(&self.inner.channels).get(id) {
            Some(channel) => Arc::clone(channel),
            None => return Ok(Vec::new()),
        };
        let mut channel = lock(&channel);
        let data = channel.ring.drain(..).collect();
        channel.deadline = Instant::now() + self.inner.ttl;
        Ok(data)
    }

    fn remove_id(&self, correlation_id: &str, secret: &str) -> Result<(), StorageError> {
        let mut entries = write(&self.inner.entries);
        let entry = entries.get(correlation_id).ok_or(StorageError::IdNotFound)?;
        if !bool::from(lock(entry).secret.as_bytes().ct_eq(secret.as_bytes())) {
            return Err(StorageError::WrongSecret);
        }
        entries.remove(correlation_id);
        Ok(())
    }

    fn evict_expired(&self) -> usize {
        self.evict_expired_entries().len() + self.evict_expired_channels()
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn live_ids(&self) -> Arc<dyn LiveIdView> {
        Arc::clone(&self.inner) as Arc<dyn LiveIdView>
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            live_entries: read(&self.inner.entries).len() as u64,
            live_channels: read(&self.inner.channels).len() as u64,
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }
}

// Poisoned locks are recovered rather than propagated: the maps hold no
// invariant a panicking appender could break mid-update.
fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
