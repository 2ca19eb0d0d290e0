//! Disk-backed storage: the in-memory backend plus a write-behind journal.
//!
//! Every sealed blob is appended to one journal file per key under the
//! configured directory, so an operator can recover recent interactions from
//! disk after the process exits. Drains truncate the journal (the blobs were
//! delivered), removal and TTL eviction delete it. Journals are never read
//! back into the ring: retention stays bounded by the in-memory rules.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{Drained, InteractionStorage, MemoryStorage};
use crate::correlation::LiveIdView;
use crate::error::StorageError;
use crate::metrics::CacheStats;

pub struct DiskStorage {
    mem: MemoryStorage,
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: PathBuf, ring_capacity: usize, ttl: Duration) -> Result<Self, StorageError> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            mem: MemoryStorage::new(ring_capacity, ttl),
            root,
        })
    }

    fn journal_path(&self, id: &str) -> PathBuf {
        // literal channel keys may hold dots or arbitrary operator tokens
        let safe: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe}.journal"))
    }

    fn append_line(&self, id: &str, line: &str) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path(id))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn drop_journal(&self, id: &str) {
        if let Err(err) = fs::remove_file(self.journal_path(id)) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(id, %err, "could not remove interaction journal");
            }
        }
    }
}

impl InteractionStorage for DiskStorage {
    fn register(
        &self,
        correlation_id: &str,
        secret: &str,
        public_key_pem: &str,
    ) -> Result<(), StorageError> {
        self.mem.register(correlation_id, secret, public_key_pem)
    }

    fn add_interaction(&self, correlation_id: &str, blob: &[u8]) -> Result<(), StorageError> {
        match self.mem.add_interaction_sealed(correlation_id, blob)? {
            Some(sealed) => self.append_line(correlation_id, &sealed),
            None => Ok(()),
        }
    }

    fn add_interaction_with_id(&self, id: &str, blob: &[u8]) -> Result<(), StorageError> {
        self.mem.add_interaction_with_id(id, blob)?;
        self.append_line(id, &String::from_utf8_lossy(blob))
    }

    fn get_interactions(
        &self,
        correlation_id: &str,
        secret: &str,
    ) -> Result<Drained, StorageError> {
        let drained = self.mem.get_interactions(correlation_id, secret)?;
        self.drop_journal(correlation_id);
        Ok(drained)
    }

    fn get_interactions_with_id(&self, id: &str) -> Result<Vec<String>, StorageError> {
        let data = self.mem.get_interactions_with_id(id)?;
        if !data.is_empty() {
            self.drop_journal(id);
        }
        Ok(data)
    }

    fn remove_id(&self, correlation_id: &str, secret: &str) -> Result<(), StorageError> {
        self.mem.remove_id(correlation_id, secret)?;
        self.drop_journal(correlation_id);
        Ok(())
    }

    fn evict_expired(&self) -> usize {
        let expired = self.mem.evict_expired_entries();
        for id in &expired {
            self.drop_journal(id);
        }
        expired.len() + self.mem.evict_expired_channels()
    }

    fn flush(&self) -> Result<(), StorageError> {
        // appends go straight to the journal files; nothing is buffered here
        Ok(())
    }

    fn live_ids(&self) -> Arc<dyn LiveIdView> {
        self.mem.live_ids()
    }

    fn stats(&self) -> CacheStats {
        self.mem.stats()
    }
}
