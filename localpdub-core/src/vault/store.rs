//! Mutex-protected in-memory record store.
//!
//! All mutations are serialized through the store's operations; readers
//! receive snapshot copies. The sync engine operates on this store only
//! and never touches the vault file; the session coordinator is the
//! sole writer.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{VaultError, VaultResult};
use crate::sync::SyncStrategy;
use crate::types::{now_iso8601, Category, EntryDigest, Record, VaultDocument};

/// Outcome of applying incoming sync entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Records inserted because no local record had their id.
    pub inserted: usize,
    /// Records that replaced an existing local record.
    pub replaced: usize,
    /// Ids that collided with an existing local record.
    pub conflicts: Vec<String>,
}

/// In-memory record set behind a mutex.
///
/// A store is either open (holding a [`VaultDocument`]) or closed;
/// every operation on a closed store returns [`VaultError::NotOpen`].
pub struct RecordStore {
    inner: Mutex<Option<VaultDocument>>,
}

impl RecordStore {
    /// Creates a closed store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Installs a document, opening the store.
    pub fn load(&self, document: VaultDocument) {
        let mut inner = self.lock();
        *inner = Some(document);
    }

    /// Drops the in-memory document, closing the store.
    pub fn close(&self) {
        let mut inner = self.lock();
        *inner = None;
    }

    /// Returns true while a document is loaded.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Returns a snapshot of the full document, for saving.
    pub fn document(&self) -> VaultResult<VaultDocument> {
        self.with_doc(|doc| Ok(doc.clone()))
    }

    // =========================================================================
    // Record operations
    // =========================================================================

    /// Adds a record, assigning a fresh UUID and current timestamps.
    ///
    /// Returns the assigned id.
    pub fn add(&self, mut record: Record) -> VaultResult<String> {
        self.with_doc_mut(|doc| {
            record.id = uuid::Uuid::new_v4().to_string();
            record.created_at = crate::types::now_epoch();
            record.modified = record.created_at;
            let id = record.id.clone();
            doc.entries.push(record);
            Ok(id)
        })
    }

    /// Replaces the record with matching id, preserving `created_at`
    /// and refreshing `modified`.
    ///
    /// Returns false when no record matches.
    pub fn update(&self, id: &str, mut record: Record) -> VaultResult<bool> {
        self.with_doc_mut(|doc| {
            let Some(existing) = doc.entries.iter_mut().find(|e| e.id == id) else {
                return Ok(false);
            };
            record.id = existing.id.clone();
            record.created_at = existing.created_at;
            record.modified = existing.modified;
            record.touch();
            *existing = record;
            Ok(true)
        })
    }

    /// Deletes the record with matching id.
    ///
    /// Returns false when no record matches.
    pub fn delete(&self, id: &str) -> VaultResult<bool> {
        self.with_doc_mut(|doc| {
            let before = doc.entries.len();
            doc.entries.retain(|e| e.id != id);
            Ok(doc.entries.len() != before)
        })
    }

    /// Returns the record with matching id, if any.
    pub fn get(&self, id: &str) -> VaultResult<Option<Record>> {
        self.with_doc(|doc| Ok(doc.entries.iter().find(|e| e.id == id).cloned()))
    }

    /// Returns all records in insertion (display) order.
    pub fn list(&self) -> VaultResult<Vec<Record>> {
        self.with_doc(|doc| Ok(doc.entries.clone()))
    }

    /// Case-insensitive substring search over title, username, and URL.
    pub fn search(&self, query: &str) -> VaultResult<Vec<Record>> {
        let lowered = query.to_lowercase();
        self.with_doc(|doc| {
            Ok(doc
                .entries
                .iter()
                .filter(|e| e.matches_query(&lowered))
                .cloned()
                .collect())
        })
    }

    /// Installs a merged record set, used by sync.
    pub fn replace_all(&self, records: Vec<Record>) -> VaultResult<()> {
        self.with_doc_mut(|doc| {
            doc.entries = records;
            Ok(())
        })
    }

    /// Returns the number of records.
    pub fn entry_count(&self) -> VaultResult<usize> {
        self.with_doc(|doc| Ok(doc.entries.len()))
    }

    // =========================================================================
    // Category operations
    // =========================================================================

    /// Adds a category, assigning a fresh UUID. Returns the id.
    pub fn add_category(&self, mut category: Category) -> VaultResult<String> {
        self.with_doc_mut(|doc| {
            category.id = uuid::Uuid::new_v4().to_string();
            let id = category.id.clone();
            doc.categories.push(category);
            Ok(id)
        })
    }

    /// Replaces the category with matching id.
    pub fn update_category(&self, id: &str, mut category: Category) -> VaultResult<bool> {
        self.with_doc_mut(|doc| {
            let Some(existing) = doc.categories.iter_mut().find(|c| c.id == id) else {
                return Ok(false);
            };
            category.id = existing.id.clone();
            *existing = category;
            Ok(true)
        })
    }

    /// Removes the category with matching id.
    pub fn remove_category(&self, id: &str) -> VaultResult<bool> {
        self.with_doc_mut(|doc| {
            let before = doc.categories.len();
            doc.categories.retain(|c| c.id != id);
            Ok(doc.categories.len() != before)
        })
    }

    /// Returns all categories in insertion order.
    pub fn categories(&self) -> VaultResult<Vec<Category>> {
        self.with_doc(|doc| Ok(doc.categories.clone()))
    }

    // =========================================================================
    // Sync support
    // =========================================================================

    /// Computes the digest of every record.
    pub fn compute_digest(&self) -> VaultResult<Vec<EntryDigest>> {
        self.with_doc(|doc| doc.entries.iter().map(Record::digest).collect())
    }

    /// Returns full records for the given ids, in id-list order.
    pub fn records_by_id(&self, ids: &[String]) -> VaultResult<Vec<Record>> {
        self.with_doc(|doc| {
            let by_id: HashMap<&str, &Record> =
                doc.entries.iter().map(|e| (e.id.as_str(), e)).collect();
            Ok(ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).map(|e| (*e).clone()))
                .collect())
        })
    }

    /// Applies incoming sync entries under a conflict strategy.
    ///
    /// `Manual` mutates nothing and only reports the conflict list; all
    /// other strategies insert records whose id is new locally and
    /// resolve id collisions per the strategy. Conflict resolution
    /// depends only on `(id, modified)`, never on arrival order.
    pub fn apply_incoming(
        &self,
        entries: Vec<Record>,
        strategy: SyncStrategy,
    ) -> VaultResult<ApplyOutcome> {
        self.with_doc_mut(|doc| {
            let mut outcome = ApplyOutcome::default();

            for incoming in entries {
                if incoming.id.is_empty() {
                    log::debug!("dropping incoming entry without id");
                    continue;
                }

                let local_pos = doc.entries.iter().position(|e| e.id == incoming.id);
                let Some(pos) = local_pos else {
                    if strategy != SyncStrategy::Manual {
                        doc.entries.push(incoming);
                        outcome.inserted += 1;
                    }
                    continue;
                };

                outcome.conflicts.push(incoming.id.clone());
                match strategy {
                    SyncStrategy::Manual | SyncStrategy::LocalWins => {}
                    SyncStrategy::RemoteWins => {
                        doc.entries[pos] = incoming;
                        outcome.replaced += 1;
                    }
                    SyncStrategy::NewestWins => {
                        // Ties keep the local copy, which keeps the
                        // outcome identical on both peers.
                        if incoming.modified > doc.entries[pos].modified {
                            doc.entries[pos] = incoming;
                            outcome.replaced += 1;
                        }
                    }
                    SyncStrategy::Duplicate => {
                        let mut duplicate = incoming;
                        duplicate.id = uuid::Uuid::new_v4().to_string();
                        doc.entries.push(duplicate);
                        outcome.inserted += 1;
                    }
                }
            }

            Ok(outcome)
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<VaultDocument>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn with_doc<R>(
        &self,
        f: impl FnOnce(&VaultDocument) -> VaultResult<R>,
    ) -> VaultResult<R> {
        let inner = self.lock();
        let doc = inner.as_ref().ok_or(VaultError::NotOpen)?;
        f(doc)
    }

    fn with_doc_mut<R>(
        &self,
        f: impl FnOnce(&mut VaultDocument) -> VaultResult<R>,
    ) -> VaultResult<R> {
        let mut inner = self.lock();
        let doc = inner.as_mut().ok_or(VaultError::NotOpen)?;
        let result = f(doc)?;
        doc.metadata.entry_count =
            u32::try_from(doc.entries.len()).unwrap_or(u32::MAX);
        doc.metadata.modified_at = now_iso8601();
        Ok(result)
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}
