//! Repository seam between the orchestrator and whatever persists records.

use crate::error::{ReflectaError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

/// A persisted record with a string id and a partial-update type.
pub trait Record: Clone + Send + Sync + 'static {
    type Patch: Send + 'static;

    /// Name used in `RecordNotFound` errors.
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn apply(&mut self, patch: Self::Patch);
}

/// The four operations the engine needs from a document store.
#[async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<R>>;

    async fn add(&self, record: R) -> Result<()>;

    /// # Errors
    /// `ReflectaError::RecordNotFound` if no record has this id.
    async fn update(&self, id: &str, patch: R::Patch) -> Result<()>;

    /// Removing a missing record is not an error.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// In-memory store for tests and embedding without a database.
pub struct MemoryStore<R> {
    records: RwLock<HashMap<String, R>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl<R: Record> MemoryStore<R> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Seed the store.
    pub fn with_records(records: impl IntoIterator<Item = R>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.write().unwrap_or_else(PoisonError::into_inner);
            for record in records {
                map.insert(record.id().to_string(), record);
            }
        }
        store
    }

    /// Make every subsequent write fail, like a full disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Current copy of a record, without going through the async trait.
    pub fn snapshot(&self, id: &str) -> Option<R> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(ReflectaError::Persistence {
                message: format!("{} store is read-only", R::KIND),
            });
        }
        Ok(())
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::AcqRel);
    }
}

impl<R: Record> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for MemoryStore<R> {
    async fn get(&self, id: &str) -> Result<Option<R>> {
        Ok(self.snapshot(id))
    }

    async fn add(&self, record: R) -> Result<()> {
        self.check_writable()?;
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(record.id()) {
            return Err(ReflectaError::Persistence {
                message: format!("{} {} already exists", R::KIND, record.id()),
            });
        }
        records.insert(record.id().to_string(), record);
        self.record_write();
        Ok(())
    }

    async fn update(&self, id: &str, patch: R::Patch) -> Result<()> {
        self.check_writable()?;
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(id)
            .ok_or_else(|| ReflectaError::RecordNotFound {
                kind: R::KIND,
                id: id.to_string(),
            })?;
        record.apply(patch);
        self.record_write();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.remove(id).is_some() {
            self.record_write();
        }
        Ok(())
    }
}
