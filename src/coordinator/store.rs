//! Catalog store
//!
//! Four durable tables, all keyed by document id so every write is an upsert
//! or a delete and re-applying a batch is harmless:
//! - operations: operation id → operation record
//! - collections: namespace → collection entry
//! - chunks: (collection uuid, range min) → partition range
//! - zones: (namespace, range min) → zone
//!
//! `CatalogStore::apply` commits a whole `WriteBatch` atomically.

use crate::common::{Error, Result};
use crate::coordinator::record::{
    ChunkEntry, CollectionEntry, OperationId, OperationRecord, ZoneEntry,
};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

const CF_OPERATIONS: &str = "operations";
const CF_COLLECTIONS: &str = "collections";
const CF_CHUNKS: &str = "chunks";
const CF_ZONES: &str = "zones";

/// A single document write
#[derive(Debug, Clone)]
pub enum CatalogWrite {
    PutOperation(OperationRecord),
    DeleteOperation(OperationId),
    PutCollection(CollectionEntry),
    DeleteCollection(String),
    PutChunk(ChunkEntry),
    DeleteChunk { collection_uuid: Uuid, min: String },
    PutZone(ZoneEntry),
    DeleteZone { namespace: String, min: String },
}

/// Writes applied as one unit
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<CatalogWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: CatalogWrite) -> &mut Self {
        self.writes.push(write);
        self
    }

    pub fn put_operation(&mut self, record: OperationRecord) -> &mut Self {
        self.push(CatalogWrite::PutOperation(record))
    }

    pub fn put_collection(&mut self, entry: CollectionEntry) -> &mut Self {
        self.push(CatalogWrite::PutCollection(entry))
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[CatalogWrite] {
        &self.writes
    }
}

/// Durable catalog used by the coordinator
pub trait CatalogStore: Send + Sync {
    /// Apply every write in `batch` or none of them
    fn apply(&self, batch: WriteBatch) -> Result<()>;

    fn get_operation(&self, id: &OperationId) -> Result<Option<OperationRecord>>;

    fn list_operations(&self) -> Result<Vec<OperationRecord>>;

    fn get_collection(&self, namespace: &str) -> Result<Option<CollectionEntry>>;

    /// Chunks of one collection ordered by range min
    fn list_chunks(&self, collection_uuid: &Uuid) -> Result<Vec<ChunkEntry>>;

    /// Zones of one namespace ordered by range min
    fn list_zones(&self, namespace: &str) -> Result<Vec<ZoneEntry>>;
}

fn chunk_key(collection_uuid: &Uuid, min: &str) -> String {
    format!("{}\0{}", collection_uuid, min)
}

fn zone_key(namespace: &str, min: &str) -> String {
    format!("{}\0{}", namespace, min)
}

// === In-memory backend ===

#[derive(Debug, Default)]
struct Tables {
    operations: BTreeMap<OperationId, OperationRecord>,
    collections: BTreeMap<String, CollectionEntry>,
    chunks: BTreeMap<String, ChunkEntry>,
    zones: BTreeMap<String, ZoneEntry>,
}

/// In-memory catalog; a batch is applied under one lock
#[derive(Debug, Default)]
pub struct MemCatalogStore {
    tables: Mutex<Tables>,
    fail_next: AtomicUsize,
    batches_applied: AtomicUsize,
}

impl MemCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` batches fail with a transient error
    pub fn inject_write_failures(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of batches committed so far
    pub fn batches_applied(&self) -> usize {
        self.batches_applied.load(Ordering::SeqCst)
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Internal("catalog lock poisoned".into()))
    }
}

impl CatalogStore for MemCatalogStore {
    fn apply(&self, batch: WriteBatch) -> Result<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::StoreUnavailable("injected write failure".into()));
        }

        let mut tables = self.tables()?;
        for write in batch.writes {
            match write {
                CatalogWrite::PutOperation(record) => {
                    tables.operations.insert(record.operation_id, record);
                }
                CatalogWrite::DeleteOperation(id) => {
                    tables.operations.remove(&id);
                }
                CatalogWrite::PutCollection(entry) => {
                    tables.collections.insert(entry.namespace.clone(), entry);
                }
                CatalogWrite::DeleteCollection(namespace) => {
                    tables.collections.remove(&namespace);
                }
                CatalogWrite::PutChunk(chunk) => {
                    tables
                        .chunks
                        .insert(chunk_key(&chunk.collection_uuid, &chunk.min), chunk);
                }
                CatalogWrite::DeleteChunk {
                    collection_uuid,
                    min,
                } => {
                    tables.chunks.remove(&chunk_key(&collection_uuid, &min));
                }
                CatalogWrite::PutZone(zone) => {
                    tables.zones.insert(zone_key(&zone.namespace, &zone.min), zone);
                }
                CatalogWrite::DeleteZone { namespace, min } => {
                    tables.zones.remove(&zone_key(&namespace, &min));
                }
            }
        }
        self.batches_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_operation(&self, id: &OperationId) -> Result<Option<OperationRecord>> {
        Ok(self.tables()?.operations.get(id).cloned())
    }

    fn list_operations(&self) -> Result<Vec<OperationRecord>> {
        Ok(self.tables()?.operations.values().cloned().collect())
    }

    fn get_collection(&self, namespace: &str) -> Result<Option<CollectionEntry>> {
        Ok(self.tables()?.collections.get(namespace).cloned())
    }

    fn list_chunks(&self, collection_uuid: &Uuid) -> Result<Vec<ChunkEntry>> {
        let prefix = chunk_key(collection_uuid, "");
        Ok(self
            .tables()?
            .chunks
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn list_zones(&self, namespace: &str) -> Result<Vec<ZoneEntry>> {
        let prefix = zone_key(namespace, "");
        Ok(self
            .tables()?
            .zones
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }
}

// === RocksDB backend ===

/// Catalog persisted in RocksDB, one column family per table
pub struct RocksCatalogStore {
    db: DB,
}

impl RocksCatalogStore {
    /// Open or create the catalog
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path,
            vec![CF_OPERATIONS, CF_COLLECTIONS, CF_CHUNKS, CF_ZONES],
        )?;

        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::MetadataCorrupted(format!("missing column family {}", name)))
    }

    fn get_decoded<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        key: &[u8],
    ) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => {
                let value = bincode::deserialize(&bytes)
                    .map_err(|e| Error::MetadataCorrupted(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan_prefix<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        prefix: &str,
    ) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );

        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            values.push(
                bincode::deserialize(&value)
                    .map_err(|e| Error::MetadataCorrupted(e.to_string()))?,
            );
        }
        Ok(values)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl CatalogStore for RocksCatalogStore {
    fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut wb = rocksdb::WriteBatch::default();
        for write in batch.writes {
            match write {
                CatalogWrite::PutOperation(record) => {
                    let value = bincode::serialize(&record)?;
                    wb.put_cf(
                        self.cf(CF_OPERATIONS)?,
                        record.operation_id.to_string(),
                        value,
                    );
                }
                CatalogWrite::DeleteOperation(id) => {
                    wb.delete_cf(self.cf(CF_OPERATIONS)?, id.to_string());
                }
                CatalogWrite::PutCollection(entry) => {
                    let value = bincode::serialize(&entry)?;
                    wb.put_cf(self.cf(CF_COLLECTIONS)?, entry.namespace.as_bytes(), value);
                }
                CatalogWrite::DeleteCollection(namespace) => {
                    wb.delete_cf(self.cf(CF_COLLECTIONS)?, namespace.as_bytes());
                }
                CatalogWrite::PutChunk(chunk) => {
                    let value = bincode::serialize(&chunk)?;
                    wb.put_cf(
                        self.cf(CF_CHUNKS)?,
                        chunk_key(&chunk.collection_uuid, &chunk.min),
                        value,
                    );
                }
                CatalogWrite::DeleteChunk {
                    collection_uuid,
                    min,
                } => {
                    wb.delete_cf(self.cf(CF_CHUNKS)?, chunk_key(&collection_uuid, &min));
                }
                CatalogWrite::PutZone(zone) => {
                    let value = bincode::serialize(&zone)?;
                    wb.put_cf(self.cf(CF_ZONES)?, zone_key(&zone.namespace, &zone.min), value);
                }
                CatalogWrite::DeleteZone { namespace, min } => {
                    wb.delete_cf(self.cf(CF_ZONES)?, zone_key(&namespace, &min));
                }
            }
        }
        self.db.write(wb)?;
        Ok(())
    }

    fn get_operation(&self, id: &OperationId) -> Result<Option<OperationRecord>> {
        self.get_decoded(CF_OPERATIONS, id.to_string().as_bytes())
    }

    fn list_operations(&self) -> Result<Vec<OperationRecord>> {
        self.scan_prefix(CF_OPERATIONS, "")
    }

    fn get_collection(&self, namespace: &str) -> Result<Option<CollectionEntry>> {
        self.get_decoded(CF_COLLECTIONS, namespace.as_bytes())
    }

    fn list_chunks(&self, collection_uuid: &Uuid) -> Result<Vec<ChunkEntry>> {
        self.scan_prefix(CF_CHUNKS, &chunk_key(collection_uuid, ""))
    }

    fn list_zones(&self, namespace: &str) -> Result<Vec<ZoneEntry>> {
        self.scan_prefix(CF_ZONES, &zone_key(namespace, ""))
    }
}
