use std::path::PathBuf;

use log::info;
use parking_lot::RwLock;

use crate::{
    error::Error,
    index::{HashIndex, Index},
    key::{Key, TableId},
    region::{Region, Span, CACHE_LINE},
    slab::{RawTuple, Slab},
};

/// Declares one data table: fixed tuple size and a capacity bound.
#[derive(Clone, Copy, Debug)]
pub struct TableSchema {
    pub tuple_size: u32,
    pub max_tuples: u32,
}

/// Storage manager configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Backing file of the modeled NVM region; anonymous mapping when `None`.
    pub path: Option<PathBuf>,
    /// Bytes reserved for the log span (bitmap + page array).
    pub log_bytes: usize,
    /// Size of the engine's per-tuple header, colocated in front of the
    /// payload in each slot.
    pub header_size: u32,
    /// Reserve a version slab per table (multi-version engines).
    pub with_versions: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            log_bytes: 4 << 20,
            header_size: 0,
            with_versions: false,
        }
    }
}

type Teardown<T> = Box<dyn Fn(&T) + Send + Sync>;

struct TableStore<T> {
    schema: TableSchema,
    slab: Slab,
    versions: Option<Slab>,
    index: Box<dyn Index<T>>,
}

/// The storage manager: one NVM region carved into per-table data slabs,
/// optional version slabs, and the log span; plus the primary indexes.
///
/// `T` is the engine's index entry type, a small `Copy` record pointing at
/// the tuple's header and payload.
pub struct Store<T: Copy> {
    _region: Region,
    tables: Vec<TableStore<T>>,
    log_span: Span,
    teardown: RwLock<Option<Teardown<T>>>,
}

impl<T: Copy + Send + Sync + 'static> Store<T> {
    /// Carve up a region for `schemas` with hash indexes.
    pub fn open(config: &StoreConfig, schemas: &[TableSchema]) -> Result<Self, Error> {
        Self::open_with_indexes(config, schemas, |_| Box::new(HashIndex::new()))
    }

    /// As [`Store::open`], with a caller-supplied index per table.
    pub fn open_with_indexes(
        config: &StoreConfig,
        schemas: &[TableSchema],
        mut make_index: impl FnMut(&TableSchema) -> Box<dyn Index<T>>,
    ) -> Result<Self, Error> {
        let mut total = 0usize;
        for schema in schemas {
            if schema.tuple_size == 0 || schema.max_tuples == 0 {
                return Err(Error::EmptySchema);
            }
            total += Slab::required_bytes(config.header_size, schema.tuple_size, schema.max_tuples);
            if config.with_versions {
                total += Slab::required_bytes(0, schema.tuple_size, schema.max_tuples);
            }
        }
        let log_bytes = config.log_bytes.div_ceil(CACHE_LINE) * CACHE_LINE;
        total += log_bytes;

        let region = match &config.path {
            Some(path) => Region::open(path, total)?,
            None => Region::anonymous(total)?,
        };
        info!(
            "mapped {} byte region for {} tables ({} byte log span)",
            total,
            schemas.len(),
            log_bytes
        );

        let mut cursor = region.span();
        let mut tables = Vec::with_capacity(schemas.len());
        for schema in schemas {
            let data_bytes = Slab::required_bytes(config.header_size, schema.tuple_size, schema.max_tuples);
            let (data_span, rest) = cursor.split_at(data_bytes);
            cursor = rest;
            let slab = Slab::new(data_span, config.header_size, schema.tuple_size, schema.max_tuples);

            let versions = config.with_versions.then(|| {
                let bytes = Slab::required_bytes(0, schema.tuple_size, schema.max_tuples);
                let (span, rest) = cursor.split_at(bytes);
                cursor = rest;
                Slab::new(span, 0, schema.tuple_size, schema.max_tuples)
            });

            tables.push(TableStore {
                schema: *schema,
                slab,
                versions,
                index: make_index(schema),
            });
        }
        let log_span = cursor.slice(0, log_bytes);

        Ok(Self {
            _region: region,
            tables,
            log_span,
            teardown: RwLock::new(None),
        })
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn schema(&self, table: TableId) -> &TableSchema {
        &self.tables[table.idx()].schema
    }

    /// The byte span reserved for log pages.
    pub fn log_span(&self) -> Span {
        self.log_span
    }

    /// Engine hook invoked for each index entry still live when the store is
    /// dropped, so engine-owned DRAM hanging off the entries is released.
    pub fn register_teardown(&self, f: impl Fn(&T) + Send + Sync + 'static) {
        *self.teardown.write() = Some(Box::new(f));
    }

    pub fn insert_index(&self, key: Key, entry: T) -> bool {
        self.tables[key.table.idx()].index.insert(key.row, entry)
    }

    pub fn read_index(&self, key: Key) -> Option<T> {
        self.tables.get(key.table.idx())?.index.get(key.row)
    }

    pub fn delete_index(&self, key: Key) -> bool {
        self.tables[key.table.idx()].index.remove(key.row)
    }

    pub fn alloc_tuple(&self, table: TableId) -> Option<RawTuple> {
        self.tables[table.idx()].slab.alloc()
    }

    pub fn free_tuple(&self, table: TableId, tuple: RawTuple) {
        self.tables[table.idx()].slab.free(tuple)
    }

    pub fn alloc_version(&self, table: TableId) -> Option<Span> {
        let versions = self.tables[table.idx()].versions.as_ref();
        versions.expect("table registered without version slab").alloc().map(|t| t.data)
    }

    pub fn free_version(&self, table: TableId, data: Span) {
        let versions = self.tables[table.idx()].versions.as_ref();
        let slab = versions.expect("table registered without version slab");
        slab.free(RawTuple { header: data, data });
    }

    /// Visit every slot of a table's data slab (recovery data phase).
    pub fn scan_table(&self, table: TableId, f: impl FnMut(u32, RawTuple)) {
        self.tables[table.idx()].slab.scan(f)
    }

    /// Reset a table's allocation state from the liveness of its headers.
    pub fn rebuild_table(&self, table: TableId, live: impl Fn(u32) -> bool) {
        self.tables[table.idx()].slab.rebuild(live)
    }
}

impl<T: Copy> Drop for Store<T> {
    fn drop(&mut self) {
        let teardown = self.teardown.get_mut().take();
        if let Some(teardown) = teardown {
            for table in &self.tables {
                table.index.for_each(&mut |_, entry| teardown(entry));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn schemas() -> Vec<TableSchema> {
        vec![
            TableSchema {
                tuple_size: 64,
                max_tuples: 32,
            },
            TableSchema {
                tuple_size: 128,
                max_tuples: 16,
            },
        ]
    }

    #[test]
    fn layout_and_index_roundtrip() {
        let config = StoreConfig {
            header_size: 24,
            log_bytes: 1 << 16,
            ..StoreConfig::default()
        };
        let store: Store<u64> = Store::open(&config, &schemas()).unwrap();

        assert_eq!(store.table_count(), 2);
        assert_eq!(store.log_span().len(), 1 << 16);

        let key = Key::new(TableId(1), 77);
        assert!(store.insert_index(key, 42));
        assert!(!store.insert_index(key, 43));
        assert_eq!(store.read_index(key), Some(42));
        assert!(store.delete_index(key));
        assert_eq!(store.read_index(key), None);

        let tuple = store.alloc_tuple(TableId(0)).unwrap();
        assert_eq!(tuple.header.len(), 24);
        assert_eq!(tuple.data.len(), 64);
        store.free_tuple(TableId(0), tuple);
    }

    #[test]
    fn version_slab_reserved_on_demand() {
        let config = StoreConfig {
            header_size: 8,
            with_versions: true,
            log_bytes: 1 << 12,
            ..StoreConfig::default()
        };
        let store: Store<u64> = Store::open(&config, &schemas()).unwrap();
        let v = store.alloc_version(TableId(0)).unwrap();
        assert_eq!(v.len(), 64);
        store.free_version(TableId(0), v);
        assert!(store.alloc_version(TableId(0)).is_some());
    }

    #[test]
    fn teardown_runs_for_live_entries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let config = StoreConfig {
            header_size: 8,
            ..StoreConfig::default()
        };
        let store: Store<u64> = Store::open(&config, &schemas()).unwrap();
        let counted = hits.clone();
        store.register_teardown(move |_| {
            counted.fetch_add(1, Ordering::Relaxed);
        });
        store.insert_index(Key::new(TableId(0), 1), 1);
        store.insert_index(Key::new(TableId(0), 2), 2);
        drop(store);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }
}
