//! LRU caches for decoded blocks and open table files
//!
//! [`Cache`] is the shareable block cache handed to databases through
//! [`Options::block_cache`](crate::Options). [`TableCache`] bounds the number
//! of open table files; an evicted table is closed once its last reader lets
//! go and transparently reopened on next use.

use crate::iterator::{EmptyIterator, InternalIterator};
use crate::options::ReadOptions;
use crate::sstable::{Block, Table};
use crate::types::InternalKeyComparator;
use crate::version::filename::table_file_name;
use crate::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Byte-charged LRU map, internally synchronized
pub struct LruCache<K, V> {
    inner: Mutex<LruInner<K, V>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct LruInner<K, V> {
    map: HashMap<K, LruEntry<V>>,
    /// Recency tick → key; the smallest tick is the least recently used
    order: BTreeMap<u64, K>,
    tick: u64,
    usage: usize,
}

struct LruEntry<V> {
    value: V,
    charge: usize,
    tick: u64,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
                usage: 0,
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a value. Promotes the entry to MRU on hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        match inner.map.get_mut(key) {
            Some(entry) => {
                inner.order.remove(&entry.tick);
                entry.tick = tick;
                inner.order.insert(tick, key.clone());
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a value, evicting LRU entries to stay within capacity.
    /// Entries larger than the entire cache capacity are not cached.
    pub fn insert(&self, key: K, value: V, charge: usize) {
        if charge > self.capacity {
            return;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(old) = inner.map.remove(&key) {
            inner.order.remove(&old.tick);
            inner.usage -= old.charge;
        }

        while inner.usage + charge > self.capacity {
            let Some((_, victim)) = inner.order.pop_first() else { break };
            if let Some(evicted) = inner.map.remove(&victim) {
                inner.usage -= evicted.charge;
            }
        }

        inner.tick += 1;
        let tick = inner.tick;
        inner.order.insert(tick, key.clone());
        inner.map.insert(key, LruEntry { value, charge, tick });
        inner.usage += charge;
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let entry = inner.map.remove(key)?;
        inner.order.remove(&entry.tick);
        inner.usage -= entry.charge;
        Some(entry.value)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sum of the charges of cached entries
    pub fn usage(&self) -> usize {
        self.inner.lock().usage
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Shared LRU cache of decoded table blocks, keyed by (table id, block offset)
pub struct Cache {
    blocks: LruCache<(u64, u64), Arc<Block>>,
    next_id: AtomicU64,
}

impl Cache {
    /// LRU cache holding up to `capacity` bytes of blocks
    pub fn new_lru(capacity: usize) -> Self {
        Self {
            blocks: LruCache::new(capacity),
            next_id: AtomicU64::new(1),
        }
    }

    /// Identity for a newly opened table, unique within this cache
    pub fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.blocks.capacity()
    }

    pub fn usage(&self) -> usize {
        self.blocks.usage()
    }

    pub fn hits(&self) -> u64 {
        self.blocks.hits()
    }

    pub fn misses(&self) -> u64 {
        self.blocks.misses()
    }

    pub(crate) fn lookup(&self, key: &(u64, u64)) -> Option<Arc<Block>> {
        self.blocks.get(key)
    }

    pub(crate) fn insert(&self, key: (u64, u64), block: Arc<Block>) {
        let charge = block.size();
        self.blocks.insert(key, block, charge);
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("capacity", &self.capacity())
            .field("usage", &self.usage())
            .finish()
    }
}

/// Bounded set of open tables keyed by file number
pub struct TableCache {
    dbname: PathBuf,
    icmp: InternalKeyComparator,
    block_cache: Option<Arc<Cache>>,
    tables: LruCache<u64, Arc<Table>>,
}

impl TableCache {
    pub fn new(
        dbname: impl Into<PathBuf>,
        icmp: InternalKeyComparator,
        block_cache: Option<Arc<Cache>>,
        entries: usize,
    ) -> Self {
        Self {
            dbname: dbname.into(),
            icmp,
            block_cache,
            tables: LruCache::new(entries.max(1)),
        }
    }

    /// Open table `number`, or return it from the cache
    pub fn find_table(&self, number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.get(&number) {
            return Ok(table);
        }
        let path = table_file_name(&self.dbname, number);
        let table = Arc::new(Table::open(
            path,
            file_size,
            self.icmp.clone(),
            self.block_cache.clone(),
        )?);
        self.tables.insert(number, table.clone(), 1);
        Ok(table)
    }

    /// See [`Table::get`]
    pub fn get(
        &self,
        options: &ReadOptions,
        number: u64,
        file_size: u64,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.find_table(number, file_size)?.get(options, key)
    }

    /// Iterator over table `number`; open failures surface through `status()`
    pub fn iter(&self, options: &ReadOptions, number: u64, file_size: u64) -> Box<dyn InternalIterator> {
        match self.find_table(number, file_size) {
            Ok(table) => table.iter(options),
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        }
    }

    /// Drop a table that is being deleted
    pub fn evict(&self, number: u64) {
        self.tables.remove(&number);
    }

    /// Number of tables currently held open by the cache
    pub fn open_tables(&self) -> usize {
        self.tables.len()
    }
}
