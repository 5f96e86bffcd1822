//! Windowed, sweep-aged caching of parsed documents.
//!
//! Replaying a long period touches thousands of hourly consensuses, each
//! several megabytes once parsed. A [`WindowedCache`] keeps the documents a
//! caller is currently working through and lets the rest age out.
//!
//! # Eviction
//!
//! Every entry carries a TTL counter set to its initial value when the
//! document is loaded. Each [`WindowedCache::get_range`] call ends with one
//! sweep: every entry's TTL drops by one, whether or not it took part in the
//! query, and entries left at one or below are removed. A document that is
//! loaded once and never again therefore disappears after a fixed number of
//! range queries. Cache hits do not refresh the counter; only a reload does.
//!
//! # Lookahead
//!
//! When a range query misses, the cache also loads the documents for the
//! following `lookahead` hours so that the next adjacent query finds them.
//! Lookahead never changes what a query returns.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use relay_history::descriptor::cache::WindowedCache;
//! use relay_history::descriptor::{DocumentId, DocumentKind, RouterStatusRecord};
//! use relay_history::store::MemoryStore;
//!
//! # fn main() -> Result<(), relay_history::Error> {
//! let start = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
//! let end = Utc.with_ymd_and_hms(2024, 1, 15, 23, 0, 0).unwrap();
//!
//! let store = Arc::new(MemoryStore::new());
//! store.insert(&DocumentId::consensus(start), "network-status-version 3\n");
//!
//! let mut cache: WindowedCache<RouterStatusRecord> =
//!     WindowedCache::new(DocumentKind::Consensus, store.clone(), start, end);
//!
//! let documents = cache.get_range(start, start)?;
//! assert_eq!(documents.len(), 1);
//! assert_eq!(store.total_reads(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::{DocumentId, DocumentKind, ParsedDocument, Record};
use crate::store::DocumentStore;
use crate::util::{hours_between, months_between};
use crate::Error;

/// Initial TTL of a freshly loaded document.
pub const DEFAULT_TTL: u32 = 70;

/// Documents returned by a range query, in chronological order.
pub type DocumentMap<R> = BTreeMap<DocumentId, Arc<ParsedDocument<R>>>;

/// Statistics about cache performance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Requested entries that were already cached.
    pub hits: u64,
    /// Requested entries that had to be loaded.
    pub misses: u64,
    /// Entries loaded, including lookahead preloads.
    pub loads: u64,
    /// Entries removed by sweeps or capacity limits.
    pub evictions: u64,
}

impl CacheStats {
    /// Returns the cache hit rate as a percentage (0.0 to 100.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug)]
struct CacheEntry<R> {
    document: Arc<ParsedDocument<R>>,
    ttl: u32,
}

/// Cache of parsed documents of one kind over a fixed timespan.
///
/// Queries outside `[start, end]` fail with [`Error::OutOfRange`].
#[derive(Debug)]
pub struct WindowedCache<R> {
    kind: DocumentKind,
    store: Arc<dyn DocumentStore>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    lookahead: TimeDelta,
    initial_ttl: u32,
    entries: HashMap<DocumentId, CacheEntry<R>>,
    stats: CacheStats,
}

impl<R: Record> WindowedCache<R> {
    /// Creates an empty cache serving `kind` documents between `start` and
    /// `end`, with no lookahead and [`DEFAULT_TTL`].
    pub fn new(
        kind: DocumentKind,
        store: Arc<dyn DocumentStore>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            store,
            start,
            end,
            lookahead: TimeDelta::zero(),
            initial_ttl: DEFAULT_TTL,
            entries: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Preloads this many hours past the end of every query that misses.
    pub fn with_lookahead_hours(mut self, hours: u32) -> Self {
        self.lookahead = TimeDelta::hours(i64::from(hours));
        self
    }

    /// Sets the TTL given to loaded documents.
    pub fn with_initial_ttl(mut self, ttl: u32) -> Self {
        self.initial_ttl = ttl;
        self
    }

    /// Document kind served by this cache.
    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    /// The configured `(start, end)` timespan.
    pub fn timespan(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start, self.end)
    }

    /// Whether `time` falls within the configured timespan.
    pub fn covers(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time <= self.end
    }

    /// The storage collaborator documents are read from.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Returns every document covering `[start, end]`, loading the missing
    /// ones, then sweeps the cache.
    ///
    /// Identifiers without a backing file map to a
    /// [`ParsedDocument::missing`] placeholder rather than failing the query.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfRange`] if `start > end` or the range leaves the
    ///   configured timespan.
    /// - [`Error::Io`] if storage fails for a reason other than absence.
    pub fn get_range(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DocumentMap<R>, Error> {
        self.check_range(start, end)?;

        let wanted = self.identifiers(start, end)?;
        let missing: Vec<&DocumentId> = wanted
            .iter()
            .filter(|id| !self.entries.contains_key(*id))
            .collect();
        self.stats.misses += missing.len() as u64;
        self.stats.hits += (wanted.len() - missing.len()) as u64;

        if !missing.is_empty() {
            let load_end = std::cmp::min(self.end, end + self.lookahead);
            let mut to_load = self.identifiers(start, load_end)?;
            to_load.extend(wanted.iter().cloned());
            debug!(
                kind = %self.kind,
                %start,
                %load_end,
                candidates = to_load.len(),
                "loading documents"
            );
            for id in to_load {
                if !self.entries.contains_key(&id) {
                    self.load(id)?;
                }
            }
        }

        let mut result = BTreeMap::new();
        for id in wanted {
            if let Some(entry) = self.entries.get(&id) {
                result.insert(id, Arc::clone(&entry.document));
            }
        }

        self.sweep();
        Ok(result)
    }

    /// Returns one document, loading it on a miss. Does not sweep.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if the identifier's timestamp is outside the
    /// configured timespan, [`Error::Io`] on storage failure.
    pub fn get(&mut self, id: &DocumentId) -> Result<Arc<ParsedDocument<R>>, Error> {
        if !self.covers(id.valid_after) {
            return Err(self.out_of_range(id.valid_after));
        }

        if let Some(entry) = self.entries.get(id) {
            self.stats.hits += 1;
            return Ok(Arc::clone(&entry.document));
        }

        self.stats.misses += 1;
        self.load(id.clone())
    }

    /// The `bandwidth-weights` footer of the status document filed at
    /// `time`'s hour.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfRange`] if `time` is outside the timespan.
    /// - [`Error::NotFound`] if no document exists for that hour.
    /// - [`Error::Empty`] if the document lists no relays.
    pub fn footer_attributes(&mut self, time: DateTime<Utc>) -> Result<BTreeMap<String, i64>, Error> {
        self.check_range(time, time)?;

        let id = self
            .identifiers(time, time)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("{} at {}", self.kind, time)))?;
        let document = self.get(&id)?;
        document.require_records(&id)?;
        Ok(document.footer_attributes().clone())
    }

    /// Decrements every entry's TTL and evicts those at or below one.
    ///
    /// Returns the number of evicted entries.
    pub fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, entry| {
            entry.ttl = entry.ttl.saturating_sub(1);
            let keep = entry.ttl > 1;
            if !keep {
                trace!(%id, "evicting document");
            }
            keep
        });
        let evicted = before - self.entries.len();
        self.stats.evictions += evicted as u64;
        evicted
    }

    /// Whether `id` is currently cached.
    pub fn contains(&self, id: &DocumentId) -> bool {
        self.entries.contains_key(id)
    }

    /// Remaining TTL of a cached entry.
    pub fn ttl_of(&self, id: &DocumentId) -> Option<u32> {
        self.entries.get(id).map(|entry| entry.ttl)
    }

    /// Number of cached documents.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hit, miss, load and eviction counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    /// Drops every cached document.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn load(&mut self, id: DocumentId) -> Result<Arc<ParsedDocument<R>>, Error> {
        let document = match self.store.read_document(&id) {
            Ok(bytes) => ParsedDocument::from_bytes(&bytes, self.kind),
            Err(Error::NotFound(_)) => {
                debug!(%id, "document not in archive");
                ParsedDocument::missing()
            }
            Err(Error::Decompression(reason)) => {
                warn!(%id, %reason, "treating undecodable document as missing");
                ParsedDocument::missing()
            }
            Err(err) => return Err(err),
        };

        let document = Arc::new(document);
        self.stats.loads += 1;
        self.entries.insert(
            id,
            CacheEntry {
                document: Arc::clone(&document),
                ttl: self.initial_ttl,
            },
        );
        Ok(document)
    }

    fn identifiers(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeSet<DocumentId>, Error> {
        let mut ids = BTreeSet::new();
        match self.kind {
            DocumentKind::Consensus => {
                ids.extend(hours_between(start, end).into_iter().map(DocumentId::consensus));
            }
            DocumentKind::BridgeStatus => {
                for hour in hours_between(start, end) {
                    let prefix = hour.format("%Y%m%d-%H").to_string();
                    for name in self.listing(hour, &prefix)? {
                        if let Some(id) = DocumentId::bridge_status(&name) {
                            ids.insert(id);
                        }
                    }
                }
            }
            DocumentKind::ServerDescriptor | DocumentKind::BridgeDescriptor => {
                for month in months_between(start, end) {
                    for name in self.listing(month, "")? {
                        ids.insert(DocumentId::descriptor(self.kind, month, &name));
                    }
                }
            }
        }
        Ok(ids)
    }

    fn listing(&self, period: DateTime<Utc>, prefix: &str) -> Result<Vec<String>, Error> {
        let directory = self.kind.directory(period);
        match self.store.list_with_prefix(&directory, prefix) {
            Ok(names) => Ok(names),
            Err(Error::NotFound(_)) => {
                debug!(directory = %directory.display(), "directory not in archive");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    fn check_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), Error> {
        if start > end || start < self.start {
            return Err(self.out_of_range(start));
        }
        if end > self.end {
            return Err(self.out_of_range(end));
        }
        Ok(())
    }

    fn out_of_range(&self, requested: DateTime<Utc>) -> Error {
        Error::OutOfRange {
            requested,
            start: self.start,
            end: self.end,
        }
    }
}
