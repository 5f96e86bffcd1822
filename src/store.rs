//! File access for archived documents.
//!
//! The caches never touch the filesystem directly. They go through a
//! [`DocumentStore`], which maps a [`DocumentId`] to raw bytes and lists
//! directories for corpora whose file names are only known by prefix
//! (bridge statuses).
//!
//! Two implementations are provided:
//!
//! - [`DirectoryStore`] reads an extracted CollecTor archive from disk,
//!   transparently gunzipping compressed files. Directory listings are
//!   memoized in a bounded [`ListingCache`].
//! - [`MemoryStore`] holds documents in memory and counts reads, which makes
//!   it convenient for replaying synthetic corpora.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use relay_history::descriptor::DocumentId;
//! use relay_history::store::{DocumentStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! let id = DocumentId::consensus(Utc.with_ymd_and_hms(2024, 1, 15, 7, 0, 0).unwrap());
//! store.insert(&id, "network-status-version 3\n");
//!
//! assert!(store.read_document(&id).is_ok());
//! assert_eq!(store.read_count(&id), 1);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, trace};

use crate::descriptor::cache::CacheStats;
use crate::descriptor::{auto_decompress, DocumentId};
use crate::Error;

/// Default number of directory listings kept by a [`DirectoryStore`].
pub const DEFAULT_LISTING_CAPACITY: usize = 1000;

/// Source of raw document bytes.
///
/// Implementations must be shareable between threads; each day worker of
/// [`crate::fanout`] holds its own caches but may share one store.
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// Reads the document named by `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no such document exists. Any other
    /// error is a storage failure.
    fn read_document(&self, id: &DocumentId) -> Result<Vec<u8>, Error>;

    /// Names of the files in `directory` (relative to the archive root) that
    /// start with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the directory does not exist.
    fn list_with_prefix(&self, directory: &Path, prefix: &str) -> Result<Vec<String>, Error>;
}

/// A bounded, least-recently-used memo of directory listings.
///
/// Listings are looked up repeatedly for adjacent hours, so keeping them
/// avoids rescanning directories holding tens of thousands of files.
#[derive(Debug)]
pub struct ListingCache {
    capacity: usize,
    entries: HashMap<PathBuf, ListingEntry>,
    tick: u64,
    stats: CacheStats,
}

#[derive(Debug)]
struct ListingEntry {
    files: Vec<String>,
    last_accessed: u64,
}

impl ListingCache {
    /// Creates a cache holding at most `capacity` listings (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            tick: 0,
            stats: CacheStats::default(),
        }
    }

    /// The cached listing of `directory`, refreshing its recency.
    pub fn get(&mut self, directory: &Path) -> Option<&[String]> {
        self.tick += 1;
        match self.entries.get_mut(directory) {
            Some(entry) => {
                entry.last_accessed = self.tick;
                self.stats.hits += 1;
                Some(&entry.files)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Stores a listing, evicting the least recently used one when full.
    pub fn put(&mut self, directory: PathBuf, mut files: Vec<String>) {
        if !self.entries.contains_key(&directory) && self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        self.tick += 1;
        files.sort();
        self.stats.loads += 1;
        self.entries.insert(
            directory,
            ListingEntry {
                files,
                last_accessed: self.tick,
            },
        );
    }

    /// Number of cached listings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no listing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of listings held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hit, miss and eviction counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            trace!(directory = %key.display(), "evicting directory listing");
            self.entries.remove(&key);
            self.stats.evictions += 1;
        }
    }
}

/// Reads an extracted archive laid out the way CollecTor serves it:
///
/// ```text
/// <root>/consensuses/YYYY-MM-DD-HH-00-00-consensus
/// <root>/bridge-statuses/YYYYMMDD-HHMMSS-<authority fingerprint>
/// <root>/relay_descriptors/server-descriptors-YYYY-MM/<digest>
/// <root>/bridge_descriptors/bridge-server-descriptors-YYYY-MM/<digest>
/// ```
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    listings: Mutex<ListingCache>,
}

impl DirectoryStore {
    /// Creates a store over the archive rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            listings: Mutex::new(ListingCache::new(DEFAULT_LISTING_CAPACITY)),
        }
    }

    /// Sets how many directory listings are memoized.
    pub fn with_listing_capacity(self, capacity: usize) -> Self {
        Self {
            root: self.root,
            listings: Mutex::new(ListingCache::new(capacity)),
        }
    }

    /// The archive root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Statistics of the listing memo.
    pub fn listing_stats(&self) -> CacheStats {
        self.listings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }

    fn read_listing(&self, directory: &Path) -> Result<Vec<String>, Error> {
        let path = self.root.join(directory);
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    files.push(name.to_string());
                }
            }
        }
        debug!(directory = %path.display(), files = files.len(), "listed directory");
        Ok(files)
    }
}

impl DocumentStore for DirectoryStore {
    fn read_document(&self, id: &DocumentId) -> Result<Vec<u8>, Error> {
        let path = self.root.join(id.relative_path());
        match fs::read(&path) {
            Ok(bytes) => auto_decompress(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_with_prefix(&self, directory: &Path, prefix: &str) -> Result<Vec<String>, Error> {
        let mut listings = self
            .listings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(files) = listings.get(directory) {
            return Ok(filter_prefix(files, prefix));
        }

        let files = self.read_listing(directory)?;
        let matching = filter_prefix(&files, prefix);
        listings.put(directory.to_path_buf(), files);
        Ok(matching)
    }
}

fn filter_prefix(files: &[String], prefix: &str) -> Vec<String> {
    let mut matching: Vec<String> = files
        .iter()
        .filter(|name| name.starts_with(prefix))
        .cloned()
        .collect();
    matching.sort();
    matching
}

/// Documents held in memory, keyed by their relative path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    reads: Mutex<HashMap<PathBuf, usize>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the document named by `id`.
    pub fn insert(&self, id: &DocumentId, content: impl Into<Vec<u8>>) {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.relative_path(), content.into());
    }

    /// Removes the document named by `id`, returning whether it existed.
    pub fn remove(&self, id: &DocumentId) -> bool {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.relative_path())
            .is_some()
    }

    /// How many times `id` was read, successfully or not.
    pub fn read_count(&self, id: &DocumentId) -> usize {
        self.reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id.relative_path())
            .copied()
            .unwrap_or(0)
    }

    /// Total number of reads issued against the store.
    pub fn total_reads(&self) -> usize {
        self.reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryStore {
    fn read_document(&self, id: &DocumentId) -> Result<Vec<u8>, Error> {
        let path = id.relative_path();
        *self
            .reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.clone())
            .or_insert(0) += 1;

        let content = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path)
            .cloned();
        match content {
            Some(bytes) => auto_decompress(bytes),
            None => Err(Error::NotFound(path.display().to_string())),
        }
    }

    fn list_with_prefix(&self, directory: &Path, prefix: &str) -> Result<Vec<String>, Error> {
        let documents = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut found_directory = false;
        let mut matching = Vec::new();
        for path in documents.keys() {
            if path.parent() != Some(directory) {
                continue;
            }
            found_directory = true;
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with(prefix) {
                    matching.push(name.to_string());
                }
            }
        }

        if !found_directory {
            return Err(Error::NotFound(directory.display().to_string()));
        }
        Ok(matching)
    }
}
