//! Archive configuration.
//!
//! An [`ArchiveConfig`] names the archive root, the network (relays or
//! bridges), the timespan a replay may query and the cache tuning knobs. It
//! builds every cache and resolver a replay needs, so that all of them agree
//! on the timespan.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use relay_history::config::{ArchiveConfigBuilder, Network};
//!
//! let config = ArchiveConfigBuilder::default()
//!     .root("/srv/collector")
//!     .network(Network::Bridge)
//!     .start(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
//!     .end(Utc.with_ymd_and_hms(2024, 1, 31, 23, 0, 0).unwrap())
//!     .lookahead_hours(6u32)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.initial_ttl, 70);
//! assert_eq!(config.descriptor_lookback_months, 1);
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::Serialize;

use crate::descriptor::cache::{WindowedCache, DEFAULT_TTL};
use crate::descriptor::{DocumentKind, RouterStatusRecord, ServerDescriptorRecord};
use crate::resolver::{DescriptorResolver, DEFAULT_LOOKBACK_MONTHS};
use crate::store::{DirectoryStore, DocumentStore, DEFAULT_LISTING_CAPACITY};
use crate::util::months_back;
use crate::Error;

/// Which corpus pair to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Network {
    /// Relay consensuses and relay server descriptors.
    #[default]
    Relay,
    /// Bridge network statuses and bridge server descriptors.
    Bridge,
}

impl Network {
    /// Kind of the hourly status documents.
    pub fn status_kind(&self) -> DocumentKind {
        match self {
            Network::Relay => DocumentKind::Consensus,
            Network::Bridge => DocumentKind::BridgeStatus,
        }
    }

    /// Kind of the server descriptors.
    pub fn descriptor_kind(&self) -> DocumentKind {
        match self {
            Network::Relay => DocumentKind::ServerDescriptor,
            Network::Bridge => DocumentKind::BridgeDescriptor,
        }
    }
}

/// Where the archive lives and how to replay it.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct ArchiveConfig {
    /// Root directory of the extracted archive.
    #[builder(default = "PathBuf::from(\"cache\")")]
    pub root: PathBuf,

    /// Relay or bridge corpora.
    #[builder(default)]
    pub network: Network,

    /// First hour that may be queried.
    pub start: DateTime<Utc>,

    /// Last hour that may be queried.
    pub end: DateTime<Utc>,

    /// Hours preloaded past the end of a range query that misses.
    #[builder(default)]
    pub lookahead_hours: u32,

    /// TTL given to freshly loaded documents. Must be at least 2.
    #[builder(default = "DEFAULT_TTL")]
    pub initial_ttl: u32,

    /// Month buckets searched before the one holding a descriptor's
    /// publication time.
    #[builder(default = "DEFAULT_LOOKBACK_MONTHS")]
    pub descriptor_lookback_months: u32,

    /// Directory listings memoized by the filesystem store.
    #[builder(default = "DEFAULT_LISTING_CAPACITY")]
    pub listing_cache_capacity: usize,
}

impl ArchiveConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let (Some(start), Some(end)) = (&self.start, &self.end) {
            if start > end {
                return Err(format!("start {} is after end {}", start, end));
            }
        }
        if let Some(ttl) = self.initial_ttl {
            if ttl < 2 {
                return Err(format!("initial_ttl must be at least 2, got {}", ttl));
            }
        }
        Ok(())
    }
}

impl ArchiveConfig {
    /// Checks the invariants the builder enforces, for configs assembled by
    /// hand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `start > end` or
    /// `initial_ttl < 2`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.start > self.end {
            return Err(Error::InvalidConfig(format!(
                "start {} is after end {}",
                self.start, self.end
            )));
        }
        if self.initial_ttl < 2 {
            return Err(Error::InvalidConfig(format!(
                "initial_ttl must be at least 2, got {}",
                self.initial_ttl
            )));
        }
        Ok(())
    }

    /// A copy of this configuration restricted to `[start, end]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `start > end`.
    pub fn for_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, Error> {
        let window = Self {
            start,
            end,
            ..self.clone()
        };
        window.validate()?;
        Ok(window)
    }

    /// Whether `[start, end]` lies within the configured timespan.
    pub fn covers(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start <= start && start <= end && end <= self.end
    }

    /// A filesystem store over [`root`](Self::root).
    pub fn directory_store(&self) -> DirectoryStore {
        DirectoryStore::new(&self.root).with_listing_capacity(self.listing_cache_capacity)
    }

    /// The status document cache for the configured timespan.
    pub fn status_cache(&self, store: Arc<dyn DocumentStore>) -> WindowedCache<RouterStatusRecord> {
        WindowedCache::new(self.network.status_kind(), store, self.start, self.end)
            .with_lookahead_hours(self.lookahead_hours)
            .with_initial_ttl(self.initial_ttl)
    }

    /// The descriptor cache.
    ///
    /// Its timespan starts `descriptor_lookback_months + 1` months before
    /// the configured start: status entries may reference descriptors
    /// published in the month before the first queried hour, and resolution
    /// looks further back from there.
    pub fn descriptor_cache(
        &self,
        store: Arc<dyn DocumentStore>,
    ) -> WindowedCache<ServerDescriptorRecord> {
        let start = months_back(self.start, self.descriptor_lookback_months.saturating_add(1))
            .unwrap_or(self.start);
        WindowedCache::new(self.network.descriptor_kind(), store, start, self.end)
            .with_initial_ttl(self.initial_ttl)
    }

    /// A resolver over [`descriptor_cache`](Self::descriptor_cache).
    pub fn resolver(&self, store: Arc<dyn DocumentStore>) -> DescriptorResolver {
        DescriptorResolver::new(self.descriptor_cache(store), self.descriptor_lookback_months)
    }
}
