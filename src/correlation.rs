//! Merging status entries with their descriptors over a time range.
//!
//! [`CorrelationEngine::correlate`] walks the status documents of a range in
//! ascending order. Every entry is resolved to its server descriptor as of
//! the entry's publication time, merged into a [`RelaySnapshot`], and folded
//! into a [`RelayTimeline`] keyed by fingerprint.
//!
//! # Merge Rules
//!
//! - Status entry fields take precedence. Descriptor fields only fill what
//!   the entry leaves unset; a missing version is taken from the
//!   descriptor's platform string.
//! - A relay's snapshot is replaced only by one observed in a strictly later
//!   document. Feeding documents out of order or twice does not change the
//!   result.
//! - A relay whose descriptor cannot be resolved is kept, without
//!   descriptor fields.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ArchiveConfig;
use crate::descriptor::cache::WindowedCache;
use crate::descriptor::{DocumentId, ParsedDocument, RouterStatusRecord, ServerDescriptorRecord};
use crate::exit_policy::MicroExitPolicy;
use crate::resolver::DescriptorResolver;
use crate::store::DocumentStore;
use crate::Error;

/// What was known about one relay as of one status document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelaySnapshot {
    /// Timestamp of the status document the relay was last seen in.
    pub last_seen_in: DateTime<Utc>,
    /// Uppercase hex fingerprint.
    pub fingerprint: String,
    /// Nickname.
    pub nickname: String,
    /// Identity digest as published (base64).
    pub identity: String,
    /// Descriptor digest the status entry referenced (lowercase hex).
    pub digest: String,
    /// Publication time of the referenced descriptor.
    pub published: DateTime<Utc>,
    /// IPv4 address.
    pub address: IpAddr,
    /// OR port.
    pub or_port: u16,
    /// Directory port.
    pub dir_port: Option<u16>,
    /// First IPv6 OR address.
    pub ipv6_address: Option<SocketAddr>,
    /// Flags.
    pub flags: Vec<String>,
    /// Tor version, without the `Tor ` prefix.
    pub version: Option<String>,
    /// Supported protocol versions.
    pub protocols: Option<BTreeMap<String, Vec<u32>>>,
    /// Consensus bandwidth weight.
    pub bandwidth: u64,
    /// Measured bandwidth.
    pub measured: Option<u64>,
    /// Exit port summary.
    pub exit_policy: Option<MicroExitPolicy>,
    /// The resolved server descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<ServerDescriptorRecord>,
}

impl RelaySnapshot {
    /// A snapshot holding only the status entry's fields.
    pub fn from_status(record: &RouterStatusRecord, last_seen_in: DateTime<Utc>) -> Self {
        Self {
            last_seen_in,
            fingerprint: record.fingerprint.clone(),
            nickname: record.nickname.clone(),
            identity: record.identity.clone(),
            digest: record.digest.clone(),
            published: record.published,
            address: record.address,
            or_port: record.or_port,
            dir_port: record.dir_port,
            ipv6_address: record.ipv6_address(),
            flags: record.flags.clone(),
            version: record.version().map(str::to_string),
            protocols: record.protocols.clone(),
            bandwidth: record.bandwidth,
            measured: record.measured,
            exit_policy: record.exit_policy.clone(),
            descriptor: None,
        }
    }

    /// Attaches a descriptor, filling fields the status entry left unset.
    pub fn with_descriptor(mut self, descriptor: ServerDescriptorRecord) -> Self {
        if self.version.is_none() {
            self.version = descriptor.tor_version().map(str::to_string);
        }
        if self.protocols.is_none() {
            self.protocols = descriptor.protocols.clone();
        }
        if self.dir_port.is_none() {
            self.dir_port = descriptor.dir_port;
        }
        self.descriptor = Some(descriptor);
        self
    }

    /// Whether a descriptor was resolved.
    pub fn has_descriptor(&self) -> bool {
        self.descriptor.is_some()
    }

    /// Platform string from the descriptor.
    pub fn platform(&self) -> Option<&str> {
        self.descriptor.as_ref()?.platform.as_deref()
    }

    /// Contact string from the descriptor.
    pub fn contact(&self) -> Option<&str> {
        self.descriptor.as_ref()?.contact.as_deref()
    }

    /// Whether the relay would carry traffic to `port`.
    ///
    /// The status entry's port summary decides when present, otherwise the
    /// descriptor's exit policy does. A relay with neither exits nowhere.
    pub fn exits_to(&self, port: u16) -> bool {
        match (&self.exit_policy, &self.descriptor) {
            (Some(summary), _) => summary.can_exit_to(port),
            (None, Some(descriptor)) => descriptor.exits_to_port(port),
            (None, None) => false,
        }
    }
}

/// Latest snapshot per relay fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RelayTimeline {
    relays: BTreeMap<String, RelaySnapshot>,
}

impl RelayTimeline {
    /// Creates an empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in a snapshot. Returns whether it replaced what was stored.
    ///
    /// A stored snapshot is replaced only by one with a strictly later
    /// `last_seen_in`. If the newer snapshot has no descriptor, the stored
    /// one's descriptor is carried over.
    pub fn observe(&mut self, snapshot: RelaySnapshot) -> bool {
        match self.relays.entry(snapshot.fingerprint.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(snapshot);
                true
            }
            Entry::Occupied(mut slot) => {
                if snapshot.last_seen_in <= slot.get().last_seen_in {
                    return false;
                }
                let mut snapshot = snapshot;
                if snapshot.descriptor.is_none() {
                    if let Some(previous) = slot.get_mut().descriptor.take() {
                        snapshot = snapshot.with_descriptor(previous);
                    }
                }
                slot.insert(snapshot);
                true
            }
        }
    }

    /// The snapshot of `fingerprint`.
    pub fn get(&self, fingerprint: &str) -> Option<&RelaySnapshot> {
        self.relays.get(fingerprint)
    }

    /// Number of distinct relays.
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// Whether no relay was observed.
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Snapshots ordered by fingerprint.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &RelaySnapshot)> {
        self.relays.iter()
    }

    /// The underlying map.
    pub fn into_relays(self) -> BTreeMap<String, RelaySnapshot> {
        self.relays
    }
}

/// Replays status documents against their descriptors.
#[derive(Debug)]
pub struct CorrelationEngine {
    statuses: WindowedCache<RouterStatusRecord>,
    resolver: DescriptorResolver,
}

impl CorrelationEngine {
    /// Creates an engine from its two collaborators.
    pub fn new(statuses: WindowedCache<RouterStatusRecord>, resolver: DescriptorResolver) -> Self {
        Self { statuses, resolver }
    }

    /// Builds the caches described by `config` over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is inconsistent.
    pub fn from_config(config: &ArchiveConfig, store: Arc<dyn DocumentStore>) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::new(
            config.status_cache(Arc::clone(&store)),
            config.resolver(store),
        ))
    }

    /// Builds an engine reading the archive under `config.root`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is inconsistent.
    pub fn open(config: &ArchiveConfig) -> Result<Self, Error> {
        Self::from_config(config, Arc::new(config.directory_store()))
    }

    /// The merged view of every relay listed between `start` and `end`,
    /// keyed by fingerprint.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfRange`] if the range leaves the configured timespan.
    /// - [`Error::Io`] on storage failure.
    pub fn correlate(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<String, RelaySnapshot>, Error> {
        let documents = self.statuses.get_range(start, end)?;
        let timeline = self.correlate_documents(documents)?;
        info!(%start, %end, relays = timeline.len(), "correlated status documents");
        Ok(timeline.into_relays())
    }

    /// Folds the given documents into a fresh timeline, in iteration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a descriptor lookup fails on storage.
    pub fn correlate_documents<I>(&mut self, documents: I) -> Result<RelayTimeline, Error>
    where
        I: IntoIterator<Item = (DocumentId, Arc<ParsedDocument<RouterStatusRecord>>)>,
    {
        let mut timeline = RelayTimeline::new();
        for (id, document) in documents {
            let mut unresolved = 0usize;
            for record in document.records() {
                let mut snapshot = RelaySnapshot::from_status(record, id.valid_after);
                match self.resolver.resolve(&record.digest, record.published)? {
                    Some(descriptor) => snapshot = snapshot.with_descriptor(descriptor),
                    None => unresolved += 1,
                }
                timeline.observe(snapshot);
            }
            debug!(
                %id,
                entries = document.records().len(),
                unresolved,
                "processed status document"
            );
            self.resolver.end_period();
        }
        Ok(timeline)
    }

    /// The `bandwidth-weights` footer of the status document at `time`.
    ///
    /// # Errors
    ///
    /// See [`WindowedCache::footer_attributes`].
    pub fn footer_attributes(&mut self, time: DateTime<Utc>) -> Result<BTreeMap<String, i64>, Error> {
        self.statuses.footer_attributes(time)
    }

    /// The status document cache.
    pub fn statuses(&self) -> &WindowedCache<RouterStatusRecord> {
        &self.statuses
    }

    /// The descriptor resolver.
    pub fn resolver(&self) -> &DescriptorResolver {
        &self.resolver
    }
}
