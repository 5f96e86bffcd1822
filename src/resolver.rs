//! Resolution of descriptor digests to server descriptors.
//!
//! A status entry references its relay's server descriptor by digest and
//! publication time. Descriptors are archived under the month in which they
//! were published, but archives are imperfect: a descriptor may land in a
//! later directory than expected, or be missing altogether. The resolver
//! therefore looks in the publication month first and then walks back a
//! bounded number of months.
//!
//! Resolution stops at the first month bucket holding a matching descriptor.
//! It never looks forward in time and does not compare candidates across
//! buckets.

use chrono::{DateTime, Utc};
use tracing::{trace, warn};

use crate::descriptor::cache::WindowedCache;
use crate::descriptor::{DocumentId, DocumentKind, ParsedDocument, ServerDescriptorRecord};
use crate::util::{months_back, months_between};
use crate::Error;

/// Month buckets searched before the publication month by default.
pub const DEFAULT_LOOKBACK_MONTHS: u32 = 1;

/// Finds the server descriptor a status entry refers to.
#[derive(Debug)]
pub struct DescriptorResolver {
    cache: WindowedCache<ServerDescriptorRecord>,
    max_lookback: u32,
}

impl DescriptorResolver {
    /// Creates a resolver over `cache` that searches `max_lookback` buckets
    /// before the publication month unless told otherwise.
    pub fn new(cache: WindowedCache<ServerDescriptorRecord>, max_lookback: u32) -> Self {
        Self {
            cache,
            max_lookback,
        }
    }

    /// Default number of preceding buckets searched by [`resolve`](Self::resolve).
    pub fn max_lookback(&self) -> u32 {
        self.max_lookback
    }

    /// The underlying descriptor cache.
    pub fn cache(&self) -> &WindowedCache<ServerDescriptorRecord> {
        &self.cache
    }

    /// Descriptor kind this resolver searches.
    pub fn kind(&self) -> DocumentKind {
        self.cache.kind()
    }

    /// [`resolve_as_of`](Self::resolve_as_of) with the configured lookback.
    pub fn resolve(
        &mut self,
        content_hash: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<ServerDescriptorRecord>, Error> {
        self.resolve_as_of(content_hash, as_of, self.max_lookback)
    }

    /// Finds the descriptor with `content_hash` in the month bucket holding
    /// `as_of` or in one of the `max_lookback` buckets before it, newest
    /// first.
    ///
    /// The hash is compared case-insensitively. Buckets before the cache's
    /// timespan end the search.
    ///
    /// Returns `Ok(None)` when no inspected bucket holds the descriptor;
    /// callers should treat that as "descriptor unavailable".
    ///
    /// # Errors
    ///
    /// Only storage failures ([`Error::Io`]) are reported.
    pub fn resolve_as_of(
        &mut self,
        content_hash: &str,
        as_of: DateTime<Utc>,
        max_lookback: u32,
    ) -> Result<Option<ServerDescriptorRecord>, Error> {
        let hash = content_hash.to_ascii_lowercase();
        let kind = self.cache.kind();

        for back in 0..=max_lookback {
            let Some(bucket) = months_back(as_of, back) else {
                break;
            };
            if !self.cache.covers(bucket) {
                warn!(
                    %hash,
                    bucket = %bucket.format("%Y-%m"),
                    "descriptor bucket outside of the cached timespan"
                );
                break;
            }

            let id = DocumentId::descriptor(kind, bucket, &hash);
            let document = self.cache.get(&id)?;
            if let Some(record) = find_match(&document, &hash, &id.name) {
                trace!(%hash, bucket = %bucket.format("%Y-%m"), "resolved descriptor");
                return Ok(Some(record.clone()));
            }
        }

        Ok(None)
    }

    /// Ages the descriptor cache by one sweep. Call once per processed
    /// status document.
    pub fn end_period(&mut self) -> usize {
        self.cache.sweep()
    }

    /// Parses every descriptor filed under the months spanning
    /// `[start, end]`, bypassing the cache.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfRange`] if the range leaves the cache's timespan.
    /// - [`Error::NotFound`] if a month directory is missing.
    pub fn descriptors_in_months(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ServerDescriptorRecord>, Error> {
        let (span_start, span_end) = self.cache.timespan();
        if start > end || start < span_start {
            return Err(Error::OutOfRange {
                requested: start,
                start: span_start,
                end: span_end,
            });
        }
        if end > span_end {
            return Err(Error::OutOfRange {
                requested: end,
                start: span_start,
                end: span_end,
            });
        }

        let kind = self.cache.kind();
        let store = self.cache.store();
        let mut descriptors = Vec::new();
        for month in months_between(start, end) {
            let directory = kind.directory(month);
            for name in store.list_with_prefix(&directory, "")? {
                let id = DocumentId::descriptor(kind, month, &name);
                let bytes = store.read_document(&id)?;
                let document: ParsedDocument<ServerDescriptorRecord> =
                    ParsedDocument::from_bytes(&bytes, kind);
                descriptors.extend(document.records().iter().cloned());
            }
        }
        Ok(descriptors)
    }
}

fn find_match<'a>(
    document: &'a ParsedDocument<ServerDescriptorRecord>,
    hash: &str,
    file_name: &str,
) -> Option<&'a ServerDescriptorRecord> {
    document
        .records()
        .iter()
        .find(|record| record.matches_content_hash(hash, file_name))
}
