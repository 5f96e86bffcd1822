//! # relay-history
//!
//! Replays archived Tor directory documents to reconstruct what the network
//! knew about its relays during a historical time window.
//!
//! # Overview
//!
//! Directory authorities publish two kinds of documents that this crate
//! combines:
//!
//! - **Consensus documents**, one per hour, listing every relay with its flags,
//!   bandwidth weight and a digest referencing its server descriptor.
//! - **Server descriptors**, published by the relays themselves roughly every
//!   18 hours and archived under month buckets, named by content digest.
//!
//! Given a closed time range, the crate walks the hourly consensuses in
//! ascending order, resolves each entry to the most recent descriptor known at
//! its publication time and keeps, per relay fingerprint, the attributes seen
//! in the latest consensus of the range.
//!
//! # Architecture
//!
//! - [`descriptor`]: document identifiers, parsed documents and the two record
//!   parsers ([`descriptor::router_status`] and [`descriptor::server`]), plus
//!   the TTL-bounded [`descriptor::cache::WindowedCache`].
//! - [`store`]: the file-access collaborator ([`store::DocumentStore`]) with
//!   a filesystem and an in-memory implementation.
//! - [`resolver`]: backward month-bucket descriptor resolution.
//! - [`correlation`]: merges consensus entries with their descriptors into
//!   [`correlation::RelaySnapshot`]s.
//! - [`config`]: [`config::ArchiveConfig`] and the corpus layout.
//! - [`fanout`]: independent per-day workers on tokio's blocking pool.
//! - [`exit_policy`]: exit policy rules and port summaries.
//! - [`util`]: time bucket arithmetic and identifier helpers.
//!
//! # Example
//!
//! ```rust,no_run
//! use chrono::{TimeZone, Utc};
//! use relay_history::config::ArchiveConfigBuilder;
//! use relay_history::correlation::CorrelationEngine;
//!
//! # fn main() -> Result<(), relay_history::Error> {
//! let start = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
//! let end = Utc.with_ymd_and_hms(2024, 1, 15, 23, 0, 0).unwrap();
//!
//! let config = ArchiveConfigBuilder::default()
//!     .root("cache_1_2024")
//!     .start(start)
//!     .end(end)
//!     .build()?;
//!
//! let mut engine = CorrelationEngine::open(&config)?;
//! for (fingerprint, relay) in engine.correlate(start, end)? {
//!     println!("{} {} {:?}", fingerprint, relay.nickname, relay.version);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Errors
//!
//! Missing documents and unresolvable descriptors are expected near the edges
//! of an archive and surface as empty results. Only queries outside the
//! configured timespan abort. See [`enum@Error`].

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod correlation;
pub mod descriptor;
pub mod exit_policy;
pub mod fanout;
pub mod resolver;
pub mod store;
pub mod util;

pub use config::{ArchiveConfig, ArchiveConfigBuilder, Network};
pub use correlation::{CorrelationEngine, RelaySnapshot, RelayTimeline};
pub use descriptor::cache::{CacheStats, WindowedCache};
pub use descriptor::{DocumentId, DocumentKind, ParsedDocument};
pub use resolver::DescriptorResolver;
pub use store::{DirectoryStore, DocumentStore, MemoryStore};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur while replaying an archive.
///
/// # Error Categories
///
/// | Error | Fatal for the query | Retry Meaningful |
/// |-------|---------------------|------------------|
/// | [`NotFound`](Error::NotFound) | No | No, the corpus is static |
/// | [`Empty`](Error::Empty) | No | No |
/// | [`OutOfRange`](Error::OutOfRange) | Yes | No, fix the query |
/// | [`MalformedFooter`](Error::MalformedFooter) | No | No |
/// | [`Io`](Error::Io) | Yes | Sometimes |
/// | [`InvalidConfig`](Error::InvalidConfig) | Yes | No |
///
/// # Example
///
/// ```rust
/// use relay_history::Error;
///
/// fn describe(err: &Error) -> &'static str {
///     match err {
///         Error::NotFound(_) | Error::Empty(_) => "no data, skip it",
///         Error::OutOfRange { .. } => "query outside the archive timespan",
///         _ => "unexpected failure",
///     }
/// }
///
/// assert_eq!(describe(&Error::NotFound("x".into())), "no data, skip it");
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// The requested document, directory or descriptor is absent from storage.
    ///
    /// # Recovery
    ///
    /// Expected near the edges of a downloaded archive. Treat it as "no data".
    #[error("not found: {0}")]
    NotFound(String),

    /// The document exists but contains zero records.
    ///
    /// Distinct from [`NotFound`](Error::NotFound): the file was read and
    /// parsed, it just listed nothing.
    #[error("document has no records: {0}")]
    Empty(String),

    /// A query fell outside the timespan the cache was constructed for.
    ///
    /// # Recovery
    ///
    /// This is a programming error in the caller. Adjust the query or build
    /// the cache with a wider timespan.
    #[error("{requested} is outside of the configured timespan {start} - {end}")]
    OutOfRange {
        /// The offending timestamp (or range bound).
        requested: DateTime<Utc>,
        /// Start of the configured timespan.
        start: DateTime<Utc>,
        /// End of the configured timespan.
        end: DateTime<Utc>,
    },

    /// The `bandwidth-weights` trailer exists but is not a list of
    /// `key=integer` pairs.
    ///
    /// The document parser logs this and carries on with an empty footer.
    #[error("malformed footer: {0}")]
    MalformedFooter(String),

    /// A record could not be parsed.
    ///
    /// Raised by the record-level parsers and absorbed by the document scan,
    /// which drops the offending record.
    #[error("parse error at {location}: {reason}")]
    Parse {
        /// Line keyword or field where parsing failed.
        location: String,
        /// Description of the parse failure.
        reason: String,
    },

    /// Reading from storage failed for a reason other than absence.
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    /// A document used a compression format that cannot be decoded.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// The archive configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A day worker panicked or was cancelled.
    #[error("worker failed: {0}")]
    Worker(String),
}

impl From<config::ArchiveConfigBuilderError> for Error {
    fn from(err: config::ArchiveConfigBuilderError) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}
