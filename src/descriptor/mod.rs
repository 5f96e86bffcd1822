//! Archived directory documents: identifiers, parsed form and record parsers.
//!
//! # Overview
//!
//! Two corpora are replayed side by side:
//!
//! - **Status documents** ([`DocumentKind::Consensus`] and
//!   [`DocumentKind::BridgeStatus`]), one per hour, each listing many
//!   [`RouterStatusRecord`]s and ending with a `bandwidth-weights` footer.
//! - **Server descriptors** ([`DocumentKind::ServerDescriptor`] and
//!   [`DocumentKind::BridgeDescriptor`]), one file per descriptor digest,
//!   filed under month directories, each holding a [`ServerDescriptorRecord`].
//!
//! A [`DocumentId`] names one file of either corpus. Parsing a file yields a
//! [`ParsedDocument`], which is immutable once built; the
//! [`cache::WindowedCache`] decides how long it stays in memory.
//!
//! # Parsing Policy
//!
//! Parsing never fails as a whole. A record missing a mandatory line is
//! dropped, an unparseable optional line is left out, and a malformed footer
//! becomes an empty footer. A file that does not exist is a different thing
//! from a file with zero records; see [`DocumentStatus`].
//!
//! # Compression
//!
//! CollecTor files are stored uncompressed once extracted, but documents
//! fetched straight from mirrors may be gzip-compressed. [`auto_decompress`]
//! handles both (gzip requires the `compression` feature).

pub mod cache;
pub mod router_status;
pub mod server;

pub use router_status::RouterStatusRecord;
pub use server::{DescriptorBandwidth, ServerDescriptorRecord};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use crate::util::{floor_to_hour, floor_to_month};
use crate::Error;

/// The corpus a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocumentKind {
    /// Hourly relay consensus, one file per hour.
    Consensus,
    /// Bridge network status, possibly several files per hour.
    BridgeStatus,
    /// Relay server descriptor, one file per digest in month directories.
    ServerDescriptor,
    /// Bridge server descriptor, one file per digest in month directories.
    BridgeDescriptor,
}

impl DocumentKind {
    /// Whether documents of this kind list router status entries.
    pub fn is_status(&self) -> bool {
        matches!(self, DocumentKind::Consensus | DocumentKind::BridgeStatus)
    }

    /// Directory holding documents of this kind for `period`, relative to
    /// the archive root.
    ///
    /// ```rust
    /// use chrono::{TimeZone, Utc};
    /// use relay_history::descriptor::DocumentKind;
    ///
    /// let march = Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap();
    /// assert_eq!(
    ///     DocumentKind::ServerDescriptor.directory(march).to_str(),
    ///     Some("relay_descriptors/server-descriptors-2024-03")
    /// );
    /// ```
    pub fn directory(&self, period: DateTime<Utc>) -> PathBuf {
        match self {
            DocumentKind::Consensus => PathBuf::from("consensuses"),
            DocumentKind::BridgeStatus => PathBuf::from("bridge-statuses"),
            DocumentKind::ServerDescriptor => PathBuf::from("relay_descriptors").join(format!(
                "server-descriptors-{}",
                period.format("%Y-%m")
            )),
            DocumentKind::BridgeDescriptor => PathBuf::from("bridge_descriptors").join(format!(
                "bridge-server-descriptors-{}",
                period.format("%Y-%m")
            )),
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentKind::Consensus => "consensus",
            DocumentKind::BridgeStatus => "bridge-status",
            DocumentKind::ServerDescriptor => "server-descriptor",
            DocumentKind::BridgeDescriptor => "bridge-server-descriptor",
        };
        write!(f, "{}", name)
    }
}

/// Names one archived document.
///
/// Identifiers order by timestamp first, so a `BTreeMap` keyed by
/// `DocumentId` iterates documents chronologically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId {
    /// Timestamp the document is filed under: the hour (or exact
    /// publication second for bridge statuses) of a status document, the
    /// month start of a descriptor bucket.
    pub valid_after: DateTime<Utc>,
    /// Corpus the document belongs to.
    pub kind: DocumentKind,
    /// File name within its directory.
    pub name: String,
}

impl DocumentId {
    /// The relay consensus valid after `hour`, named
    /// `YYYY-MM-DD-HH-00-00-consensus`.
    pub fn consensus(hour: DateTime<Utc>) -> Self {
        let hour = floor_to_hour(hour);
        Self {
            name: format!("{}-00-00-consensus", hour.format("%Y-%m-%d-%H")),
            valid_after: hour,
            kind: DocumentKind::Consensus,
        }
    }

    /// A bridge status file. The name must start with `YYYYMMDD-HHMMSS`.
    ///
    /// Returns `None` for names that carry no parseable timestamp.
    pub fn bridge_status(name: &str) -> Option<Self> {
        let stamp = name.get(..15)?;
        let valid_after = NaiveDateTime::parse_from_str(stamp, "%Y%m%d-%H%M%S")
            .ok()?
            .and_utc();
        Some(Self {
            valid_after,
            kind: DocumentKind::BridgeStatus,
            name: name.to_string(),
        })
    }

    /// The descriptor with `digest` filed under the month containing `month`.
    pub fn descriptor(kind: DocumentKind, month: DateTime<Utc>, digest: &str) -> Self {
        Self {
            valid_after: floor_to_month(month),
            kind,
            name: digest.to_ascii_lowercase(),
        }
    }

    /// Path of the document relative to the archive root.
    pub fn relative_path(&self) -> PathBuf {
        self.kind.directory(self.valid_after).join(&self.name)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.relative_path().display())
    }
}

/// A record type that can be scanned out of a document's text.
///
/// Implementations must be total: malformed records are skipped, never
/// reported as a failure of the whole document.
pub trait Record: Clone + fmt::Debug + Send + Sync + 'static {
    /// Extracts every well-formed record, in order of appearance.
    fn parse_all(content: &str, kind: DocumentKind) -> Vec<Self>;

    /// Extracts records from a document's bytes as stored.
    ///
    /// Invalid UTF-8 is replaced before scanning. Record types that hash
    /// their source override this to hash the original bytes.
    fn parse_all_bytes(content: &[u8], kind: DocumentKind) -> Vec<Self> {
        Self::parse_all(&String::from_utf8_lossy(content), kind)
    }
}

/// Whether a document was found and whether it listed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    /// No file backs the identifier.
    Missing,
    /// The file exists but yielded zero records.
    Empty,
    /// The file yielded this many records.
    Populated(usize),
}

/// The parsed content of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument<R> {
    records: Vec<R>,
    footer: BTreeMap<String, i64>,
    present: bool,
}

impl<R: Record> ParsedDocument<R> {
    /// Parses a document's text.
    ///
    /// The footer is only looked for in status documents.
    pub fn parse(content: &str, kind: DocumentKind) -> Self {
        Self::assemble(content, R::parse_all(content, kind), kind)
    }

    /// Parses raw bytes, replacing invalid UTF-8 rather than failing.
    pub fn from_bytes(bytes: &[u8], kind: DocumentKind) -> Self {
        let content = String::from_utf8_lossy(bytes);
        Self::assemble(&content, R::parse_all_bytes(bytes, kind), kind)
    }

    fn assemble(content: &str, records: Vec<R>, kind: DocumentKind) -> Self {
        let footer = if kind.is_status() {
            parse_footer(content).unwrap_or_else(|err| {
                warn!(%kind, %err, "ignoring malformed bandwidth-weights footer");
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };

        Self {
            records,
            footer,
            present: true,
        }
    }

    /// Placeholder for an identifier with no backing file.
    pub fn missing() -> Self {
        Self {
            records: Vec::new(),
            footer: BTreeMap::new(),
            present: false,
        }
    }

    /// Records in order of appearance. Duplicates are kept.
    pub fn records(&self) -> &[R] {
        &self.records
    }

    /// The `bandwidth-weights` footer. Empty when absent or malformed.
    pub fn footer_attributes(&self) -> &BTreeMap<String, i64> {
        &self.footer
    }

    /// Whether no file backed this document.
    pub fn is_missing(&self) -> bool {
        !self.present
    }

    /// Whether the document has no records (missing documents included).
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Classifies the document.
    pub fn status(&self) -> DocumentStatus {
        match (self.present, self.records.len()) {
            (false, _) => DocumentStatus::Missing,
            (true, 0) => DocumentStatus::Empty,
            (true, n) => DocumentStatus::Populated(n),
        }
    }

    /// The records, or [`Error::NotFound`] / [`Error::Empty`] naming `id`.
    pub fn require_records(&self, id: &DocumentId) -> Result<&[R], Error> {
        match self.status() {
            DocumentStatus::Missing => Err(Error::NotFound(id.to_string())),
            DocumentStatus::Empty => Err(Error::Empty(id.to_string())),
            DocumentStatus::Populated(_) => Ok(&self.records),
        }
    }
}

/// Extracts the `bandwidth-weights` trailer of a status document.
///
/// The trailer is located independently of the record scan. When several
/// such lines exist the last one wins. A document without the trailer yields
/// an empty map.
///
/// # Errors
///
/// Returns [`Error::MalformedFooter`] if a value is not `key=integer`.
///
/// ```rust
/// use relay_history::descriptor::parse_footer;
///
/// let footer = parse_footer("directory-footer\nbandwidth-weights Wbd=3333 Wbe=0\n").unwrap();
/// assert_eq!(footer.get("Wbd"), Some(&3333));
/// assert!(parse_footer("r ...\n").unwrap().is_empty());
/// assert!(parse_footer("bandwidth-weights Wbd=lots\n").is_err());
/// ```
pub fn parse_footer(content: &str) -> Result<BTreeMap<String, i64>, Error> {
    let Some(line) = content
        .lines()
        .filter(|line| line.starts_with("bandwidth-weights"))
        .last()
    else {
        return Ok(BTreeMap::new());
    };

    let mut weights = BTreeMap::new();
    for entry in line.split_whitespace().skip(1) {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| Error::MalformedFooter(format!("missing '=' in {}", entry)))?;
        let value: i64 = value
            .parse()
            .map_err(|_| Error::MalformedFooter(format!("non-integer weight {}", entry)))?;
        weights.insert(key.to_string(), value);
    }
    Ok(weights)
}

/// Compression formats recognised by their magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Uncompressed text.
    Plaintext,
    /// Gzip.
    Gzip,
    /// Zstandard (recognised, not decoded).
    Zstd,
    /// LZMA/XZ (recognised, not decoded).
    Lzma,
}

/// Detects the compression of `content` from its leading bytes.
pub fn detect_compression(content: &[u8]) -> Compression {
    if content.starts_with(&[0x1f, 0x8b]) {
        Compression::Gzip
    } else if content.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Compression::Zstd
    } else if content.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
        Compression::Lzma
    } else {
        Compression::Plaintext
    }
}

/// Decompresses `content` if it is compressed in a supported format.
///
/// # Errors
///
/// Returns [`Error::Decompression`] for corrupt gzip data and for formats
/// that are recognised but not supported.
pub fn auto_decompress(content: Vec<u8>) -> Result<Vec<u8>, Error> {
    match detect_compression(&content) {
        Compression::Plaintext => Ok(content),
        Compression::Gzip => decompress_gzip(&content),
        Compression::Zstd => Err(Error::Decompression(
            "zstd compressed documents are not supported".into(),
        )),
        Compression::Lzma => Err(Error::Decompression(
            "xz compressed documents must be extracted first".into(),
        )),
    }
}

#[cfg(feature = "compression")]
fn decompress_gzip(content: &[u8]) -> Result<Vec<u8>, Error> {
    use std::io::Read;

    let mut decoder = flate2::read::GzDecoder::new(content);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| Error::Decompression(format!("failed to decompress gzip: {}", e)))?;
    Ok(decompressed)
}

#[cfg(not(feature = "compression"))]
fn decompress_gzip(_content: &[u8]) -> Result<Vec<u8>, Error> {
    Err(Error::Decompression(
        "gzip support requires the `compression` feature".into(),
    ))
}
