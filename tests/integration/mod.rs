//! Integration tests for relay-history against archives laid out on disk.
//!
//! Every test builds a small CollecTor-style archive in a temporary
//! directory with [`Archive`] and replays it through the public API.

mod archive_tests;
mod correlation_tests;
mod fanout_tests;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use relay_history::{ArchiveConfig, ArchiveConfigBuilder, DocumentId, DocumentKind, Network};
use tempfile::TempDir;

/// Shorthand for an hour in 2024.
pub fn at(month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, day, hour, 0, 0).unwrap()
}

/// One relay as it appears in a status document.
#[derive(Debug, Clone)]
pub struct Relay {
    pub nickname: String,
    pub id: u8,
    pub published: DateTime<Utc>,
    pub bandwidth: u64,
    pub version: Option<String>,
}

impl Relay {
    pub fn new(nickname: &str, id: u8) -> Self {
        Self {
            nickname: nickname.to_string(),
            id,
            published: at(1, 15, 0),
            bandwidth: 100,
            version: None,
        }
    }

    pub fn published(mut self, published: DateTime<Utc>) -> Self {
        self.published = published;
        self
    }

    pub fn bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    fn identity_bytes(&self) -> [u8; 20] {
        [self.id; 20]
    }

    fn digest_bytes(&self) -> [u8; 20] {
        let mut bytes = [self.id; 20];
        bytes[0] = 0xd0;
        bytes
    }

    /// Uppercase hex fingerprint.
    pub fn fingerprint(&self) -> String {
        hex(&self.identity_bytes()).to_uppercase()
    }

    /// Lowercase hex descriptor digest.
    pub fn digest(&self) -> String {
        hex(&self.digest_bytes())
    }

    /// The status entry lines for this relay.
    pub fn entry(&self) -> String {
        let mut entry = format!(
            "r {} {} {} {} 10.0.0.{} 9001 0\ns Fast Running Valid\n",
            self.nickname,
            STANDARD_NO_PAD.encode(self.identity_bytes()),
            STANDARD_NO_PAD.encode(self.digest_bytes()),
            self.published.format("%Y-%m-%d %H:%M:%S"),
            self.id,
        );
        if let Some(version) = &self.version {
            entry.push_str(&format!("v Tor {}\n", version));
        }
        entry.push_str(&format!("w Bandwidth={}\np reject 1-65535\n", self.bandwidth));
        entry
    }

    /// An unsigned server descriptor for this relay.
    pub fn descriptor(&self, platform_version: &str) -> String {
        format!(
            "@type server-descriptor 1.0\n\
             router {} 10.0.0.{} 9001 0 9030\n\
             platform Tor {} on Linux\n\
             published {}\n\
             fingerprint {}\n\
             bandwidth 1000 2000 1500\n\
             contact ops@example.org\n\
             family $0101010101010101010101010101010101010101 other\n\
             reject *:*\n",
            self.nickname,
            self.id,
            platform_version,
            self.published.format("%Y-%m-%d %H:%M:%S"),
            self.fingerprint(),
        )
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Renders a status document listing `relays`.
pub fn status_document(valid_after: DateTime<Utc>, relays: &[Relay], weights: &str) -> String {
    let mut doc = format!(
        "network-status-version 3\nvote-status consensus\nvalid-after {}\n",
        valid_after.format("%Y-%m-%d %H:%M:%S")
    );
    for relay in relays {
        doc.push_str(&relay.entry());
    }
    doc.push_str("directory-footer\n");
    if !weights.is_empty() {
        doc.push_str(&format!("bandwidth-weights {}\n", weights));
    }
    doc
}

/// A temporary archive root.
pub struct Archive {
    dir: TempDir,
}

impl Archive {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// A relay-network config over `[start, end]` rooted at this archive.
    pub fn config(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> ArchiveConfig {
        self.builder(start, end).build().unwrap()
    }

    pub fn builder(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> ArchiveConfigBuilder {
        let mut builder = ArchiveConfigBuilder::default();
        builder
            .root(self.root().to_path_buf())
            .network(Network::Relay)
            .start(start)
            .end(end);
        builder
    }

    pub fn write(&self, relative: impl AsRef<Path>, content: impl AsRef<[u8]>) -> PathBuf {
        let path = self.root().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    pub fn add_consensus(&self, hour: DateTime<Utc>, relays: &[Relay]) -> PathBuf {
        self.add_consensus_with_weights(hour, relays, "Wbd=0 Wbe=0 Wgg=5917")
    }

    pub fn add_consensus_with_weights(
        &self,
        hour: DateTime<Utc>,
        relays: &[Relay],
        weights: &str,
    ) -> PathBuf {
        let id = DocumentId::consensus(hour);
        self.write(id.relative_path(), status_document(hour, relays, weights))
    }

    pub fn add_gzipped_consensus(&self, hour: DateTime<Utc>, relays: &[Relay]) -> PathBuf {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(status_document(hour, relays, "").as_bytes())
            .unwrap();
        let id = DocumentId::consensus(hour);
        self.write(id.relative_path(), encoder.finish().unwrap())
    }

    /// Files a bridge status for `hour` under a CollecTor-style name.
    pub fn add_bridge_status(&self, hour: DateTime<Utc>, relays: &[Relay]) -> PathBuf {
        let name = format!(
            "{}-4A0CCD2DDC7995083D73F5D667100C8A5831F16D",
            hour.format("%Y%m%d-%H%M%S")
        );
        let id = DocumentId::bridge_status(&name).unwrap();
        self.write(id.relative_path(), status_document(hour, relays, ""))
    }

    /// Files `relay`'s descriptor in the month bucket holding `bucket`.
    pub fn add_descriptor(
        &self,
        kind: DocumentKind,
        bucket: DateTime<Utc>,
        relay: &Relay,
        platform_version: &str,
    ) -> PathBuf {
        let id = DocumentId::descriptor(kind, bucket, &relay.digest());
        self.write(id.relative_path(), relay.descriptor(platform_version))
    }
}
