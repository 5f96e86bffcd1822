//! Server descriptor parsing for relay and bridge descriptors.
//!
//! Server descriptors are published by relays themselves and archived one
//! file per descriptor, named by the lowercase hex SHA-1 digest of the
//! signed content:
//!
//! ```text
//! @type server-descriptor 1.0
//! router caerSidi 71.35.133.197 9001 0 0
//! platform Tor 0.4.8.10 on Linux
//! proto Cons=1-2 Desc=1-2 Link=1-5
//! published 2024-01-15 06:41:52
//! fingerprint A756 9A83 B570 6AB1 B1A9 CB52 EFF7 D2D3 2E45 53EB
//! uptime 588217
//! bandwidth 153600 256000 104590
//! contact atagar@torproject.org
//! family $0CE3CFB1E9CC47B63EA8869813BF6FAB7D4540C1
//! $1FD187E8F69A9B74C9202DC16A25B9E7744AB9F6 oilyquartz
//! ntor-onion-key Yb7sPd6kqV2ri9cl1Rl9H3S7S1PJvJGRZZDaDqWKAHk=
//! reject *:25
//! accept *:*
//! router-signature
//! -----BEGIN SIGNATURE-----
//! ...
//! -----END SIGNATURE-----
//! ```
//!
//! Single-line fields are read by a keyword scan. `family` and the exit
//! policy may span several lines, so they are gathered by a separate pass
//! over the whole text.
//!
//! # Digest Computation
//!
//! The digest covers the content from `router ` through the newline after
//! `router-signature`. Descriptors without a signature block have no digest;
//! their file name stands in as the content hash.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::debug;

use super::router_status::parse_protocols;
use super::{DocumentKind, Record};
use crate::exit_policy::ExitPolicyRule;
use crate::Error;

static FAMILY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:opt )?family (.*)$((?:\n\$.*$)*)").expect("valid family regex")
});

static EXIT_POLICY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^((?:accept|reject)6? \S+)\r?$").expect("valid exit policy regex")
});

/// Advertised and observed bandwidth from the `bandwidth` line, in bytes/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DescriptorBandwidth {
    /// Average bandwidth the relay is willing to sustain.
    pub average: u64,
    /// Burst bandwidth.
    pub burst: u64,
    /// Bandwidth the relay observed itself relaying.
    pub observed: u64,
}

/// A relay's self-published server descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerDescriptorRecord {
    /// Relay nickname.
    pub nickname: String,
    /// IPv4 address.
    pub address: IpAddr,
    /// OR port.
    pub or_port: u16,
    /// SOCKS port, `None` when published as 0.
    pub socks_port: Option<u16>,
    /// Directory port, `None` when published as 0.
    pub dir_port: Option<u16>,
    /// When the descriptor was published.
    pub published: DateTime<Utc>,
    /// Identity fingerprint, spaces removed.
    pub fingerprint: Option<String>,
    /// Platform string, such as `Tor 0.4.8.10 on Linux`.
    pub platform: Option<String>,
    /// Bandwidth line.
    pub bandwidth: Option<DescriptorBandwidth>,
    /// Operator contact information.
    pub contact: Option<String>,
    /// Seconds the relay has been running.
    pub uptime: Option<u64>,
    /// Whether the relay is hibernating.
    pub hibernating: bool,
    /// Curve25519 onion key, base64.
    pub ntor_onion_key: Option<String>,
    /// Supported protocol versions from the `proto` line.
    pub protocols: Option<BTreeMap<String, Vec<u32>>>,
    /// Declared family members: fingerprints without the `$` prefix, or
    /// nicknames.
    pub family: BTreeSet<String>,
    /// Exit policy rules in evaluation order.
    pub exit_policy: Vec<ExitPolicyRule>,
    /// SHA-1 digest of the signed content, lowercase hex.
    pub digest: Option<String>,
}

impl ServerDescriptorRecord {
    /// Parses one descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the `router` or `published` line is
    /// missing or malformed. Every other field is optional.
    pub fn parse(content: &str) -> Result<Self, Error> {
        Self::parse_text(content, compute_digest(content))
    }

    /// Parses one descriptor from the bytes it was stored as.
    ///
    /// Text that is not valid UTF-8 is replaced before parsing, but the
    /// content digest is taken over the original bytes, so such descriptors
    /// still match the hash they are filed under.
    ///
    /// # Errors
    ///
    /// Same as [`parse`](Self::parse).
    pub fn parse_bytes(content: &[u8]) -> Result<Self, Error> {
        Self::parse_text(&String::from_utf8_lossy(content), compute_digest(content))
    }

    fn parse_text(content: &str, digest: Option<String>) -> Result<Self, Error> {
        let mut router: Option<RouterLine> = None;
        let mut published = None;
        let mut fingerprint = None;
        let mut platform = None;
        let mut bandwidth = None;
        let mut contact = None;
        let mut uptime = None;
        let mut hibernating = false;
        let mut ntor_onion_key = None;
        let mut protocols = None;

        for line in content.lines() {
            let line = line.trim_end();
            if line.starts_with('@') {
                continue;
            }

            let line = line.strip_prefix("opt ").unwrap_or(line);

            let (keyword, value) = match line.find(' ') {
                Some(space_pos) => (&line[..space_pos], line[space_pos + 1..].trim()),
                None => (line, ""),
            };

            match keyword {
                "router" => router = Some(RouterLine::parse(value)?),
                "published" => {
                    let datetime = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                        .map_err(|e| Error::Parse {
                            location: "published".to_string(),
                            reason: format!("invalid datetime: {} - {}", value, e),
                        })?;
                    published = Some(datetime.and_utc());
                }
                "fingerprint" => fingerprint = Some(value.replace(' ', "")),
                "platform" => platform = Some(value.to_string()),
                "bandwidth" => bandwidth = parse_bandwidth(value),
                "contact" => contact = Some(value.to_string()),
                "uptime" => uptime = value.parse().ok(),
                "hibernating" => hibernating = value == "1",
                "ntor-onion-key" => ntor_onion_key = Some(value.to_string()),
                "proto" => protocols = Some(parse_protocols(value)),
                _ => {}
            }
        }

        let router = router.ok_or_else(|| Error::Parse {
            location: "router".to_string(),
            reason: "missing router line".to_string(),
        })?;
        let published = published.ok_or_else(|| Error::Parse {
            location: "published".to_string(),
            reason: "missing published line".to_string(),
        })?;

        Ok(Self {
            nickname: router.nickname,
            address: router.address,
            or_port: router.or_port,
            socks_port: router.socks_port,
            dir_port: router.dir_port,
            published,
            fingerprint,
            platform,
            bandwidth,
            contact,
            uptime,
            hibernating,
            ntor_onion_key,
            protocols,
            family: scan_family(content),
            exit_policy: scan_exit_policy(content),
            digest,
        })
    }

    /// The Tor version from the platform string: its second
    /// whitespace-delimited token.
    ///
    /// ```rust
    /// use relay_history::descriptor::ServerDescriptorRecord;
    ///
    /// let desc = ServerDescriptorRecord::parse(
    ///     "router caerSidi 71.35.133.197 9001 0 0\n\
    ///      platform Tor 0.4.8.10 on Linux\n\
    ///      published 2024-01-15 06:41:52\n",
    /// )
    /// .unwrap();
    /// assert_eq!(desc.tor_version(), Some("0.4.8.10"));
    /// ```
    pub fn tor_version(&self) -> Option<&str> {
        self.platform.as_deref()?.split_whitespace().nth(1)
    }

    /// Whether this descriptor is the one referenced by `hash`.
    ///
    /// Compares against the computed digest when there is one, otherwise
    /// against the name of the file the descriptor was read from.
    /// Comparison is case-insensitive.
    pub fn matches_content_hash(&self, hash: &str, file_name: &str) -> bool {
        let own = self.digest.as_deref().unwrap_or(file_name);
        own.eq_ignore_ascii_case(hash)
    }

    /// Whether the exit policy accepts some traffic on `port`.
    ///
    /// Rules are evaluated in order and the first whose port range covers
    /// `port` decides. Address restrictions are not evaluated.
    pub fn exits_to_port(&self, port: u16) -> bool {
        self.exit_policy
            .iter()
            .find(|rule| rule.is_port_match(port))
            .is_some_and(|rule| rule.is_accept)
    }
}

impl Record for ServerDescriptorRecord {
    fn parse_all(content: &str, kind: DocumentKind) -> Vec<Self> {
        Self::parse_all_bytes(content.as_bytes(), kind)
    }

    fn parse_all_bytes(content: &[u8], _kind: DocumentKind) -> Vec<Self> {
        descriptor_blocks(content)
            .into_iter()
            .filter_map(|block| match Self::parse_bytes(block) {
                Ok(record) => Some(record),
                Err(err) => {
                    debug!(%err, "dropping unparseable server descriptor");
                    None
                }
            })
            .collect()
    }
}

/// Computes the lowercase hex SHA-1 digest of a descriptor's signed content.
///
/// Returns `None` if the content has no `router-signature` line.
pub fn compute_digest(content: impl AsRef<[u8]>) -> Option<String> {
    let signed = find_digest_content(content.as_ref())?;
    let mut hasher = Sha1::new();
    hasher.update(signed);
    Some(
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect(),
    )
}

fn find_digest_content(content: &[u8]) -> Option<&[u8]> {
    let start_marker: &[u8] = b"router ";
    let end_marker: &[u8] = b"\nrouter-signature\n";
    let start = if content.starts_with(start_marker) {
        0
    } else {
        find_bytes(content, b"\nrouter ")? + 1
    };
    let end = find_bytes(&content[start..], end_marker)? + start;
    Some(&content[start..end + end_marker.len()])
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn descriptor_blocks(content: &[u8]) -> Vec<&[u8]> {
    let mut starts: Vec<usize> = Vec::new();
    let mut offset = 0;
    for line in content.split_inclusive(|b| *b == b'\n') {
        if line.starts_with(b"router ") {
            starts.push(offset);
        }
        offset += line.len();
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(content.len());
            &content[start..end]
        })
        .collect()
}

struct RouterLine {
    nickname: String,
    address: IpAddr,
    or_port: u16,
    socks_port: Option<u16>,
    dir_port: Option<u16>,
}

impl RouterLine {
    /// `router <nickname> <address> <ORPort> <SOCKSPort> <DirPort>`
    fn parse(value: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() < 5 {
            return Err(Error::Parse {
                location: "router".to_string(),
                reason: "router line requires 5 fields".to_string(),
            });
        }

        let address = parts[1].parse().map_err(|_| Error::Parse {
            location: "router".to_string(),
            reason: format!("invalid address: {}", parts[1]),
        })?;
        let port = |idx: usize, name: &str| -> Result<u16, Error> {
            parts[idx].parse().map_err(|_| Error::Parse {
                location: "router".to_string(),
                reason: format!("invalid {}: {}", name, parts[idx]),
            })
        };
        let or_port = port(2, "or_port")?;
        let socks_port = Some(port(3, "socks_port")?).filter(|p| *p != 0);
        let dir_port = Some(port(4, "dir_port")?).filter(|p| *p != 0);

        Ok(Self {
            nickname: parts[0].to_string(),
            address,
            or_port,
            socks_port,
            dir_port,
        })
    }
}

fn parse_bandwidth(value: &str) -> Option<DescriptorBandwidth> {
    let mut parts = value.split_whitespace().map(|p| p.parse::<u64>().ok());
    Some(DescriptorBandwidth {
        average: parts.next()??,
        burst: parts.next()??,
        observed: parts.next()??,
    })
}

fn scan_family(content: &str) -> BTreeSet<String> {
    FAMILY_PATTERN
        .captures_iter(content)
        .flat_map(|caps| {
            let first = caps.get(1).map_or("", |m| m.as_str());
            let rest = caps.get(2).map_or("", |m| m.as_str());
            format!("{} {}", first, rest)
                .split_whitespace()
                .map(|member| member.strip_prefix('$').unwrap_or(member).to_string())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn scan_exit_policy(content: &str) -> Vec<ExitPolicyRule> {
    EXIT_POLICY_PATTERN
        .captures_iter(content)
        .filter_map(|caps| {
            let rule = caps.get(1)?.as_str();
            match ExitPolicyRule::parse(rule) {
                Ok(rule) => Some(rule),
                Err(err) => {
                    debug!(%err, "skipping exit policy rule");
                    None
                }
            }
        })
        .collect()
}
