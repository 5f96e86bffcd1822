//! Router status entries from consensus and bridge status documents.
//!
//! Each relay listed in a status document is described by a short block of
//! lines introduced by an `r` line:
//!
//! ```text
//! r caerSidi p1aag7VwarGxqctS7/fS0y5FU+s oQZFLYe9e4A7bOkWKR7TaNxb0JE 2024-01-15 06:41:52 71.35.133.197 9001 0
//! a [2001:db8::1]:9001
//! s Fast Named Running Stable Valid
//! v Tor 0.4.8.10
//! pr Cons=1-2 Desc=1-2 Link=1-5
//! w Bandwidth=1360 Measured=1200
//! p reject 1-65535
//! ```
//!
//! | Keyword | Required | Description |
//! |---------|----------|-------------|
//! | `r` | yes | Nickname, identity, descriptor digest, publication, address, ports |
//! | `a` | no | Additional OR addresses (the first IPv6 one is kept) |
//! | `s` | yes | Flags |
//! | `v` | no | Advertised version (never present in bridge statuses) |
//! | `pr` | no | Protocol versions |
//! | `w` | yes | Bandwidth weight, must carry `Bandwidth=` |
//! | `p` | no | Exit port summary |
//!
//! A block ends at the next `r` line or at the first line whose keyword does
//! not belong to an entry (`directory-footer`, `bandwidth-weights`...). Blocks
//! that lack a required line are dropped.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::{DocumentKind, Record};
use crate::exit_policy::MicroExitPolicy;
use crate::util::base64_to_hex;
use crate::Error;

const ENTRY_KEYWORDS: &[&str] = &["r", "a", "s", "v", "pr", "w", "p", "m", "id"];

/// One relay as listed in a status document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterStatusRecord {
    /// Relay nickname.
    pub nickname: String,
    /// Identity key digest exactly as published (unpadded base64).
    pub identity: String,
    /// Identity key digest as uppercase hex, the relay's fingerprint.
    pub fingerprint: String,
    /// Server descriptor digest as lowercase hex, the key used to resolve the
    /// relay's descriptor.
    pub digest: String,
    /// Publication time of the referenced descriptor.
    pub published: DateTime<Utc>,
    /// IPv4 address.
    pub address: IpAddr,
    /// OR port.
    pub or_port: u16,
    /// Directory port, `None` when published as 0.
    pub dir_port: Option<u16>,
    /// Additional OR addresses from `a` lines.
    pub or_addresses: Vec<SocketAddr>,
    /// Flags in the order listed.
    pub flags: Vec<String>,
    /// Raw `v` line content, such as `Tor 0.4.8.10`.
    pub version_line: Option<String>,
    /// Supported protocol versions from the `pr` line.
    pub protocols: Option<BTreeMap<String, Vec<u32>>>,
    /// Bandwidth weight.
    pub bandwidth: u64,
    /// Bandwidth measured by the bandwidth authorities.
    pub measured: Option<u64>,
    /// Whether the weight is based on too few measurements.
    pub is_unmeasured: bool,
    /// Exit port summary from the `p` line.
    pub exit_policy: Option<MicroExitPolicy>,
}

impl RouterStatusRecord {
    /// Parses a single entry block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the `r`, `s` or `w` line is missing or
    /// the `r` line is malformed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use relay_history::descriptor::RouterStatusRecord;
    ///
    /// let entry = "r caerSidi p1aag7VwarGxqctS7/fS0y5FU+s oQZFLYe9e4A7bOkWKR7TaNxb0JE 2024-01-15 06:41:52 71.35.133.197 9001 0\n\
    ///              s Fast Running\n\
    ///              w Bandwidth=1360\n";
    /// let record = RouterStatusRecord::parse(entry).unwrap();
    /// assert_eq!(record.fingerprint, "A7569A83B5706AB1B1A9CB52EFF7D2D32E4553EB");
    /// assert_eq!(record.bandwidth, 1360);
    /// assert!(record.version_line.is_none());
    /// ```
    pub fn parse(content: &str) -> Result<Self, Error> {
        let mut header: Option<RLine> = None;
        let mut or_addresses = Vec::new();
        let mut flags: Option<Vec<String>> = None;
        let mut version_line = None;
        let mut protocols = None;
        let mut bandwidth: Option<u64> = None;
        let mut measured = None;
        let mut is_unmeasured = false;
        let mut exit_policy = None;

        for line in content.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let (keyword, value) = match line.find(' ') {
                Some(space_pos) => (&line[..space_pos], line[space_pos + 1..].trim()),
                None => (line, ""),
            };

            match keyword {
                "r" => header = Some(RLine::parse(value)?),
                "a" => {
                    if let Ok(addr) = value.parse::<SocketAddr>() {
                        or_addresses.push(addr);
                    }
                }
                "s" => flags = Some(value.split_whitespace().map(str::to_string).collect()),
                "v" => version_line = Some(value.to_string()),
                "pr" => protocols = Some(parse_protocols(value)),
                "w" => {
                    for entry in value.split_whitespace() {
                        match entry.split_once('=') {
                            Some(("Bandwidth", val)) => bandwidth = val.parse().ok(),
                            Some(("Measured", val)) => measured = val.parse().ok(),
                            Some(("Unmeasured", val)) => is_unmeasured = val == "1",
                            _ => {}
                        }
                    }
                }
                "p" => exit_policy = MicroExitPolicy::parse(value).ok(),
                _ => {}
            }
        }

        let header = header.ok_or_else(|| Error::Parse {
            location: "r".to_string(),
            reason: "missing r line".to_string(),
        })?;
        let flags = flags.ok_or_else(|| Error::Parse {
            location: "s".to_string(),
            reason: format!("entry for {} has no s line", header.nickname),
        })?;
        let bandwidth = bandwidth.ok_or_else(|| Error::Parse {
            location: "w".to_string(),
            reason: format!("entry for {} has no bandwidth weight", header.nickname),
        })?;

        Ok(Self {
            nickname: header.nickname,
            identity: header.identity,
            fingerprint: header.fingerprint,
            digest: header.digest,
            published: header.published,
            address: header.address,
            or_port: header.or_port,
            dir_port: header.dir_port,
            or_addresses,
            flags,
            version_line,
            protocols,
            bandwidth,
            measured,
            is_unmeasured,
            exit_policy,
        })
    }

    /// The first IPv6 OR address, if any.
    pub fn ipv6_address(&self) -> Option<SocketAddr> {
        self.or_addresses.iter().copied().find(SocketAddr::is_ipv6)
    }

    /// The advertised version without the `Tor ` prefix.
    pub fn version(&self) -> Option<&str> {
        let line = self.version_line.as_deref()?;
        Some(line.strip_prefix("Tor ").unwrap_or(line))
    }

    /// Whether the relay was assigned `flag`.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

impl Record for RouterStatusRecord {
    fn parse_all(content: &str, _kind: DocumentKind) -> Vec<Self> {
        entry_blocks(content)
            .into_iter()
            .filter_map(|block| match Self::parse(&block) {
                Ok(record) => Some(record),
                Err(err) => {
                    debug!(%err, "dropping incomplete router status entry");
                    None
                }
            })
            .collect()
    }
}

struct RLine {
    nickname: String,
    identity: String,
    fingerprint: String,
    digest: String,
    published: DateTime<Utc>,
    address: IpAddr,
    or_port: u16,
    dir_port: Option<u16>,
}

impl RLine {
    fn parse(value: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() < 8 {
            return Err(Error::Parse {
                location: "r".to_string(),
                reason: "r line requires 8 fields".to_string(),
            });
        }

        let fingerprint = base64_to_hex(parts[1], true).ok_or_else(|| Error::Parse {
            location: "r".to_string(),
            reason: format!("invalid identity: {}", parts[1]),
        })?;
        let digest = base64_to_hex(parts[2], false).ok_or_else(|| Error::Parse {
            location: "r".to_string(),
            reason: format!("invalid digest: {}", parts[2]),
        })?;
        let datetime_str = format!("{} {}", parts[3], parts[4]);
        let published = NaiveDateTime::parse_from_str(&datetime_str, "%Y-%m-%d %H:%M:%S")
            .map_err(|e| Error::Parse {
                location: "r".to_string(),
                reason: format!("invalid datetime: {} - {}", datetime_str, e),
            })?
            .and_utc();
        let address = parts[5].parse().map_err(|_| Error::Parse {
            location: "r".to_string(),
            reason: format!("invalid address: {}", parts[5]),
        })?;
        let or_port = parts[6].parse().map_err(|_| Error::Parse {
            location: "r".to_string(),
            reason: format!("invalid or_port: {}", parts[6]),
        })?;
        let dir_port: u16 = parts[7].parse().map_err(|_| Error::Parse {
            location: "r".to_string(),
            reason: format!("invalid dir_port: {}", parts[7]),
        })?;

        Ok(Self {
            nickname: parts[0].to_string(),
            identity: parts[1].to_string(),
            fingerprint,
            digest,
            published,
            address,
            or_port,
            dir_port: if dir_port == 0 { None } else { Some(dir_port) },
        })
    }
}

fn entry_blocks(content: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let keyword = line.split(' ').next().unwrap_or("");
        if keyword == "r" {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            current = Some(String::new());
        } else if line.trim().is_empty() {
            continue;
        } else if !ENTRY_KEYWORDS.contains(&keyword) {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            continue;
        }

        if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
        }
    }

    blocks.extend(current);
    blocks
}

/// Highest subprotocol version tor itself accepts in a protocol list.
const MAX_PROTOCOL_VERSION: u32 = 63;

/// Parses `Proto=versions` pairs, where versions may be ranges (`1-4`).
///
/// Versions above [`MAX_PROTOCOL_VERSION`] and inverted ranges are skipped.
pub(crate) fn parse_protocols(value: &str) -> BTreeMap<String, Vec<u32>> {
    let mut protocols = BTreeMap::new();
    for entry in value.split_whitespace() {
        if let Some((proto_name, versions_str)) = entry.split_once('=') {
            let versions: Vec<u32> = versions_str
                .split(',')
                .filter_map(|v| match v.split_once('-') {
                    Some((start, end)) => {
                        let start: u32 = start.parse().ok()?;
                        let end: u32 = end.parse().ok()?;
                        if start > end || end > MAX_PROTOCOL_VERSION {
                            debug!(protocol = proto_name, range = v, "skipping protocol range");
                            return None;
                        }
                        Some((start..=end).collect::<Vec<_>>())
                    }
                    None => v
                        .parse()
                        .ok()
                        .filter(|n| *n <= MAX_PROTOCOL_VERSION)
                        .map(|n| vec![n]),
                })
                .flatten()
                .collect();
            protocols.insert(proto_name.to_string(), versions);
        }
    }
    protocols
}
