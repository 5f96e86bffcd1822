//! Exit policy rules and consensus port summaries.
//!
//! Server descriptors list their exit policy as an ordered sequence of
//! `accept`/`reject` lines, evaluated first match wins. Consensus entries
//! carry only a compact `p` line summarising which ports the relay exits to.
//!
//! # Example
//!
//! ```rust
//! use relay_history::exit_policy::{ExitPolicyRule, MicroExitPolicy};
//!
//! let rule = ExitPolicyRule::parse("accept *:80").unwrap();
//! assert!(rule.is_accept);
//! assert!(rule.is_port_match(80));
//!
//! let summary = MicroExitPolicy::parse("reject 1-65535").unwrap();
//! assert!(!summary.can_exit_to(443));
//! ```

use std::fmt;

use serde::Serialize;

use crate::Error;

/// An inclusive range of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortRange {
    /// Lowest port of the range.
    pub min: u16,
    /// Highest port of the range.
    pub max: u16,
}

impl PortRange {
    /// Creates a range, failing when `min > max`.
    pub fn new(min: u16, max: u16) -> Result<Self, Error> {
        if min > max {
            return Err(Error::Parse {
                location: format!("{}-{}", min, max),
                reason: "min port greater than max port".to_string(),
            });
        }
        Ok(Self { min, max })
    }

    /// A range covering a single port.
    pub fn single(port: u16) -> Self {
        Self {
            min: port,
            max: port,
        }
    }

    /// Whether `port` falls within the range.
    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }

    fn parse(portspec: &str) -> Result<Self, Error> {
        if portspec == "*" {
            return Ok(Self { min: 1, max: 65535 });
        }

        if let Some((min_str, max_str)) = portspec.split_once('-') {
            let min: u16 = min_str.parse().map_err(|_| Error::Parse {
                location: portspec.to_string(),
                reason: "invalid min port".to_string(),
            })?;
            let max: u16 = max_str.parse().map_err(|_| Error::Parse {
                location: portspec.to_string(),
                reason: "invalid max port".to_string(),
            })?;
            return Self::new(min, max);
        }

        let port: u16 = portspec.parse().map_err(|_| Error::Parse {
            location: portspec.to_string(),
            reason: "invalid port".to_string(),
        })?;
        Ok(Self::single(port))
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == 1 && self.max == 65535 {
            write!(f, "*")
        } else if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// A single `accept`/`reject` line of a descriptor's exit policy.
///
/// The address part is kept as written (`*`, `*4`, `10.0.0.0/8`,
/// `[::1]`...). Only the port part is interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitPolicyRule {
    /// Whether this rule accepts (`true`) or rejects (`false`) matching traffic.
    pub is_accept: bool,
    /// Whether the rule came from an `accept6`/`reject6` line.
    pub is_ipv6_only: bool,
    /// Address specification as written in the descriptor.
    pub address: String,
    /// Ports the rule applies to.
    pub ports: PortRange,
}

impl ExitPolicyRule {
    /// Parses a rule such as `reject *:25` or `accept6 [::]/0:443`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the line does not start with an action or
    /// has no `address:port` pattern.
    pub fn parse(rule: &str) -> Result<Self, Error> {
        let rule = rule.trim();
        let (keyword, exitpattern) = rule.split_once(' ').ok_or_else(|| Error::Parse {
            location: rule.to_string(),
            reason: "rule must be '<action> <addrspec>:<portspec>'".to_string(),
        })?;

        let (is_accept, is_ipv6_only) = match keyword {
            "accept" => (true, false),
            "reject" => (false, false),
            "accept6" => (true, true),
            "reject6" => (false, true),
            _ => {
                return Err(Error::Parse {
                    location: rule.to_string(),
                    reason: "rule must start with accept/reject".to_string(),
                })
            }
        };

        let (address, portspec) = Self::split_addr_port(exitpattern.trim())?;
        Ok(Self {
            is_accept,
            is_ipv6_only,
            address: address.to_string(),
            ports: PortRange::parse(portspec)?,
        })
    }

    /// Whether the rule's port range covers `port`.
    pub fn is_port_match(&self, port: u16) -> bool {
        self.ports.contains(port)
    }

    fn split_addr_port(exitpattern: &str) -> Result<(&str, &str), Error> {
        if exitpattern.starts_with('[') {
            if let Some(bracket_end) = exitpattern.find(']') {
                let after_bracket = &exitpattern[bracket_end + 1..];
                if let Some(colon_pos) = after_bracket.find(':') {
                    return Ok((
                        &exitpattern[..bracket_end + 1 + colon_pos],
                        &after_bracket[colon_pos + 1..],
                    ));
                }
            }
            return Err(Error::Parse {
                location: exitpattern.to_string(),
                reason: "malformed IPv6 address".to_string(),
            });
        }

        exitpattern.rsplit_once(':').ok_or_else(|| Error::Parse {
            location: exitpattern.to_string(),
            reason: "exitpattern must be addrspec:portspec".to_string(),
        })
    }
}

impl fmt::Display for ExitPolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = if self.is_accept { "accept" } else { "reject" };
        let suffix = if self.is_ipv6_only { "6" } else { "" };
        write!(f, "{}{} {}:{}", action, suffix, self.address, self.ports)
    }
}

/// The port summary from a consensus `p` line, such as `accept 80,443`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MicroExitPolicy {
    /// Whether the listed ports are accepted (`true`) or rejected (`false`).
    pub is_accept: bool,
    /// The listed port ranges.
    pub ports: Vec<PortRange>,
}

impl MicroExitPolicy {
    /// Parses `accept|reject port[,port...]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the action is missing or a port is invalid.
    pub fn parse(content: &str) -> Result<Self, Error> {
        let content = content.trim();
        let (is_accept, port_list) = if let Some(rest) = content.strip_prefix("accept ") {
            (true, rest.trim())
        } else if let Some(rest) = content.strip_prefix("reject ") {
            (false, rest.trim())
        } else {
            return Err(Error::Parse {
                location: content.to_string(),
                reason: "port summary must start with accept/reject".to_string(),
            });
        };

        let ports = port_list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(PortRange::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { is_accept, ports })
    }

    /// Whether traffic to `port` is allowed by the summary.
    pub fn can_exit_to(&self, port: u16) -> bool {
        let listed = self.ports.iter().any(|range| range.contains(port));
        listed == self.is_accept
    }
}

impl fmt::Display for MicroExitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = if self.is_accept { "accept" } else { "reject" };
        let ports: Vec<String> = self.ports.iter().map(|p| p.to_string()).collect();
        write!(f, "{} {}", action, ports.join(","))
    }
}
