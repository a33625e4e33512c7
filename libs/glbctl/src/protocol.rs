//! Text protocol spoken on the glbd control socket.
//!
//! Commands are single lines:
//! - `<addr>:<port>:<weight>` adds, re-weights or (weight `-1`) removes a destination
//! - `getinfo` dumps the router table
//!
//! The router table looks like:
//!
//! ```text
//! Router:
//! ------------------------------------------------------
//!         Address       :   weight   usage    map  conns
//!  10.0.0.5:8080        :    1.000   0.000    N/A      0
//! ------------------------------------------------------
//! Destinations: 1, total connections: 0 of 493 max
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::error::{GlbCtlError, Result};

/// Command requesting the router table.
pub const GETINFO: &str = "getinfo";

/// Prefix of the summary line closing a `getinfo` reply.
pub const SUMMARY_PREFIX: &str = "Destinations:";

/// Reply fragment glbd uses when an update names a destination it does not route to.
pub const UNKNOWN_DESTINATION: &str = "no such destination";

/// A destination address as glbd keys it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port` or `[v6]:port`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (host, port) = raw.trim().rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']')?,
            None if host.contains(':') => return None,
            None => host,
        };
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One row of the router table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouterEntry {
    pub weight: f64,
    pub connections: u64,
}

/// Encode a weight update command (without the trailing newline).
pub fn encode_update(node: &Node, weight: i32) -> String {
    format!("{node}:{weight}")
}

/// Interpret the single-line reply to an update command.
pub fn parse_reply(line: &str) -> Result<()> {
    let line = line.trim();
    if line.eq_ignore_ascii_case("ok") {
        Ok(())
    } else if line.to_ascii_lowercase().contains(UNKNOWN_DESTINATION) {
        Err(GlbCtlError::UnknownDestination(line.to_string()))
    } else {
        Err(GlbCtlError::Rejected(line.to_string()))
    }
}

/// Parse a single router row; headers and rulers yield `None`.
pub fn parse_router_row(line: &str) -> Option<(Node, RouterEntry)> {
    let (addr, rest) = line.split_once(" : ")?;
    let node = Node::parse(addr)?;

    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 2 {
        return None;
    }

    let weight = fields[0].parse::<f64>().ok()?;
    let connections = fields[fields.len() - 1].parse::<u64>().ok()?;

    Some((
        node,
        RouterEntry {
            weight,
            connections,
        },
    ))
}

/// Parse a full `getinfo` reply into the router table.
pub fn parse_router(text: &str) -> HashMap<Node, RouterEntry> {
    text.lines().filter_map(parse_router_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const GETINFO_REPLY: &str = "Router:
------------------------------------------------------
        Address       :   weight   usage    map  conns
 10.0.0.5:8080        :    1.000   0.000    N/A      3
 10.0.0.6:8080        :    0.000   0.000    N/A      0
 [fd00::7]:80         :    1.000   0.500    N/A     12
------------------------------------------------------
Destinations: 3, total connections: 15 of 493 max
";

    #[rstest]
    #[case("10.0.0.5:8080", Some(Node::new("10.0.0.5", 8080)))]
    #[case("backend.local:80", Some(Node::new("backend.local", 80)))]
    #[case("[fd00::1]:443", Some(Node::new("fd00::1", 443)))]
    #[case("fd00::1:443", None)]
    #[case("10.0.0.5", None)]
    #[case(":80", None)]
    #[case("10.0.0.5:http", None)]
    fn test_node_parse(#[case] raw: &str, #[case] expected: Option<Node>) {
        assert_eq!(Node::parse(raw), expected);
    }

    #[test]
    fn test_node_display_brackets_ipv6() {
        assert_eq!(Node::new("fd00::1", 80).to_string(), "[fd00::1]:80");
        assert_eq!(Node::new("10.0.0.1", 80).to_string(), "10.0.0.1:80");
    }

    #[test]
    fn test_encode_update() {
        let node = Node::new("10.0.0.5", 8080);
        assert_eq!(encode_update(&node, 1), "10.0.0.5:8080:1");
        assert_eq!(encode_update(&node, -1), "10.0.0.5:8080:-1");
    }

    #[rstest]
    #[case("Ok\n", true)]
    #[case("OK", true)]
    #[case("Error: bad address\n", false)]
    #[case("", false)]
    fn test_parse_reply(#[case] line: &str, #[case] ok: bool) {
        assert_eq!(parse_reply(line).is_ok(), ok);
    }

    #[test]
    fn test_parse_reply_tells_unknown_destination_apart() {
        assert!(matches!(
            parse_reply("Error: No such destination\n"),
            Err(GlbCtlError::UnknownDestination(_))
        ));
        assert!(matches!(
            parse_reply("Error: -22 (Invalid argument)\n"),
            Err(GlbCtlError::Rejected(msg)) if msg == "Error: -22 (Invalid argument)"
        ));
    }

    #[test]
    fn test_parse_router_table() {
        let table = parse_router(GETINFO_REPLY);
        assert_eq!(table.len(), 3);

        let serving = table[&Node::new("10.0.0.5", 8080)];
        assert_eq!(serving.weight, 1.0);
        assert_eq!(serving.connections, 3);

        let drained = table[&Node::new("10.0.0.6", 8080)];
        assert_eq!(drained.weight, 0.0);
        assert_eq!(drained.connections, 0);

        let v6 = table[&Node::new("fd00::7", 80)];
        assert_eq!(v6.weight, 1.0);
        assert_eq!(v6.connections, 12);
    }

    #[test]
    fn test_parse_router_ignores_garbage_rows() {
        assert!(parse_router_row("        Address       :   weight   usage    map  conns").is_none());
        assert!(parse_router_row("------------------------------------").is_none());
        assert!(parse_router_row(" 10.0.0.5:8080 : heavy 0.0 N/A 0").is_none());
    }
}
