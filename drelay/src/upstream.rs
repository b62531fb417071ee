// Copyright 2024 Yann Prado
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Upstream groups and the handle for the default upstream list.

use regex::Regex;
use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, RwLock},
};

/// Port appended to server strings that do not carry one.
const DEFAULT_PORT: u16 = 53;

/// A named group of DNS servers selected together by a common set of regex
/// patterns. Immutable once constructed; replaced wholesale on reload.
#[derive(Debug, Clone)]
pub struct Upstream {
    /// Group name, used in logs only.
    pub name: String,
    /// Server addresses in author order, normalized to `host:port`.
    pub servers: Vec<String>,
    /// Compiled query-name patterns in author order.
    pub patterns: Vec<Regex>,
}

impl Upstream {
    /// Create a group, normalizing every server string to carry an explicit port.
    pub fn new(name: impl Into<String>, servers: Vec<String>, patterns: Vec<Regex>) -> Self {
        Self {
            name: name.into(),
            servers: servers.iter().map(|s| normalize_server(s)).collect(),
            patterns,
        }
    }
}

/// Normalize a configured server string to `host:port`.
///
/// Bare hosts and IP addresses get port 53, IPv6 literals are bracketed, and
/// strings already carrying a port are returned unchanged.
pub fn normalize_server(server: &str) -> String {
    if server.parse::<SocketAddr>().is_ok() {
        return server.to_owned();
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_PORT).to_string();
    }
    match server.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => server.to_owned(),
        _ => format!("{}:{}", server, DEFAULT_PORT),
    }
}

/// Handle to the default upstream list consulted after the match table.
///
/// Writers publish a whole new list; readers clone the inner `Arc` out and can
/// never observe a half-written state.
pub struct DefaultsHandle {
    current: RwLock<Arc<Vec<String>>>,
}

impl DefaultsHandle {
    /// Create a handle holding an empty list.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Replace the list wholesale. Entries are expected to be normalized already.
    pub fn replace(&self, servers: Vec<String>) {
        *self.current.write().unwrap() = Arc::new(servers);
    }

    /// Snapshot of the current list.
    pub fn snapshot(&self) -> Arc<Vec<String>> {
        self.current.read().unwrap().clone()
    }
}

impl Default for DefaultsHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_server, DefaultsHandle, Upstream};
    use regex::Regex;

    #[test]
    fn normalization() {
        assert_eq!(normalize_server("8.8.8.8"), "8.8.8.8:53");
        assert_eq!(normalize_server("8.8.8.8:5353"), "8.8.8.8:5353");
        assert_eq!(
            normalize_server("2606:4700:4700::1111"),
            "[2606:4700:4700::1111]:53"
        );
        assert_eq!(normalize_server("[::1]:5353"), "[::1]:5353");
        assert_eq!(normalize_server("dns.corp.internal"), "dns.corp.internal:53");
        assert_eq!(normalize_server("dns.corp.internal:53"), "dns.corp.internal:53");
    }

    #[test]
    fn normalization_is_idempotent() {
        for s in [
            "8.8.8.8",
            "8.8.8.8:5353",
            "2606:4700:4700::1111",
            "dns.corp.internal",
            "[::1]:53",
        ] {
            let once = normalize_server(s);
            assert_eq!(normalize_server(&once), once);
        }
    }

    #[test]
    fn group_servers_are_normalized() {
        let u = Upstream::new(
            "corp",
            vec!["10.0.0.1".into(), "10.0.0.2:5353".into()],
            vec![Regex::new(r"^.*\.corp\.$").unwrap()],
        );
        assert_eq!(u.servers, vec!["10.0.0.1:53", "10.0.0.2:5353"]);
    }

    #[test]
    fn defaults_replace_and_snapshot() {
        let handle = DefaultsHandle::new();
        assert!(handle.snapshot().is_empty());

        let before = handle.snapshot();
        handle.replace(vec!["1.1.1.1:53".into()]);
        // The old snapshot is untouched, the new one is visible.
        assert!(before.is_empty());
        assert_eq!(*handle.snapshot(), vec!["1.1.1.1:53".to_owned()]);
    }
}
