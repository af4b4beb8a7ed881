//! Server and topology descriptions.
//!
//! A [`TopologyDescription`] is an immutable snapshot. Heartbeat results
//! are folded in with [`TopologyDescription::apply`], which returns a new
//! snapshot; [`Topology`] holds the current one and notifies watchers when
//! it is replaced.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use lodestar_bson::{Bson, Document};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{DriverError, DriverResult};

pub const DEFAULT_PORT: u16 = 27017;

/// Weight of a new round-trip sample in the moving average.
const RTT_ALPHA: f64 = 0.2;

/// A server's host and port. Hosts compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Parse `host`, `host:port` or `[v6]:port`.
    pub fn parse(text: &str) -> DriverResult<Self> {
        let text = text.trim();
        let invalid = |reason: &str| DriverError::configuration(format!("invalid server address '{text}': {reason}"));
        let (host, port) = if let Some(rest) = text.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => return Err(invalid("unexpected text after ']'")),
            }
        } else {
            match text.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (text, None),
            }
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = match port {
            Some(port) => port.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(|| invalid("bad port"))?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for ServerAddress {
    type Err = DriverError;

    fn from_str(s: &str) -> DriverResult<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerType {
    Unknown,
    Standalone,
    Mongos,
    RsPrimary,
    RsSecondary,
    RsArbiter,
    RsOther,
    RsGhost,
}

impl ServerType {
    pub fn is_replica_set_member(self) -> bool {
        matches!(
            self,
            Self::RsPrimary | Self::RsSecondary | Self::RsArbiter | Self::RsOther | Self::RsGhost
        )
    }

    /// Data-bearing and able to serve reads or writes.
    pub fn is_data_bearing(self) -> bool {
        matches!(self, Self::Standalone | Self::Mongos | Self::RsPrimary | Self::RsSecondary)
    }
}

/// What one heartbeat learned about one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub server_type: ServerType,
    pub round_trip_time: Option<Duration>,
    pub set_name: Option<String>,
    /// Members the server reports, for replica set members.
    pub hosts: Vec<ServerAddress>,
    /// The primary the server believes in.
    pub primary: Option<ServerAddress>,
    pub max_wire_version: i32,
    pub error: Option<String>,
}

impl ServerDescription {
    pub fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            round_trip_time: None,
            set_name: None,
            hosts: Vec::new(),
            primary: None,
            max_wire_version: 0,
            error: None,
        }
    }

    /// A server whose check failed.
    pub fn failed(address: ServerAddress, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::unknown(address)
        }
    }

    /// Describe a server from its `hello` reply.
    pub fn from_hello(address: ServerAddress, reply: &Document, round_trip_time: Duration) -> Self {
        let flag = |name: &str| reply.get(name).is_some_and(Bson::is_truthy);
        if reply.get("ok").and_then(Bson::to_f64_lossy) != Some(1.0) {
            return Self::failed(address, "hello did not return ok");
        }
        let set_name = reply.get("setName").and_then(Bson::as_str).map(str::to_string);
        let server_type = if reply.get("msg").and_then(Bson::as_str) == Some("isdbgrid") {
            ServerType::Mongos
        } else if set_name.is_some() {
            if flag("isWritablePrimary") || flag("ismaster") {
                ServerType::RsPrimary
            } else if flag("secondary") {
                ServerType::RsSecondary
            } else if flag("arbiterOnly") {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if flag("isreplicaset") {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        };
        let hosts = ["hosts", "passives", "arbiters"]
            .iter()
            .filter_map(|key| reply.get(key).and_then(Bson::as_array))
            .flatten()
            .filter_map(|host| host.as_str().and_then(|h| ServerAddress::parse(h).ok()))
            .collect();
        Self {
            address,
            server_type,
            round_trip_time: Some(round_trip_time),
            set_name,
            hosts,
            primary: reply
                .get("primary")
                .and_then(Bson::as_str)
                .and_then(|p| ServerAddress::parse(p).ok()),
            max_wire_version: reply.get("maxWireVersion").and_then(Bson::to_i64_exact).unwrap_or(0) as i32,
            error: None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.server_type != ServerType::Unknown
    }
}

impl fmt::Display for ServerDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ {}: {:?}", self.address, self.server_type)?;
        if let Some(rtt) = self.round_trip_time {
            write!(f, ", rtt {}ms", rtt.as_millis())?;
        }
        if let Some(error) = &self.error {
            write!(f, ", error \"{error}\"")?;
        }
        f.write_str(" }")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyType {
    Unknown,
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
}

/// An immutable view of the deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyDescription {
    topology_type: TopologyType,
    set_name: Option<String>,
    servers: IndexMap<ServerAddress, ServerDescription>,
}

impl TopologyDescription {
    /// The starting view: every seed unknown.
    pub fn new(seeds: &[ServerAddress], set_name: Option<String>, direct_connection: bool) -> Self {
        let topology_type = if direct_connection && seeds.len() == 1 {
            TopologyType::Single
        } else if set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };
        Self {
            topology_type,
            set_name,
            servers: seeds
                .iter()
                .map(|address| (address.clone(), ServerDescription::unknown(address.clone())))
                .collect(),
        }
    }

    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers().find(|s| s.server_type == ServerType::RsPrimary)
    }

    pub fn has_known_servers(&self) -> bool {
        self.servers().any(ServerDescription::is_known)
    }

    /// Fold one heartbeat result into a new snapshot.
    ///
    /// Results for servers no longer in the topology are ignored. Servers
    /// whose type or set name is incompatible with the topology are removed.
    pub fn apply(&self, description: ServerDescription) -> Self {
        let mut next = self.clone();
        let Some(previous) = next.servers.get(&description.address) else {
            debug!(address = %description.address, "ignoring result for removed server");
            return next;
        };
        let description = smooth_round_trip(previous, description);

        match next.topology_type {
            TopologyType::Single => next.insert(description),
            TopologyType::Unknown => match description.server_type {
                ServerType::Standalone => {
                    if next.servers.len() == 1 {
                        next.topology_type = TopologyType::Single;
                        next.insert(description);
                    } else {
                        next.remove(&description.address);
                    }
                }
                ServerType::Mongos => {
                    next.topology_type = TopologyType::Sharded;
                    next.insert(description);
                }
                ServerType::RsPrimary => {
                    next.topology_type = TopologyType::ReplicaSetWithPrimary;
                    next.update_from_primary(description);
                }
                ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                    next.topology_type = TopologyType::ReplicaSetNoPrimary;
                    next.update_without_primary(description);
                }
                ServerType::Unknown | ServerType::RsGhost => next.insert(description),
            },
            TopologyType::Sharded => match description.server_type {
                ServerType::Unknown | ServerType::Mongos => next.insert(description),
                _ => next.remove(&description.address),
            },
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
                match description.server_type {
                    ServerType::Standalone | ServerType::Mongos => next.remove(&description.address),
                    ServerType::RsPrimary => next.update_from_primary(description),
                    ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                        next.update_without_primary(description)
                    }
                    ServerType::Unknown | ServerType::RsGhost => next.insert(description),
                }
                next.topology_type = if next.primary().is_some() {
                    TopologyType::ReplicaSetWithPrimary
                } else {
                    TopologyType::ReplicaSetNoPrimary
                };
            }
        }
        next
    }

    fn insert(&mut self, description: ServerDescription) {
        self.servers.insert(description.address.clone(), description);
    }

    fn remove(&mut self, address: &ServerAddress) {
        debug!(address = %address, "removing server from topology");
        self.servers.shift_remove(address);
    }

    fn add_unknown_hosts(&mut self, hosts: &[ServerAddress]) {
        for host in hosts {
            if !self.servers.contains_key(host) {
                self.servers.insert(host.clone(), ServerDescription::unknown(host.clone()));
            }
        }
    }

    fn set_name_conflicts(&self, description: &ServerDescription) -> bool {
        match (&self.set_name, &description.set_name) {
            (Some(expected), Some(actual)) => expected != actual,
            _ => false,
        }
    }

    /// The primary's member list is authoritative.
    fn update_from_primary(&mut self, description: ServerDescription) {
        if self.set_name_conflicts(&description) {
            self.remove(&description.address);
            return;
        }
        if self.set_name.is_none() {
            self.set_name = description.set_name.clone();
        }
        let address = description.address.clone();
        for server in self.servers.values_mut() {
            if server.address != address && server.server_type == ServerType::RsPrimary {
                info!(address = %server.address, "demoting stale primary");
                *server = ServerDescription::unknown(server.address.clone());
            }
        }
        let hosts = description.hosts.clone();
        self.insert(description);
        self.add_unknown_hosts(&hosts);
        self.servers
            .retain(|candidate, _| candidate == &address || hosts.contains(candidate));
    }

    fn update_without_primary(&mut self, description: ServerDescription) {
        if self.set_name_conflicts(&description) {
            self.remove(&description.address);
            return;
        }
        if self.set_name.is_none() {
            self.set_name = description.set_name.clone();
        }
        let hosts = description.hosts.clone();
        let has_primary = self.primary().is_some();
        self.insert(description);
        if !has_primary {
            self.add_unknown_hosts(&hosts);
        }
    }
}

fn smooth_round_trip(previous: &ServerDescription, mut description: ServerDescription) -> ServerDescription {
    if let (Some(old), Some(sample)) = (previous.round_trip_time, description.round_trip_time) {
        let average = RTT_ALPHA * sample.as_nanos() as f64 + (1.0 - RTT_ALPHA) * old.as_nanos() as f64;
        description.round_trip_time = Some(Duration::from_nanos(average.round() as u64));
    }
    description
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ type: {:?}", self.topology_type)?;
        if let Some(set_name) = &self.set_name {
            write!(f, ", set: \"{set_name}\"")?;
        }
        f.write_str(", servers: [")?;
        for (i, server) in self.servers().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{server}")?;
        }
        f.write_str("] }")
    }
}

/// The current topology snapshot and its change feed.
#[derive(Debug)]
pub struct Topology {
    current: RwLock<Arc<TopologyDescription>>,
    changes: watch::Sender<Arc<TopologyDescription>>,
}

impl Topology {
    pub fn new(initial: TopologyDescription) -> Self {
        let initial = Arc::new(initial);
        let (changes, _) = watch::channel(initial.clone());
        Self {
            current: RwLock::new(initial),
            changes,
        }
    }

    pub fn description(&self) -> Arc<TopologyDescription> {
        self.current.read().clone()
    }

    /// A receiver that is marked changed whenever a new snapshot is installed.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologyDescription>> {
        self.changes.subscribe()
    }

    /// Apply a heartbeat result and publish the resulting snapshot.
    pub fn apply(&self, server: ServerDescription) -> Arc<TopologyDescription> {
        let mut current = self.current.write();
        let next = Arc::new(current.apply(server));
        if next.topology_type != current.topology_type {
            info!(from = ?current.topology_type, to = ?next.topology_type, "topology type changed");
        }
        *current = next.clone();
        // Published under the lock so watchers see snapshots in order.
        self.changes.send_replace(next.clone());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_bson::{array, doc};
    use pretty_assertions::assert_eq;

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn primary(address: &str, hosts: &[&str]) -> ServerDescription {
        let hosts: Vec<Bson> = hosts.iter().map(|h| Bson::from(*h)).collect();
        ServerDescription::from_hello(
            addr(address),
            &doc! { "ok" => 1.0, "isWritablePrimary" => true, "setName" => "rs0", "hosts" => hosts },
            Duration::from_millis(5),
        )
    }

    fn secondary(address: &str) -> ServerDescription {
        ServerDescription::from_hello(
            addr(address),
            &doc! { "ok" => 1.0, "secondary" => true, "setName" => "rs0", "hosts" => array!["a:27017", "b:27017"] },
            Duration::from_millis(5),
        )
    }

    #[test]
    fn test_parse_addresses() {
        assert_eq!(addr("Example.com").to_string(), "example.com:27017");
        assert_eq!(addr("h:1234").port(), 1234);
        assert_eq!(addr("[::1]:27018").to_string(), "[::1]:27018");
        assert!(ServerAddress::parse("h:0").is_err());
        assert!(ServerAddress::parse(":27017").is_err());
        assert!(ServerAddress::parse("[::1").is_err());
    }

    #[test]
    fn test_server_type_roles() {
        assert!(ServerType::RsArbiter.is_replica_set_member());
        assert!(!ServerType::RsArbiter.is_data_bearing());
        assert!(ServerType::Mongos.is_data_bearing());
        assert!(!ServerType::Standalone.is_replica_set_member());
        assert!(!ServerType::Unknown.is_data_bearing());
    }

    #[test]
    fn test_hello_server_types() {
        let rtt = Duration::from_millis(1);
        let standalone = ServerDescription::from_hello(addr("a"), &doc! { "ok" => 1, "isWritablePrimary" => true }, rtt);
        assert_eq!(standalone.server_type, ServerType::Standalone);
        let mongos = ServerDescription::from_hello(addr("a"), &doc! { "ok" => 1, "msg" => "isdbgrid" }, rtt);
        assert_eq!(mongos.server_type, ServerType::Mongos);
        let arbiter = ServerDescription::from_hello(addr("a"), &doc! { "ok" => 1, "setName" => "s", "arbiterOnly" => true }, rtt);
        assert_eq!(arbiter.server_type, ServerType::RsArbiter);
        let ghost = ServerDescription::from_hello(addr("a"), &doc! { "ok" => 1, "isreplicaset" => true }, rtt);
        assert_eq!(ghost.server_type, ServerType::RsGhost);
        let failed = ServerDescription::from_hello(addr("a"), &doc! { "ok" => 0 }, rtt);
        assert_eq!(failed.server_type, ServerType::Unknown);
        assert!(failed.error.is_some());
    }

    #[test]
    fn test_apply_returns_new_snapshot() {
        let initial = TopologyDescription::new(&[addr("a")], None, false);
        let next = initial.apply(primary("a", &["a:27017", "b:27017"]));
        assert_eq!(initial.topology_type(), TopologyType::Unknown);
        assert_eq!(next.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(next.set_name(), Some("rs0"));
        let addresses: Vec<String> = next.servers().map(|s| s.address.to_string()).collect();
        assert_eq!(addresses, vec!["a:27017", "b:27017"]);
    }

    #[test]
    fn test_new_primary_demotes_old() {
        let topology = TopologyDescription::new(&[addr("a"), addr("b")], Some("rs0".into()), false)
            .apply(primary("a", &["a:27017", "b:27017"]))
            .apply(primary("b", &["a:27017", "b:27017"]));
        assert_eq!(topology.primary().map(|p| p.address.clone()), Some(addr("b")));
        assert_eq!(topology.server(&addr("a")).map(|s| s.server_type), Some(ServerType::Unknown));
    }

    #[test]
    fn test_primary_host_list_is_authoritative() {
        let topology = TopologyDescription::new(&[addr("a"), addr("c")], None, false).apply(primary("a", &["a:27017", "b:27017"]));
        assert!(topology.server(&addr("c")).is_none());
        assert!(topology.server(&addr("b")).is_some());
    }

    #[test]
    fn test_losing_primary() {
        let topology = TopologyDescription::new(&[addr("a"), addr("b")], None, false)
            .apply(primary("a", &["a:27017", "b:27017"]))
            .apply(secondary("b"))
            .apply(ServerDescription::failed(addr("a"), "connection reset"));
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn test_set_name_mismatch_removes_server() {
        let topology = TopologyDescription::new(&[addr("a"), addr("b")], Some("other".into()), false).apply(secondary("a"));
        assert!(topology.server(&addr("a")).is_none());
    }

    #[test]
    fn test_standalone_among_many_seeds_is_removed() {
        let standalone = ServerDescription::from_hello(addr("a"), &doc! { "ok" => 1 }, Duration::from_millis(1));
        let topology = TopologyDescription::new(&[addr("a"), addr("b")], None, false).apply(standalone.clone());
        assert!(topology.server(&addr("a")).is_none());
        let single = TopologyDescription::new(&[addr("a")], None, false).apply(standalone);
        assert_eq!(single.topology_type(), TopologyType::Single);
    }

    #[test]
    fn test_sharded_drops_non_mongos() {
        let mongos = ServerDescription::from_hello(addr("a"), &doc! { "ok" => 1, "msg" => "isdbgrid" }, Duration::from_millis(1));
        let topology = TopologyDescription::new(&[addr("a"), addr("b")], None, false)
            .apply(mongos)
            .apply(secondary("b"));
        assert_eq!(topology.topology_type(), TopologyType::Sharded);
        assert!(topology.server(&addr("b")).is_none());
    }

    #[test]
    fn test_round_trip_is_averaged() {
        let topology = TopologyDescription::new(&[addr("a")], None, true);
        let first = ServerDescription::from_hello(addr("a"), &doc! { "ok" => 1 }, Duration::from_millis(10));
        let second = ServerDescription::from_hello(addr("a"), &doc! { "ok" => 1 }, Duration::from_millis(20));
        let topology = topology.apply(first).apply(second);
        let rtt = topology.server(&addr("a")).and_then(|s| s.round_trip_time).unwrap();
        assert_eq!(rtt.as_millis(), 12);
    }

    #[tokio::test]
    async fn test_topology_notifies_watchers() {
        let topology = Topology::new(TopologyDescription::new(&[addr("a")], None, true));
        let mut changes = topology.subscribe();
        let before = topology.description();
        topology.apply(ServerDescription::from_hello(addr("a"), &doc! { "ok" => 1 }, Duration::from_millis(1)));
        changes.changed().await.unwrap();
        assert!(changes.borrow().has_known_servers());
        assert!(!before.has_known_servers());
    }
}
