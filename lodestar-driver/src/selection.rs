//! Server selection.
//!
//! A [`ServerSelector`] picks the suitable servers out of a topology
//! snapshot; [`latency_window`] then keeps those whose round-trip time is
//! within the local threshold of the fastest.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DriverError;
use crate::topology::{ServerAddress, ServerDescription, ServerType, TopologyDescription, TopologyType};

/// Which replica set members may serve a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadPreference {
    /// Always read from primary.
    #[default]
    Primary,
    /// Prefer primary, fall back to secondaries.
    PrimaryPreferred,
    /// Only secondaries.
    Secondary,
    /// Prefer secondaries, fall back to primary.
    SecondaryPreferred,
    /// Any data-bearing member, by latency alone.
    Nearest,
}

impl ReadPreference {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::Secondary => "secondary",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        }
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadPreference {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "primarypreferred" => Ok(Self::PrimaryPreferred),
            "secondary" => Ok(Self::Secondary),
            "secondarypreferred" => Ok(Self::SecondaryPreferred),
            "nearest" => Ok(Self::Nearest),
            _ => Err(DriverError::configuration(format!("unknown read preference '{s}'"))),
        }
    }
}

/// What an operation needs from a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSelector {
    /// A server that accepts writes.
    Write,
    Read(ReadPreference),
    /// One specific server, once it is known.
    Address(ServerAddress),
}

impl ServerSelector {
    /// Suitable servers in `topology`, before latency filtering.
    pub fn suitable<'a>(&self, topology: &'a TopologyDescription) -> Vec<&'a ServerDescription> {
        if let Self::Address(address) = self {
            return topology.server(address).filter(|s| s.is_known()).into_iter().collect();
        }
        match topology.topology_type() {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single => topology.servers().filter(|s| s.is_known()).collect(),
            TopologyType::Sharded => of_type(topology, ServerType::Mongos),
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
                let primaries = of_type(topology, ServerType::RsPrimary);
                let secondaries = of_type(topology, ServerType::RsSecondary);
                match self {
                    Self::Write | Self::Read(ReadPreference::Primary) => primaries,
                    Self::Read(ReadPreference::PrimaryPreferred) => {
                        if primaries.is_empty() {
                            secondaries
                        } else {
                            primaries
                        }
                    }
                    Self::Read(ReadPreference::Secondary) => secondaries,
                    Self::Read(ReadPreference::SecondaryPreferred) => {
                        if secondaries.is_empty() {
                            primaries
                        } else {
                            secondaries
                        }
                    }
                    Self::Read(ReadPreference::Nearest) => primaries.into_iter().chain(secondaries).collect(),
                    Self::Address(_) => Vec::new(),
                }
            }
        }
    }
}

impl fmt::Display for ServerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => f.write_str("WritableServerSelector"),
            Self::Read(preference) => write!(f, "ReadPreferenceServerSelector{{ {preference} }}"),
            Self::Address(address) => write!(f, "EndPointServerSelector{{ {address} }}"),
        }
    }
}

fn of_type(topology: &TopologyDescription, server_type: ServerType) -> Vec<&ServerDescription> {
    topology.servers().filter(|s| s.server_type == server_type).collect()
}

/// Keep servers whose round-trip time is within `local_threshold` of the
/// fastest. Servers without a measurement count as instantaneous.
pub fn latency_window(servers: Vec<&ServerDescription>, local_threshold: Duration) -> Vec<&ServerDescription> {
    let rtt = |s: &ServerDescription| s.round_trip_time.unwrap_or_default();
    let Some(fastest) = servers.iter().map(|s| rtt(s)).min() else {
        return servers;
    };
    let limit = fastest.saturating_add(local_threshold);
    servers.into_iter().filter(|s| rtt(s) <= limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_bson::{array, doc};
    use pretty_assertions::assert_eq;

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn member(address: &str, role: &str, rtt_ms: u64) -> ServerDescription {
        let mut hello = doc! { "ok" => 1, "setName" => "rs", "hosts" => array!["p:27017", "s1:27017", "s2:27017"] };
        hello.insert(role, true);
        ServerDescription::from_hello(addr(address), &hello, Duration::from_millis(rtt_ms))
    }

    fn replica_set(with_primary: bool) -> TopologyDescription {
        let mut topology = TopologyDescription::new(&[addr("p"), addr("s1"), addr("s2")], Some("rs".into()), false);
        if with_primary {
            topology = topology.apply(member("p", "isWritablePrimary", 5));
        }
        topology.apply(member("s1", "secondary", 10)).apply(member("s2", "secondary", 40))
    }

    fn names(servers: &[&ServerDescription]) -> Vec<String> {
        servers.iter().map(|s| s.address.host().to_string()).collect()
    }

    #[test]
    fn test_write_needs_primary() {
        assert_eq!(names(&ServerSelector::Write.suitable(&replica_set(true))), vec!["p"]);
        assert!(ServerSelector::Write.suitable(&replica_set(false)).is_empty());
    }

    #[test]
    fn test_read_preferences() {
        let with = replica_set(true);
        let without = replica_set(false);
        let read = |p| ServerSelector::Read(p);
        assert_eq!(names(&read(ReadPreference::Secondary).suitable(&with)), vec!["s1", "s2"]);
        assert_eq!(names(&read(ReadPreference::PrimaryPreferred).suitable(&with)), vec!["p"]);
        assert_eq!(names(&read(ReadPreference::PrimaryPreferred).suitable(&without)), vec!["s1", "s2"]);
        assert_eq!(names(&read(ReadPreference::SecondaryPreferred).suitable(&with)), vec!["s1", "s2"]);
        assert_eq!(names(&read(ReadPreference::Nearest).suitable(&with)), vec!["p", "s1", "s2"]);
    }

    #[test]
    fn test_latency_window() {
        let topology = replica_set(true);
        let nearest = ServerSelector::Read(ReadPreference::Nearest).suitable(&topology);
        assert_eq!(names(&latency_window(nearest.clone(), Duration::from_millis(15))), vec!["p", "s1"]);
        assert_eq!(names(&latency_window(nearest, Duration::ZERO)), vec!["p"]);
    }

    #[test]
    fn test_unknown_topology_has_no_candidates() {
        let topology = TopologyDescription::new(&[addr("a")], None, false);
        assert!(ServerSelector::Read(ReadPreference::Nearest).suitable(&topology).is_empty());
    }

    #[test]
    fn test_address_selector() {
        let topology = replica_set(true);
        assert_eq!(names(&ServerSelector::Address(addr("s2")).suitable(&topology)), vec!["s2"]);
        assert!(ServerSelector::Address(addr("zz")).suitable(&topology).is_empty());
    }

    #[test]
    fn test_parse_read_preference() {
        assert_eq!("secondaryPreferred".parse::<ReadPreference>().unwrap(), ReadPreference::SecondaryPreferred);
        assert!("closest".parse::<ReadPreference>().is_err());
    }
}
