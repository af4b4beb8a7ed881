//! The cluster: topology monitoring plus server selection.
//!
//! [`Cluster::select_server`] waits on the topology change feed until a
//! suitable server shows up, the selection timeout expires, or the caller
//! cancels. Callers that have to wait take a slot in a bounded wait queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use lodestar_bson::{Document, doc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DriverError, DriverResult};
use crate::selection::{ServerSelector, latency_window};
use crate::topology::{ServerAddress, ServerDescription, Topology, TopologyDescription};
use crate::transport::{CancellationSignal, Connection, ConnectionSettings, Transport};

/// Cluster configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSettings {
    pub seeds: Vec<ServerAddress>,
    /// Required replica set name, if any.
    pub set_name: Option<String>,
    /// Talk to the single seed only, whatever it reports.
    pub direct_connection: bool,
    pub server_selection_timeout: Duration,
    pub heartbeat_frequency: Duration,
    /// Width of the latency window above the fastest suitable server.
    pub local_threshold: Duration,
    /// Maximum number of operations waiting for a server at once.
    pub max_wait_queue_size: usize,
    pub connection: ConnectionSettings,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            seeds: vec![ServerAddress::new("localhost", crate::topology::DEFAULT_PORT)],
            set_name: None,
            direct_connection: false,
            server_selection_timeout: Duration::from_secs(30),
            heartbeat_frequency: Duration::from_secs(10),
            local_threshold: Duration::from_millis(15),
            max_wait_queue_size: 500,
            connection: ConnectionSettings::default(),
        }
    }
}

/// Holds a wait queue slot until dropped.
struct WaitQueueSlot<'a>(&'a AtomicUsize);

impl<'a> WaitQueueSlot<'a> {
    fn enter(counter: &'a AtomicUsize, max: usize) -> DriverResult<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| DriverError::WaitQueueFull(max))?;
        Ok(Self(counter))
    }
}

impl Drop for WaitQueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A monitored deployment.
pub struct Cluster {
    settings: ClusterSettings,
    topology: Topology,
    transport: Arc<dyn Transport>,
    wait_queue: AtomicUsize,
    round_robin: AtomicUsize,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("settings", &self.settings)
            .field("topology", &self.topology)
            .field("wait_queue", &self.wait_queue_len())
            .finish_non_exhaustive()
    }
}

impl Cluster {
    pub fn new(settings: ClusterSettings, transport: Arc<dyn Transport>) -> DriverResult<Self> {
        if settings.seeds.is_empty() {
            return Err(DriverError::configuration("at least one seed address is required"));
        }
        if settings.direct_connection && settings.seeds.len() > 1 {
            return Err(DriverError::configuration("a direct connection takes exactly one seed"));
        }
        let initial = TopologyDescription::new(&settings.seeds, settings.set_name.clone(), settings.direct_connection);
        info!(seeds = settings.seeds.len(), topology = ?initial.topology_type(), "cluster created");
        Ok(Self {
            settings,
            topology: Topology::new(initial),
            transport,
            wait_queue: AtomicUsize::new(0),
            round_robin: AtomicUsize::new(0),
        })
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn description(&self) -> Arc<TopologyDescription> {
        self.topology.description()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Operations currently waiting for a server.
    pub fn wait_queue_len(&self) -> usize {
        self.wait_queue.load(Ordering::Acquire)
    }

    /// Fold a server description into the topology.
    pub fn apply(&self, server: ServerDescription) -> Arc<TopologyDescription> {
        self.topology.apply(server)
    }

    /// Pick a server for `selector`, waiting for topology changes if none
    /// is suitable yet.
    pub async fn select_server(&self, selector: &ServerSelector, cancel: &CancellationSignal) -> DriverResult<ServerDescription> {
        let timeout = self.settings.server_selection_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = self.topology.subscribe();
        let mut slot = None;

        loop {
            if cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            let description = changes.borrow_and_update().clone();
            if let Some(server) = self.pick(selector, &description) {
                debug!(%selector, address = %server.address, "selected server");
                return Ok(server);
            }
            if slot.is_none() {
                slot = Some(WaitQueueSlot::enter(&self.wait_queue, self.settings.max_wait_queue_size)?);
                debug!(%selector, "no suitable server, waiting for topology change");
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DriverError::Cancelled),
                changed = tokio::time::timeout(remaining, changes.changed()) => match changed {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => return Err(DriverError::ServerSelection("topology was closed".into())),
                    Err(_) => {
                        let description = self.topology.description();
                        warn!(%selector, "server selection timed out");
                        return Err(DriverError::ServerSelection(format!(
                            "A timeout occurred after {}ms selecting a server using {selector}. Client view of cluster state is {description}.",
                            timeout.as_millis()
                        )));
                    }
                },
            }
        }
    }

    fn pick(&self, selector: &ServerSelector, description: &TopologyDescription) -> Option<ServerDescription> {
        let candidates = latency_window(selector.suitable(description), self.settings.local_threshold);
        if candidates.is_empty() {
            return None;
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }

    /// Run `hello` against one server and fold the result in.
    pub async fn check_server(&self, address: ServerAddress) -> ServerDescription {
        let connection = Connection::new(address.clone(), self.transport.clone(), self.settings.connection.clone());
        let started = Instant::now();
        let description = match connection.run_command("admin", doc! { "hello" => 1 }, &CancellationSignal::new()).await {
            Ok(reply) => ServerDescription::from_hello(address, &reply, started.elapsed()),
            Err(e) => {
                debug!(%address, error = %e, "server check failed");
                ServerDescription::failed(address, e.to_string())
            }
        };
        self.apply(description.clone());
        description
    }

    /// Check every server in the current topology concurrently.
    pub async fn heartbeat(&self) -> Arc<TopologyDescription> {
        let addresses: Vec<ServerAddress> = self.description().servers().map(|s| s.address.clone()).collect();
        join_all(addresses.into_iter().map(|address| self.check_server(address))).await;
        self.description()
    }

    /// Heartbeat on `heartbeat_frequency` until `shutdown` fires.
    pub fn start_monitoring(self: &Arc<Self>, shutdown: CancellationSignal) -> JoinHandle<()> {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cluster.settings.heartbeat_frequency);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        cluster.heartbeat().await;
                    }
                }
            }
            debug!("monitoring stopped");
        })
    }

    /// Select a server and run `command` on it.
    pub async fn run_command(
        &self,
        selector: &ServerSelector,
        database: &str,
        command: Document,
        cancel: &CancellationSignal,
    ) -> DriverResult<Document> {
        let server = self.select_server(selector, cancel).await?;
        Connection::new(server.address, self.transport.clone(), self.settings.connection.clone())
            .run_command(database, command, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::ReadPreference;
    use crate::topology::{ServerType, TopologyType};
    use crate::transport::tests::ScriptedTransport;
    use lodestar_bson::{Bson, array};
    use pretty_assertions::assert_eq;

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn settings(seeds: &[&str]) -> ClusterSettings {
        ClusterSettings {
            seeds: seeds.iter().map(|s| addr(s)).collect(),
            server_selection_timeout: Duration::from_millis(100),
            ..ClusterSettings::default()
        }
    }

    fn standalone(address: &str) -> ServerDescription {
        ServerDescription::from_hello(addr(address), &doc! { "ok" => 1, "isWritablePrimary" => true }, Duration::from_millis(1))
    }

    fn cluster(settings: ClusterSettings, transport: ScriptedTransport) -> Arc<Cluster> {
        Arc::new(Cluster::new(settings, Arc::new(transport)).unwrap())
    }

    #[test]
    fn test_rejects_empty_seeds() {
        let result = Cluster::new(ClusterSettings { seeds: Vec::new(), ..ClusterSettings::default() }, Arc::new(ScriptedTransport::new()));
        assert!(matches!(result, Err(DriverError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_selects_known_server_immediately() {
        let cluster = cluster(settings(&["a"]), ScriptedTransport::new());
        cluster.apply(standalone("a"));
        let server = cluster.select_server(&ServerSelector::Write, &CancellationSignal::new()).await.unwrap();
        assert_eq!(server.address, addr("a"));
        assert_eq!(cluster.wait_queue_len(), 0);
    }

    #[tokio::test]
    async fn test_waits_for_topology_change() {
        let cluster = cluster(ClusterSettings { server_selection_timeout: Duration::from_secs(5), ..settings(&["a"]) }, ScriptedTransport::new());
        let waiter = {
            let cluster = cluster.clone();
            tokio::spawn(async move { cluster.select_server(&ServerSelector::Write, &CancellationSignal::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cluster.wait_queue_len(), 1);
        cluster.apply(standalone("a"));
        let server = waiter.await.unwrap().unwrap();
        assert_eq!(server.server_type, ServerType::Standalone);
        assert_eq!(cluster.wait_queue_len(), 0);
    }

    #[tokio::test]
    async fn test_selection_timeout_message() {
        let cluster = cluster(settings(&["a"]), ScriptedTransport::new());
        let err = cluster.select_server(&ServerSelector::Write, &CancellationSignal::new()).await.unwrap_err();
        let DriverError::ServerSelection(message) = err else {
            panic!("expected a selection error, got {err:?}");
        };
        assert!(message.starts_with("A timeout occurred after 100ms selecting a server using WritableServerSelector."));
        assert!(message.contains("Client view of cluster state is"));
        assert_eq!(cluster.wait_queue_len(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_releases_wait_slot() {
        let cluster = cluster(ClusterSettings { server_selection_timeout: Duration::from_secs(5), ..settings(&["a"]) }, ScriptedTransport::new());
        let cancel = CancellationSignal::new();
        let waiter = {
            let cluster = cluster.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { cluster.select_server(&ServerSelector::Write, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap().unwrap_err(), DriverError::Cancelled);
        assert_eq!(cluster.wait_queue_len(), 0);
    }

    #[tokio::test]
    async fn test_wait_queue_full() {
        let cluster = cluster(
            ClusterSettings {
                max_wait_queue_size: 1,
                server_selection_timeout: Duration::from_secs(5),
                ..settings(&["a"])
            },
            ScriptedTransport::new(),
        );
        let cancel = CancellationSignal::new();
        let first = {
            let cluster = cluster.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { cluster.select_server(&ServerSelector::Write, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = cluster.select_server(&ServerSelector::Write, &CancellationSignal::new()).await;
        assert_eq!(second.unwrap_err(), DriverError::WaitQueueFull(1));
        cancel.cancel();
        assert!(first.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_discovers_replica_set() {
        let members = array!["a:27017", "b:27017"];
        let transport = ScriptedTransport::new()
            .reply("a", doc! { "ok" => 1, "isWritablePrimary" => true, "setName" => "rs0", "hosts" => members.clone() })
            .reply("b", doc! { "ok" => 1, "secondary" => true, "setName" => "rs0", "hosts" => members });
        let cluster = cluster(settings(&["a"]), transport);

        let first = cluster.heartbeat().await;
        assert_eq!(first.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(first.server(&addr("b")).map(|s| s.server_type), Some(ServerType::Unknown));

        let second = cluster.heartbeat().await;
        assert_eq!(second.server(&addr("b")).map(|s| s.server_type), Some(ServerType::RsSecondary));
        let server = cluster
            .select_server(&ServerSelector::Read(ReadPreference::Secondary), &CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(server.address, addr("b"));
    }

    #[tokio::test]
    async fn test_failed_check_marks_server_unknown() {
        let cluster = cluster(settings(&["a"]), ScriptedTransport::new());
        let description = cluster.check_server(addr("a")).await;
        assert_eq!(description.server_type, ServerType::Unknown);
        assert!(description.error.as_deref().is_some_and(|e| e.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_run_command_on_selected_server() {
        let transport = Arc::new(ScriptedTransport::new().reply("a", doc! { "ok" => 1, "isWritablePrimary" => true, "n" => 3 }));
        let cluster = Cluster::new(settings(&["a"]), transport.clone()).unwrap();
        cluster.heartbeat().await;
        let reply = cluster
            .run_command(&ServerSelector::Write, "app", doc! { "count" => "people" }, &CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(reply.get("n"), Some(&Bson::Int32(3)));
        let sent = transport.sent.lock();
        let (address, body) = sent.last().unwrap();
        assert_eq!(address, &addr("a"));
        assert_eq!(body.get("$db"), Some(&Bson::from("app")));
    }

    #[tokio::test]
    async fn test_monitoring_stops_on_shutdown() {
        let transport = ScriptedTransport::new().reply("a", doc! { "ok" => 1, "isWritablePrimary" => true });
        let cluster = cluster(ClusterSettings { heartbeat_frequency: Duration::from_millis(10), ..settings(&["a"]) }, transport);
        let shutdown = CancellationSignal::new();
        let handle = cluster.start_monitoring(shutdown.clone());
        let server = cluster
            .select_server(&ServerSelector::Write, &CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(server.address, addr("a"));
        shutdown.cancel();
        handle.await.unwrap();
    }
}
