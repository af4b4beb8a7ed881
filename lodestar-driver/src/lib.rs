//! # lodestar-driver
//!
//! The driver layer underneath the query translator: message framing,
//! command execution, topology tracking and server selection.
//!
//! - [`wire`] frames command documents as OP_MSG messages
//! - [`transport`] moves frames to servers and runs commands with timeouts and cancellation
//! - [`topology`] folds heartbeat results into immutable topology snapshots
//! - [`selection`] filters a snapshot by read preference and latency
//! - [`cluster`] ties them together and waits for suitable servers
//!
//! ## Selecting a server
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lodestar_bson::doc;
//! use lodestar_driver::{Cluster, ClusterSettings, ServerDescription, ServerSelector, TcpTransport};
//! use lodestar_driver::transport::CancellationSignal;
//!
//! # tokio_test_block(async {
//! let settings = ClusterSettings::default();
//! let address = settings.seeds[0].clone();
//! let cluster = Cluster::new(settings, Arc::new(TcpTransport::new(Duration::from_secs(1)))).unwrap();
//! cluster.apply(ServerDescription::from_hello(
//!     address.clone(),
//!     &doc! { "ok" => 1, "isWritablePrimary" => true },
//!     Duration::from_millis(2),
//! ));
//! let server = cluster.select_server(&ServerSelector::Write, &CancellationSignal::new()).await.unwrap();
//! assert_eq!(server.address, address);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod cluster;
pub mod error;
pub mod selection;
pub mod topology;
pub mod transport;
pub mod wire;

pub use cluster::{Cluster, ClusterSettings};
pub use error::{DriverError, DriverResult};
pub use selection::{ReadPreference, ServerSelector};
pub use topology::{ServerAddress, ServerDescription, ServerType, Topology, TopologyDescription, TopologyType};
pub use transport::{CancellationSignal, Connection, ConnectionSettings, TcpTransport, Transport};
pub use wire::{Message, MessageFlags, OpCode};
