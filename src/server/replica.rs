//! RaftKV generic replica trait implemented by the replication engine.

use crate::utils::RaftKvError;

use async_trait::async_trait;

use tokio::sync::watch;

/// Server replica ID type. A short opaque string assigned by the simulator
/// deployment; compared only for equality.
pub type ReplicaId = String;

/// Distinguished ID denoting broadcast to all replicas.
pub const BROADCAST: &str = "FFFF";

/// Replica trait abstracting the replication engine from its drivers (the
/// server executable and the integration test harness).
#[async_trait]
pub trait GenericReplica {
    /// Creates a new replica and sets up required functionality modules.
    /// `config_str` optionally carries TOML overrides of tuning parameters.
    async fn new_and_setup(
        sim_port: u16,
        id: ReplicaId,
        peers: Vec<ReplicaId>,
        config_str: Option<&str>,
    ) -> Result<Self, RaftKvError>
    where
        Self: Sized;

    /// Main event loop logic of running this replica. Returns `Ok(())` upon
    /// receiving a termination signal through `rx_term`.
    async fn run(
        &mut self,
        rx_term: watch::Receiver<bool>,
    ) -> Result<(), RaftKvError>;

    /// Gets my replica ID.
    fn id(&self) -> &ReplicaId;
}
