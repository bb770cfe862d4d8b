//! RaftKV server replica executable.

use std::collections::HashSet;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::sync::watch;

use raftkv::{
    pf_error, GenericReplica, RaftKvError, RaftReplica, ReplicaId, BROADCAST,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// UDP port of the central simulator on localhost.
    port: u16,

    /// ID of this replica.
    id: ReplicaId,

    /// IDs of all other replicas in the cluster.
    #[arg(required = true)]
    peers: Vec<ReplicaId>,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(RaftKvError)` on any error.
    fn sanitize(&self) -> Result<(), RaftKvError> {
        if self.port <= 1024 {
            return Err(RaftKvError(format!(
                "invalid simulator port {}",
                self.port
            )));
        }

        if self.id.is_empty() || self.id == BROADCAST {
            return Err(RaftKvError(format!(
                "invalid replica ID '{}'",
                self.id
            )));
        }

        // check for invalid or duplicate peers
        let mut peers_set = HashSet::new();
        for peer in self.peers.iter() {
            if peer.is_empty() || *peer == BROADCAST || *peer == self.id {
                return Err(RaftKvError(format!(
                    "invalid peer ID '{}' given",
                    peer
                )));
            }
            if !peers_set.insert(peer) {
                return Err(RaftKvError(format!(
                    "duplicate peer ID '{}' given",
                    peer
                )));
            }
        }

        Ok(())
    }
}

// Server replica executable main entrance.
fn server_main() -> Result<(), RaftKvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name(format!("tokio-worker-replica{}", args.id))
        .build()?;

    // enter tokio runtime, set up the replica, and start the main event
    // loop logic
    runtime.block_on(async move {
        let mut replica = RaftReplica::new_and_setup(
            args.port,
            args.id.clone(),
            args.peers.clone(),
            None,
        )
        .await?;

        // a replica runs until externally killed; keep the sender side
        // alive so the termination channel stays open
        let (_tx_term, rx_term) = watch::channel(false);
        replica.run(rx_term).await?;

        Ok::<(), RaftKvError>(()) // give type hint for this async closure
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server"; "server_main exited: {}", e);
    }
}

#[cfg(test)]
mod server_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), RaftKvError> {
        let args = CliArgs {
            port: 9010,
            id: "B".into(),
            peers: vec!["A".into(), "C".into(), "D".into(), "E".into()],
        };
        args.sanitize()
    }

    #[test]
    fn sanitize_invalid_port() {
        let args = CliArgs {
            port: 80,
            id: "B".into(),
            peers: vec!["A".into(), "C".into()],
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_id() {
        let args = CliArgs {
            port: 9010,
            id: BROADCAST.into(),
            peers: vec!["A".into(), "C".into()],
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_self_in_peers() {
        let args = CliArgs {
            port: 9010,
            id: "B".into(),
            peers: vec!["A".into(), "B".into()],
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_duplicate_peer() {
        let args = CliArgs {
            port: 9010,
            id: "B".into(),
            peers: vec!["A".into(), "A".into()],
        };
        assert!(args.sanitize().is_err());
    }
}
