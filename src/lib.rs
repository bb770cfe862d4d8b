//! Public interface to the RaftKV core library, linked by the server
//! executable and the integration test harness.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod raft;
mod server;

pub use raft::{RaftReplica, ReplicaConfig};
pub use server::{
    Command, CommandId, CommandResult, Envelope, GenericReplica, ReplicaId,
    BROADCAST,
};
pub use utils::{RaftKvError, Timer};
