//! RaftKV's server functionality modules and trait.

mod heartbeat;
mod replica;
mod statemach;
mod transport;

pub use replica::{GenericReplica, ReplicaId, BROADCAST};
pub use statemach::{Command, CommandId, CommandResult};
pub use transport::Envelope;

pub(crate) use heartbeat::{HeartbeatEvent, Heartbeater};
pub(crate) use statemach::StateMachine;
pub(crate) use transport::TransportHub;
