//! Replication engine: leader election, log replication, commit advancement,
//! and the state machine that applies committed commands to the KV map.
//!
//! Follows the Raft algorithm shape. References:
//!   - <https://raft.github.io/raft.pdf>

mod execution;
mod leadership;
mod messages;
mod request;

use std::collections::{HashMap, HashSet};

use crate::server::{
    CommandId, GenericReplica, HeartbeatEvent, Heartbeater, ReplicaId,
    StateMachine, TransportHub, BROADCAST,
};
use crate::utils::RaftKvError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::sync::watch;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Min timeout of not hearing any heartbeat from leader in millisecs.
    pub hb_hear_timeout_min: u64,
    /// Max timeout of not hearing any heartbeat from leader in millisecs.
    pub hb_hear_timeout_max: u64,

    /// Interval of leader sending AppendEntries heartbeats to followers.
    /// Also paces a candidate's re-solicitation of pending votes.
    pub hb_send_interval_ms: u64,

    /// Disable heartbeat hearing timer (to force a deterministic role during
    /// tests).
    pub disable_hb_timer: bool,

    /// Maximum number of log entries per append datagram.
    pub msg_chunk_size: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            hb_hear_timeout_min: 200,
            hb_hear_timeout_max: 400,
            hb_send_interval_ms: 100,
            disable_hb_timer: false,
            msg_chunk_size: 64,
        }
    }
}

/// Term number type, defined for better code readability.
pub(crate) type Term = u64;

/// In-memory entry of the command log, one client `put` per entry.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) struct LogEntry {
    /// Term number when the entry was appended by a leader.
    term: Term,

    /// Position of this entry in the log, zero-based.
    index: usize,

    /// Key to write.
    key: String,

    /// Value to write.
    value: String,

    /// ID of the client that issued the `put`.
    client: ReplicaId,

    /// Client-supplied message ID, echoed in the eventual reply.
    mid: String,
}

/// Tagged message records flowing over the simulator bus, peer-to-peer and
/// client-facing alike. Spellings of tags and fields are fixed by the bus
/// protocol.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum BusMsg {
    /// Announced once at startup so the simulator learns my address.
    #[serde(rename = "hello")]
    Hello,

    /// RequestVote from candidate to all peers.
    #[serde(rename = "request_rpc")]
    RequestVote {
        term: Term,
        #[serde(rename = "log-length")]
        log_length: usize,
        last_log_term: i64,
    },

    /// RequestVote reply from peer to candidate.
    #[serde(rename = "vote")]
    Vote { should_vote: bool, term: Term },

    /// AppendEntries from leader to a peer. `prev_log_index`/`prev_log_term`
    /// are −1 when the batch starts at the head of the log.
    #[serde(rename = "append-entries")]
    AppendEntries {
        term: Term,
        prev_log_index: i64,
        prev_log_term: i64,
        entries: Vec<LogEntry>,
        commit_index: i64,
    },

    /// AppendEntries reply from peer to leader. On failure the
    /// index/term-difference hints drive the leader's next-index back-off;
    /// `entries` echoes the received batch for acknowledgement attribution.
    #[serde(rename = "append-response")]
    AppendResponse {
        term: Term,
        success: bool,
        #[serde(rename = "index-difference")]
        index_difference: i64,
        #[serde(rename = "term-difference")]
        term_difference: i64,
        entries: Vec<LogEntry>,
        commit_index: i64,
    },

    /// Client read.
    #[serde(rename = "get")]
    Get {
        key: String,
        #[serde(rename = "MID")]
        mid: String,
    },

    /// Client write.
    #[serde(rename = "put")]
    Put {
        key: String,
        value: String,
        #[serde(rename = "MID")]
        mid: String,
    },

    /// Success reply to a client; carries the value for `get`s.
    #[serde(rename = "ok")]
    Ok {
        #[serde(rename = "MID")]
        mid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    /// Try-elsewhere reply to a client; the envelope's `leader` field names
    /// where to go.
    #[serde(rename = "redirect")]
    Redirect {
        #[serde(rename = "MID")]
        mid: String,
    },

    /// Cannot-serve reply to a client (no leader known yet).
    #[serde(rename = "fail")]
    Fail {
        #[serde(rename = "MID")]
        mid: String,
    },
}

/// Replica role type.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub(crate) enum Role {
    Follower,
    Candidate,
    Leader,
}

/// The replication engine server replica module.
pub struct RaftReplica {
    /// Replica ID in cluster.
    id: ReplicaId,

    /// IDs of all other replicas.
    peers: Vec<ReplicaId>,

    /// Total number of replicas in cluster.
    population: u8,

    /// Majority quorum size.
    majority: u8,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    /// TransportHub module.
    transport_hub: TransportHub<BusMsg>,

    /// StateMachine module.
    state_machine: StateMachine,

    /// Heartbeater module.
    heartbeater: Heartbeater,

    /// Which role am I in right now?
    role: Role,

    /// Who do I think is the effective leader of the cluster right now?
    leader: Option<ReplicaId>,

    /// Latest term seen.
    curr_term: Term,

    /// Candidate ID that I voted for in current term.
    voted_for: Option<ReplicaId>,

    /// Replica IDs that voted for me in current election (self included).
    votes_granted: HashSet<ReplicaId>,

    /// Replica IDs that have not yet replied to my current vote request.
    votes_pending: HashSet<ReplicaId>,

    /// In-memory log of entries.
    log: Vec<LogEntry>,

    /// Index of highest log entry known to be committed; −1 when none.
    commit_index: i64,

    /// Index of highest log entry applied to state machine; −1 when none.
    last_applied: i64,

    /// For each peer, index of the next log entry to send. Maintained only
    /// while leader.
    next_index: HashMap<ReplicaId, usize>,

    /// For each peer, index of the highest log entry known to be replicated
    /// on it; −1 when unknown. Maintained only while leader.
    match_index: HashMap<ReplicaId, i64>,

    /// Sequence number for leader-local read commands.
    read_seq: u64,

    /// In-flight leader-local reads: read command ID -> originating client
    /// and its MID.
    pending_reads: HashMap<CommandId, (ReplicaId, String)>,
}

// RaftReplica common helpers
impl RaftReplica {
    /// Bit flagging a command ID as a leader-local read rather than an
    /// applied log entry.
    const CMD_READ: u64 = 1;

    /// Composes CommandId from a log slot or read sequence number.
    #[inline]
    fn make_command_id(seq: usize, read: bool) -> CommandId {
        debug_assert!(seq <= (u64::MAX >> 1) as usize);
        ((seq as u64) << 1) | if read { Self::CMD_READ } else { 0 }
    }

    /// Decomposes CommandId into sequence number and read flag.
    #[inline]
    fn split_command_id(command_id: CommandId) -> (usize, bool) {
        let seq = (command_id >> 1) as usize;
        let read = (command_id & Self::CMD_READ) != 0;
        (seq, read)
    }

    /// Term of the last log entry, or −1 for an empty log.
    #[inline]
    fn last_log_term(&self) -> i64 {
        self.log.last().map(|e| e.term as i64).unwrap_or(-1)
    }

    /// Best-known leader ID for stamping outgoing envelopes.
    #[inline]
    fn leader_hint(&self) -> ReplicaId {
        self.leader.clone().unwrap_or_else(|| BROADCAST.into())
    }
}

#[async_trait]
impl GenericReplica for RaftReplica {
    async fn new_and_setup(
        sim_port: u16,
        id: ReplicaId,
        peers: Vec<ReplicaId>,
        config_str: Option<&str>,
    ) -> Result<Self, RaftKvError> {
        if id.is_empty() || id == BROADCAST {
            return logged_err!(id; "invalid replica ID");
        }
        let mut peer_set = HashSet::new();
        for peer in &peers {
            if *peer == id || *peer == BROADCAST || !peer_set.insert(peer) {
                return logged_err!(id; "invalid peer ID '{}' given", peer);
            }
        }
        let population = (peers.len() + 1) as u8;
        let majority = (population / 2) + 1;

        // parse protocol-specific configs
        let config = parsed_config!(config_str => ReplicaConfig;
                                    hb_hear_timeout_min, hb_hear_timeout_max,
                                    hb_send_interval_ms, disable_hb_timer,
                                    msg_chunk_size)?;
        if config.msg_chunk_size == 0 {
            return logged_err!(
                id;
                "invalid config.msg_chunk_size '{}'",
                config.msg_chunk_size
            );
        }

        // setup state machine module
        let state_machine = StateMachine::new_and_setup(id.clone())?;

        // setup transport hub module
        let mut transport_hub =
            TransportHub::new_and_setup(id.clone(), sim_port).await?;

        // setup heartbeats management module
        let heartbeater = Heartbeater::new_and_setup(
            id.clone(),
            Duration::from_millis(config.hb_hear_timeout_min),
            Duration::from_millis(config.hb_hear_timeout_max),
            Duration::from_millis(config.hb_send_interval_ms),
        )?;

        // announce myself to the simulator so it learns my address
        transport_hub.bcast_msg(BusMsg::Hello, BROADCAST.into())?;
        pf_info!(id; "sent hello, population {} majority {}",
                     population, majority);

        Ok(RaftReplica {
            id,
            peers,
            population,
            majority,
            config,
            transport_hub,
            state_machine,
            heartbeater,
            role: Role::Follower,
            leader: None,
            curr_term: 0,
            voted_for: None,
            votes_granted: HashSet::new(),
            votes_pending: HashSet::new(),
            log: vec![],
            commit_index: -1,
            last_applied: -1,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            read_seq: 0,
            pending_reads: HashMap::new(),
        })
    }

    async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), RaftKvError> {
        // kick off leader activity hearing timer
        if !self.config.disable_hb_timer {
            self.heartbeater.kickoff_hear_timer()?;
        }

        // main event loop
        loop {
            tokio::select! {
                // datagram from the simulator bus
                envelope = self.transport_hub.recv_msg() => {
                    if let Err(e) = envelope {
                        pf_error!(self.id; "error receiving datagram: {}", e);
                        continue;
                    }
                    let envelope = envelope.unwrap();
                    match envelope.msg {
                        BusMsg::Get { .. } | BusMsg::Put { .. } => {
                            if let Err(e) = self.handle_client_request(
                                envelope.src, envelope.msg) {
                                pf_error!(self.id;
                                          "error handling client request: {}",
                                          e);
                            }
                        }
                        BusMsg::RequestVote { .. }
                        | BusMsg::Vote { .. }
                        | BusMsg::AppendEntries { .. }
                        | BusMsg::AppendResponse { .. } => {
                            if let Err(e) = self.handle_peer_msg(
                                envelope.src, envelope.msg).await {
                                pf_error!(self.id;
                                          "error handling peer msg: {}", e);
                            }
                        }
                        _ => {
                            pf_trace!(self.id; "ignored bus msg {:?}",
                                               envelope.msg);
                        }
                    }
                },

                // state machine execution result
                cmd_result = self.state_machine.get_result() => {
                    if let Err(e) = cmd_result {
                        pf_error!(self.id; "error getting cmd result: {}", e);
                        continue;
                    }
                    let (cmd_id, cmd_result) = cmd_result.unwrap();
                    if let Err(e) = self.handle_cmd_result(cmd_id, cmd_result) {
                        pf_error!(self.id; "error handling cmd result {}: {}",
                                           cmd_id, e);
                    }
                },

                // heartbeat-related timeout or tick
                hb_event = self.heartbeater.get_event() => {
                    if let Err(e) = hb_event {
                        pf_error!(self.id; "error getting hb event: {}", e);
                        continue;
                    }
                    match hb_event.unwrap() {
                        HeartbeatEvent::HearTimeout => {
                            if let Err(e) = self.become_a_candidate() {
                                pf_error!(self.id;
                                          "error becoming a candidate: {}", e);
                            }
                        }
                        HeartbeatEvent::SendTicked => {
                            let result = match self.role {
                                Role::Leader => self.bcast_heartbeats(),
                                Role::Candidate => {
                                    self.solicit_pending_votes()
                                }
                                Role::Follower => Ok(()),
                            };
                            if let Err(e) = result {
                                pf_error!(self.id;
                                          "error on send tick: {}", e);
                            }
                        }
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.id; "server caught termination signal");
                    return Ok(());
                }
            }
        }
    }

    fn id(&self) -> &ReplicaId {
        &self.id
    }
}

#[cfg(test)]
mod raft_tests {
    use super::*;

    #[test]
    fn command_id_compose() {
        let id = RaftReplica::make_command_id(77, false);
        assert_eq!(RaftReplica::split_command_id(id), (77, false));
        let id = RaftReplica::make_command_id(12, true);
        assert_eq!(RaftReplica::split_command_id(id), (12, true));
    }

    #[test]
    fn wire_spellings() -> Result<(), RaftKvError> {
        let msg = BusMsg::RequestVote {
            term: 3,
            log_length: 5,
            last_log_term: 2,
        };
        let value = serde_json::to_value(&msg)?;
        assert_eq!(value["type"], "request_rpc");
        assert_eq!(value["log-length"], 5);

        let msg = BusMsg::AppendResponse {
            term: 3,
            success: false,
            index_difference: 4,
            term_difference: 2,
            entries: vec![],
            commit_index: -1,
        };
        let value = serde_json::to_value(&msg)?;
        assert_eq!(value["type"], "append-response");
        assert_eq!(value["index-difference"], 4);
        assert_eq!(value["term-difference"], 2);

        let msg = BusMsg::Put {
            key: "k".into(),
            value: "v".into(),
            mid: "m1".into(),
        };
        let value = serde_json::to_value(&msg)?;
        assert_eq!(value["type"], "put");
        assert_eq!(value["MID"], "m1");

        // a put acknowledgement must not carry a value field at all
        let msg = BusMsg::Ok {
            mid: "m1".into(),
            value: None,
        };
        let value = serde_json::to_value(&msg)?;
        assert_eq!(value["type"], "ok");
        assert!(value.get("value").is_none());
        Ok(())
    }

    #[test]
    fn wire_decode_client_msgs() -> Result<(), RaftKvError> {
        let raw = r#"{"type": "get", "key": "x", "MID": "m7"}"#;
        let msg: BusMsg = serde_json::from_str(raw)?;
        assert_eq!(
            msg,
            BusMsg::Get {
                key: "x".into(),
                mid: "m7".into()
            }
        );

        let raw = r#"{"type": "hello"}"#;
        let msg: BusMsg = serde_json::from_str(raw)?;
        assert_eq!(msg, BusMsg::Hello);
        Ok(())
    }
}
