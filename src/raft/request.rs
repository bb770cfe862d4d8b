//! Replication engine -- client request entrance.

use super::*;

use crate::server::{Command, ReplicaId};
use crate::utils::RaftKvError;

// RaftReplica client requests entrance
impl RaftReplica {
    /// Handler of a client `get`/`put` off the bus.
    pub(super) fn handle_client_request(
        &mut self,
        client: ReplicaId,
        req: BusMsg,
    ) -> Result<(), RaftKvError> {
        // if I'm not the leader, point the client at whoever is
        if self.role != Role::Leader {
            let mid = match req {
                BusMsg::Get { mid, .. } | BusMsg::Put { mid, .. } => mid,
                _ => return logged_err!(self.id; "unexpected request type"),
            };
            let reply = match self.leader {
                Some(_) => BusMsg::Redirect { mid },
                None => BusMsg::Fail { mid },
            };
            let leader_hint = self.leader_hint();
            self.transport_hub.send_msg(reply, client.clone(), leader_hint)?;
            pf_trace!(self.id; "redirected client {} to leader {:?}",
                               client, self.leader);
            return Ok(());
        }

        match req {
            BusMsg::Put { key, value, mid } => {
                // append an entry to in-memory log; the reply is produced
                // once the entry has been committed and applied
                let entry = LogEntry {
                    term: self.curr_term,
                    index: self.log.len(),
                    key,
                    value,
                    client,
                    mid,
                };
                pf_debug!(self.id; "appended put entry at index {} term {}",
                                   entry.index, entry.term);
                self.log.push(entry);

                // a cluster of one commits right away; everyone else waits
                // for append acknowledgements
                self.try_advance_commit()?;
            }

            BusMsg::Get { key, mid } => {
                // leader-local read: route through the state machine
                // executor so it orders after every applied write
                let cmd_id =
                    Self::make_command_id(self.read_seq as usize, true);
                self.read_seq = self.read_seq.wrapping_add(1);
                self.pending_reads.insert(cmd_id, (client, mid));
                self.state_machine.submit_cmd(cmd_id, Command::Get { key })?;
            }

            _ => return logged_err!(self.id; "unexpected request type"),
        }

        Ok(())
    }
}
