//! Replication engine -- command execution.

use super::*;

use crate::server::{Command, CommandId, CommandResult};
use crate::utils::RaftKvError;

// RaftReplica state machine execution
impl RaftReplica {
    /// Submits every newly committed entry, from `from_excl` exclusive up to
    /// the current commit index, to the state machine executor. Submission
    /// order is index order, and the executor preserves it, so application
    /// is strictly in-order on every replica.
    pub(super) fn submit_newly_committed(
        &mut self,
        from_excl: i64,
    ) -> Result<(), RaftKvError> {
        debug_assert!(self.commit_index < self.log.len() as i64);
        for slot in
            ((from_excl + 1).max(0) as usize)..=(self.commit_index as usize)
        {
            let entry = &self.log[slot];
            let cmd = Command::Put {
                key: entry.key.clone(),
                value: entry.value.clone(),
            };
            self.state_machine
                .submit_cmd(Self::make_command_id(slot, false), cmd)?;
            pf_trace!(self.id; "submitted entry at index {} for execution",
                               slot);
        }
        Ok(())
    }

    /// Handler of state machine exec result chan recv.
    pub(super) fn handle_cmd_result(
        &mut self,
        cmd_id: CommandId,
        cmd_result: CommandResult,
    ) -> Result<(), RaftKvError> {
        let (seq, read) = Self::split_command_id(cmd_id);

        if read {
            // leader-local get: reply with the value, empty string when the
            // key has never been written
            if let Some((client, mid)) = self.pending_reads.remove(&cmd_id) {
                let value = match cmd_result {
                    CommandResult::Get { value } => value.unwrap_or_default(),
                    _ => {
                        return logged_err!(
                            self.id;
                            "unexpected command result type"
                        )
                    }
                };
                let leader_hint = self.leader_hint();
                self.transport_hub.send_msg(
                    BusMsg::Ok {
                        mid,
                        value: Some(value),
                    },
                    client.clone(),
                    leader_hint,
                )?;
                pf_trace!(self.id; "replied get ok -> client {}", client);
            }
            return Ok(());
        }

        // an applied log entry
        debug_assert_eq!(seq as i64, self.last_applied + 1);
        self.last_applied = seq as i64;
        pf_trace!(self.id; "applied entry at index {}", seq);

        // only the leader answers the originating client
        if self.role == Role::Leader {
            let entry = &self.log[seq];
            let (client, mid) = (entry.client.clone(), entry.mid.clone());
            let leader_hint = self.leader_hint();
            self.transport_hub.send_msg(
                BusMsg::Ok { mid, value: None },
                client.clone(),
                leader_hint,
            )?;
            pf_trace!(self.id; "replied put ok -> client {} for index {}",
                               client, seq);
        }

        Ok(())
    }
}
