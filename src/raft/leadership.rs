//! Replication engine -- leader election.

use std::cmp;
use std::collections::HashSet;

use super::*;

use crate::server::{ReplicaId, BROADCAST};
use crate::utils::RaftKvError;

/// Up-to-date predicate for vote granting: the candidate's
/// `(last_log_term, log_length)` must be lexicographically at least mine.
/// Last log terms are −1 for empty logs.
pub(super) fn log_up_to_date(
    my_last_term: i64,
    my_len: usize,
    cand_last_term: i64,
    cand_len: usize,
) -> bool {
    cand_last_term > my_last_term
        || (cand_last_term == my_last_term && cand_len >= my_len)
}

// RaftReplica leader election logic
impl RaftReplica {
    /// If the current leader times out, becomes a candidate and starts the
    /// election procedure.
    pub(super) fn become_a_candidate(&mut self) -> Result<(), RaftKvError> {
        if self.role == Role::Leader {
            return Ok(());
        }

        self.role = Role::Candidate;

        // increment current term and vote for myself
        self.curr_term += 1;
        self.voted_for = Some(self.id.clone());
        self.votes_granted = HashSet::from([self.id.clone()]);
        self.votes_pending = self.peers.iter().cloned().collect();
        pf_info!(self.id; "starting election with term {}...", self.curr_term);

        // reset election timeout timer; send ticks now pace re-requests to
        // unresponsive peers
        self.heard_heartbeat()?;
        self.heartbeater.set_sending(true);

        // broadcast RequestVote to all other peers
        let leader_hint = self.leader_hint();
        self.transport_hub.bcast_msg(
            BusMsg::RequestVote {
                term: self.curr_term,
                log_length: self.log.len(),
                last_log_term: self.last_log_term(),
            },
            leader_hint,
        )?;
        pf_trace!(self.id; "broadcast RequestVote with term {} log-length {}",
                           self.curr_term, self.log.len());

        // a single-replica cluster has its majority already
        if self.votes_granted.len() as u8 >= self.majority {
            self.become_the_leader()?;
        }

        Ok(())
    }

    /// Re-sends vote requests to peers that have not replied in the current
    /// election round. Paced by the heartbeat send interval.
    pub(super) fn solicit_pending_votes(
        &mut self,
    ) -> Result<(), RaftKvError> {
        for peer in &self.votes_pending {
            self.transport_hub.send_msg(
                BusMsg::RequestVote {
                    term: self.curr_term,
                    log_length: self.log.len(),
                    last_log_term: self.log.last().map(|e| e.term as i64)
                                           .unwrap_or(-1),
                },
                peer.clone(),
                self.leader.clone().unwrap_or_else(|| BROADCAST.into()),
            )?;
            pf_trace!(self.id; "re-sent RequestVote -> {} term {}",
                               peer, self.curr_term);
        }
        Ok(())
    }

    /// Becomes the leader after enough votes granted for me.
    pub(super) fn become_the_leader(&mut self) -> Result<(), RaftKvError> {
        pf_info!(self.id; "elected to be leader with term {} ({}/{} votes)",
                          self.curr_term, self.votes_granted.len(),
                          self.population);
        self.role = Role::Leader;
        self.leader = Some(self.id.clone());
        self.heartbeater.set_sending(true);

        // re-initialize next_index and match_index information
        self.next_index = self
            .peers
            .iter()
            .map(|peer| (peer.clone(), self.log.len()))
            .collect();
        self.match_index = self
            .peers
            .iter()
            .map(|peer| (peer.clone(), -1))
            .collect();

        // broadcast a heartbeat right away to assert authority
        self.bcast_heartbeats()?;
        Ok(())
    }

    /// Broadcasts AppendEntries to all peers: pending entries to whoever is
    /// behind, empty heartbeats to the rest.
    pub(super) fn bcast_heartbeats(&mut self) -> Result<(), RaftKvError> {
        for idx in 0..self.peers.len() {
            let peer = self.peers[idx].clone();
            self.send_appends(&peer)?;
        }

        // I also heard this heartbeat from myself
        self.heard_heartbeat()?;
        Ok(())
    }

    /// Sends AppendEntries to one peer: everything from its next_index in
    /// chunks of `msg_chunk_size`, or an empty heartbeat when it is believed
    /// caught-up. The probe point is always the slot right before
    /// next_index, so a lagging follower fails the match and triggers the
    /// back-off protocol even on empty heartbeats.
    pub(super) fn send_appends(
        &mut self,
        peer: &ReplicaId,
    ) -> Result<(), RaftKvError> {
        let mut start = cmp::min(self.next_index[peer], self.log.len());

        loop {
            let end =
                cmp::min(start + self.config.msg_chunk_size, self.log.len());
            let prev_log_index = start as i64 - 1;
            let prev_log_term = if start >= 1 {
                self.log[start - 1].term as i64
            } else {
                -1
            };
            let entries = self.log[start..end].to_vec();
            let num_entries = entries.len();

            self.transport_hub.send_msg(
                BusMsg::AppendEntries {
                    term: self.curr_term,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    commit_index: self.commit_index,
                },
                peer.clone(),
                self.id.clone(),
            )?;
            if num_entries > 0 {
                pf_trace!(self.id; "sent AppendEntries -> {} with indexes {} - {}",
                                   peer, start, end - 1);
            }

            start = end;
            if start >= self.log.len() {
                break;
            }
        }

        Ok(())
    }

    /// Heard a sign of legitimate cluster activity. Resets election timer.
    pub(super) fn heard_heartbeat(&self) -> Result<(), RaftKvError> {
        if !self.config.disable_hb_timer {
            self.heartbeater.kickoff_hear_timer()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod leadership_tests {
    use super::*;

    #[test]
    fn up_to_date_predicate() {
        // empty cluster bootstrap: everyone grants
        assert!(log_up_to_date(-1, 0, -1, 0));
        // longer log of same last term wins
        assert!(log_up_to_date(2, 3, 2, 5));
        assert!(!log_up_to_date(2, 5, 2, 3));
        // higher last term wins regardless of length
        assert!(log_up_to_date(2, 9, 3, 1));
        assert!(!log_up_to_date(3, 1, 2, 9));
        // equal logs grant
        assert!(log_up_to_date(4, 4, 4, 4));
    }
}
