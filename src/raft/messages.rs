//! Replication engine -- peer-peer messaging.

use std::cmp;

use super::leadership::log_up_to_date;
use super::*;

use crate::server::ReplicaId;
use crate::utils::RaftKvError;

/// Index of the first log entry holding the given term, or −1 if the log
/// holds no entry of that term.
fn first_index_with_term(log: &[LogEntry], term: i64) -> i64 {
    log.iter()
        .position(|e| e.term as i64 == term)
        .map(|idx| idx as i64)
        .unwrap_or(-1)
}

/// Index of the last log entry holding the given term, if any.
fn last_index_with_term(log: &[LogEntry], term: i64) -> Option<usize> {
    log.iter().rposition(|e| e.term as i64 == term)
}

// RaftReplica peer-peer messages handling
impl RaftReplica {
    /// Handler of RequestVote message from candidate.
    fn handle_msg_request_vote(
        &mut self,
        candidate: ReplicaId,
        term: Term,
        log_length: usize,
        last_log_term: i64,
    ) -> Result<(), RaftKvError> {
        pf_trace!(self.id; "received RequestVote <- {} term {} log-length {} last term {}",
                           candidate, term, log_length, last_log_term);

        // if the given term is smaller than mine, reply false
        if term < self.curr_term {
            let leader_hint = self.leader_hint();
            self.transport_hub.send_msg(
                BusMsg::Vote {
                    should_vote: false,
                    term: self.curr_term,
                },
                candidate,
                leader_hint,
            )?;
            return Ok(());
        }

        let newer_term = term > self.curr_term;
        if newer_term {
            // saw a newer term: adopt it and forget stale election tallies.
            // A leader at a lower term steps down; a competing candidate
            // keeps its candidacy so its election timer can retry at an even
            // higher term.
            self.curr_term = term;
            self.voted_for = None;
            self.votes_granted.clear();
            self.votes_pending.clear();
            if self.role == Role::Leader {
                self.role = Role::Follower;
                self.heartbeater.set_sending(false);
                pf_info!(self.id; "converted back to follower");
            }
        } else {
            // a same-term request also counts as cluster activity
            self.heard_heartbeat()?;
        }

        // grant at most one vote per term, and on a fresh term only to a
        // candidate whose log is at least as up-to-date as mine
        let grant = if newer_term {
            log_up_to_date(
                self.last_log_term(),
                self.log.len(),
                last_log_term,
                log_length,
            )
        } else {
            self.voted_for.as_ref() == Some(&candidate)
        };
        if grant {
            self.voted_for = Some(candidate.clone());
            self.heard_heartbeat()?;
        }

        let leader_hint = self.leader_hint();
        self.transport_hub.send_msg(
            BusMsg::Vote {
                should_vote: grant,
                term: self.curr_term,
            },
            candidate.clone(),
            leader_hint,
        )?;
        pf_trace!(self.id; "sent Vote -> {} term {} {}",
                           candidate, self.curr_term,
                           if grant { "granted" } else { "false" });
        Ok(())
    }

    /// Handler of RequestVote reply from peer.
    fn handle_msg_vote(
        &mut self,
        peer: ReplicaId,
        should_vote: bool,
        term: Term,
    ) -> Result<(), RaftKvError> {
        pf_trace!(self.id; "received Vote <- {} term {} {}",
                           peer, term,
                           if should_vote { "granted" } else { "false" });
        if self.role != Role::Candidate {
            return Ok(()); // stale reply
        }
        if !self.votes_pending.remove(&peer) {
            return Ok(()); // duplicate reply this election round
        }

        if should_vote {
            // bookkeep this vote
            self.votes_granted.insert(peer);

            // if a majority of servers have voted for me, become the leader
            if self.votes_granted.len() as u8 >= self.majority {
                self.become_the_leader()?;
            }
        } else if term > self.curr_term {
            // adopt the higher term without changing role here; the next
            // append from its leader will correct the role
            self.curr_term = term;
            self.voted_for = None;
            self.votes_granted.clear();
            self.votes_pending.clear();
        }

        Ok(())
    }

    /// Handler of AppendEntries message from leader.
    fn handle_msg_append_entries(
        &mut self,
        leader: ReplicaId,
        term: Term,
        prev_log_index: i64,
        prev_log_term: i64,
        entries: Vec<LogEntry>,
        commit_index: i64,
    ) -> Result<(), RaftKvError> {
        if !entries.is_empty() {
            pf_trace!(self.id; "received AppendEntries <- {} for indexes {} - {} term {}",
                               leader, prev_log_index + 1,
                               prev_log_index + entries.len() as i64, term);
        }

        // reply false to a stale leader without touching any state
        if term < self.curr_term {
            let reply = BusMsg::AppendResponse {
                term: self.curr_term,
                success: false,
                index_difference: -1,
                term_difference: -1,
                entries,
                commit_index: self.commit_index,
            };
            let leader_hint = self.leader_hint();
            self.transport_hub.send_msg(reply, leader, leader_hint)?;
            return Ok(());
        }

        // a legitimate leader for this term exists: adopt the term, follow
        // it, and restart the election timer
        if term > self.curr_term {
            self.curr_term = term;
            self.voted_for = None;
        }
        self.votes_granted.clear();
        self.votes_pending.clear();
        if self.role != Role::Follower {
            self.role = Role::Follower;
            self.heartbeater.set_sending(false);
            pf_info!(self.id; "converted back to follower");
        }
        self.leader = Some(leader.clone());
        self.heard_heartbeat()?;

        // run the matching protocol at (prev_log_index, prev_log_term);
        // appends probing −1 start at the head of the log and match trivially
        if prev_log_index >= 0 {
            let prev_slot = prev_log_index as usize;
            if prev_slot >= self.log.len() {
                // my log is too short to contain the probe point
                let index_difference = self.log.len() as i64 - 1;
                let term_difference = self.last_log_term();
                let reply = BusMsg::AppendResponse {
                    term: self.curr_term,
                    success: false,
                    index_difference,
                    term_difference,
                    entries,
                    commit_index: self.commit_index,
                };
                self.transport_hub.send_msg(
                    reply,
                    leader.clone(),
                    leader.clone(),
                )?;
                pf_trace!(self.id; "sent AppendResponse -> {} fail, log too short ({})",
                                   leader, self.log.len());
                return Ok(());
            }
            if self.log[prev_slot].term as i64 != prev_log_term {
                // conflicting history at the probe point; hint my first
                // index of the probed term so the leader can jump its
                // next_index in one step
                let index_difference =
                    first_index_with_term(&self.log, prev_log_term);
                let reply = BusMsg::AppendResponse {
                    term: self.curr_term,
                    success: false,
                    index_difference,
                    term_difference: prev_log_term,
                    entries,
                    commit_index: self.commit_index,
                };
                self.transport_hub.send_msg(
                    reply,
                    leader.clone(),
                    leader.clone(),
                )?;
                pf_trace!(self.id; "sent AppendResponse -> {} fail, conflict at {}",
                                   leader, prev_slot);
                return Ok(());
            }
        }

        // reconcile: skip entries I already hold, truncate my uncommitted
        // suffix at the first conflicting entry, then append the rest.
        // Re-delivery of an already-appended batch leaves the log unchanged.
        let base = (prev_log_index + 1) as usize;
        let mut first_new = base + entries.len();
        for (slot, entry) in
            entries.iter().enumerate().map(|(s, e)| (s + base, e))
        {
            if slot >= self.log.len() {
                first_new = slot;
                break;
            } else if self.log[slot].term != entry.term {
                self.log.truncate(slot);
                first_new = slot;
                break;
            }
        }
        for entry in entries.iter().skip(first_new - base) {
            debug_assert_eq!(entry.index, self.log.len());
            self.log.push(entry.clone());
        }

        // chase the leader's commit watermark, bounded by my log length
        if commit_index > self.commit_index {
            let new_commit =
                cmp::min(commit_index, self.log.len() as i64 - 1);
            if new_commit > self.commit_index {
                let from = self.commit_index;
                self.commit_index = new_commit;
                self.submit_newly_committed(from)?;
            }
        }

        // ack with the echoed batch so the leader can attribute the indices
        let reply = BusMsg::AppendResponse {
            term: self.curr_term,
            success: true,
            index_difference: -1,
            term_difference: -1,
            entries,
            commit_index: self.commit_index,
        };
        self.transport_hub.send_msg(reply, leader.clone(), leader)?;
        Ok(())
    }

    /// Handler of AppendEntries reply from follower.
    fn handle_msg_append_response(
        &mut self,
        peer: ReplicaId,
        term: Term,
        success: bool,
        index_difference: i64,
        term_difference: i64,
        entries: Vec<LogEntry>,
    ) -> Result<(), RaftKvError> {
        if self.role != Role::Leader {
            return Ok(()); // stale reply
        }
        if !self.next_index.contains_key(&peer) {
            return Ok(()); // not a peer of mine
        }

        if term > self.curr_term {
            // somebody out there has moved on to a newer term; step down
            self.curr_term = term;
            self.voted_for = None;
            self.votes_granted.clear();
            self.votes_pending.clear();
            self.role = Role::Follower;
            self.leader = None;
            self.heartbeater.set_sending(false);
            self.heard_heartbeat()?;
            pf_info!(self.id; "converted back to follower");
            return Ok(());
        }

        if success {
            // success: the echoed batch tells which indices this follower
            // now holds
            if let Some(last) = entries.last() {
                let last_idx = last.index;
                let matched = self.match_index.get_mut(&peer).unwrap();
                if last_idx as i64 > *matched {
                    *matched = last_idx as i64;
                }
                let next = self.next_index.get_mut(&peer).unwrap();
                if last_idx + 1 > *next {
                    *next = last_idx + 1;
                }

                // some match_index moved, so entries may now be committed
                self.try_advance_commit()?;
            }
        } else {
            // failed: rewind next_index using the conflict hints, then
            // retry immediately instead of waiting out a heartbeat interval
            let rewound = if index_difference >= 0
                && (index_difference as usize) < self.log.len()
                && self.log[index_difference as usize].term as i64
                    == term_difference
            {
                // follower's hinted slot agrees with my history; resume there
                index_difference as usize
            } else {
                // skip the whole conflicting term on my side
                last_index_with_term(&self.log, term_difference - 1)
                    .unwrap_or(0)
            };
            let rewound = cmp::min(rewound, self.log.len());
            pf_debug!(self.id; "rewound next_index[{}] -> {}", peer, rewound);
            self.next_index.insert(peer.clone(), rewound);
            self.send_appends(&peer)?;
        }

        Ok(())
    }

    /// Checks whether any entries past the current commit index are now
    /// replicated on a majority, and commits them if so. Only entries of the
    /// current term may advance the commit index; earlier entries commit
    /// transitively with them.
    pub(super) fn try_advance_commit(&mut self) -> Result<(), RaftKvError> {
        let mut new_commit = self.commit_index;
        for slot in ((self.commit_index + 1).max(0) as usize)..self.log.len()
        {
            if self.log[slot].term != self.curr_term {
                continue; // cannot decide commit using non-latest term
            }

            let ack_cnt = 1 + self
                .match_index
                .values()
                .filter(|&&matched| matched >= slot as i64)
                .count() as u8;
            if ack_cnt >= self.majority {
                new_commit = slot as i64;
            }
        }

        if new_commit > self.commit_index {
            pf_debug!(self.id; "advanced commit index {} -> {}",
                               self.commit_index, new_commit);
            let from = self.commit_index;
            self.commit_index = new_commit;
            self.submit_newly_committed(from)?;
        }

        Ok(())
    }

    /// Synthesized handler of receiving message from peer.
    pub(super) async fn handle_peer_msg(
        &mut self,
        peer: ReplicaId,
        msg: BusMsg,
    ) -> Result<(), RaftKvError> {
        match msg {
            BusMsg::RequestVote {
                term,
                log_length,
                last_log_term,
            } => self.handle_msg_request_vote(
                peer,
                term,
                log_length,
                last_log_term,
            ),
            BusMsg::Vote { should_vote, term } => {
                self.handle_msg_vote(peer, should_vote, term)
            }
            BusMsg::AppendEntries {
                term,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index,
            } => self.handle_msg_append_entries(
                peer,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index,
            ),
            BusMsg::AppendResponse {
                term,
                success,
                index_difference,
                term_difference,
                entries,
                commit_index: _,
            } => self.handle_msg_append_response(
                peer,
                term,
                success,
                index_difference,
                term_difference,
                entries,
            ),
            _ => logged_err!(self.id; "unexpected bus msg type received"),
        }
    }
}

#[cfg(test)]
mod messages_tests {
    use super::*;

    fn mk_entry(term: Term, index: usize) -> LogEntry {
        LogEntry {
            term,
            index,
            key: format!("k{}", index),
            value: format!("v{}", index),
            client: "C1".into(),
            mid: format!("m{}", index),
        }
    }

    #[test]
    fn first_index_hints() {
        let log: Vec<LogEntry> = [1, 1, 2, 2, 2, 4]
            .iter()
            .enumerate()
            .map(|(idx, &term)| mk_entry(term, idx))
            .collect();
        assert_eq!(first_index_with_term(&log, 1), 0);
        assert_eq!(first_index_with_term(&log, 2), 2);
        assert_eq!(first_index_with_term(&log, 4), 5);
        assert_eq!(first_index_with_term(&log, 3), -1);
        assert_eq!(first_index_with_term(&[], 1), -1);
    }

    #[test]
    fn last_index_hints() {
        let log: Vec<LogEntry> = [1, 1, 2, 2, 2, 4]
            .iter()
            .enumerate()
            .map(|(idx, &term)| mk_entry(term, idx))
            .collect();
        assert_eq!(last_index_with_term(&log, 1), Some(1));
        assert_eq!(last_index_with_term(&log, 2), Some(4));
        assert_eq!(last_index_with_term(&log, 3), None);
        assert_eq!(last_index_with_term(&[], 1), None);
    }
}
