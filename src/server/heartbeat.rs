//! RaftKV server heartbeats management module implementation.

use crate::server::ReplicaId;
use crate::utils::{RaftKvError, Timer};

use rand::prelude::*;

use tokio::time::{self, Duration, Interval, MissedTickBehavior};

/// Multiplexed heartbeat timeout events type.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum HeartbeatEvent {
    /// Leader inactivity timeout; an election should be started.
    HearTimeout,

    /// Sending interval tick; a leader broadcasts appends, a candidate
    /// re-solicits pending votes.
    SendTicked,
}

/// The heartbeats management module. Owns the randomized election timeout
/// timer and the fixed-rate sending interval.
pub(crate) struct Heartbeater {
    /// My replica ID.
    _me: ReplicaId,

    /// Timer for hearing heartbeat from leader.
    hear_timer: Timer,

    /// Minimum hearing timeout interval.
    hear_timeout_min: Duration,

    /// Maximum hearing timeout interval.
    hear_timeout_max: Duration,

    /// Interval for sending heartbeat to peers.
    send_interval: Interval,

    /// True if sending ticks are enabled; false otherwise.
    is_sending: bool,
}

impl Heartbeater {
    /// Creates a new heartbeats manager.
    pub(crate) fn new_and_setup(
        me: ReplicaId,
        hear_timeout_min: Duration,
        hear_timeout_max: Duration,
        send_interval: Duration,
    ) -> Result<Heartbeater, RaftKvError> {
        if hear_timeout_min < Duration::from_millis(100) {
            return logged_err!(
                me;
                "invalid heartbeat min hear_timeout {:?}",
                hear_timeout_min
            );
        }
        if hear_timeout_max < hear_timeout_min + Duration::from_millis(100) {
            return logged_err!(
                me;
                "heartbeat max hear_timeout {:?} must be >= 100ms + min hear_timeout {:?}",
                hear_timeout_max, hear_timeout_min
            );
        }
        if send_interval < Duration::from_millis(1)
            || send_interval > hear_timeout_min
        {
            return logged_err!(
                me;
                "invalid heartbeat send_interval {:?}",
                send_interval
            );
        }

        let mut send_interval = time::interval(send_interval);
        send_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Ok(Heartbeater {
            _me: me,
            hear_timer: Timer::new(),
            hear_timeout_min,
            hear_timeout_max,
            send_interval,
            is_sending: false,
        })
    }

    /// Sets the sending flag.
    pub(crate) fn set_sending(&mut self, sending: bool) {
        self.is_sending = sending;
    }

    /// Waits for a heartbeat-related timeout event.
    pub(crate) async fn get_event(
        &mut self,
    ) -> Result<HeartbeatEvent, RaftKvError> {
        tokio::select! {
            // hearing timeout
            () = self.hear_timer.timeout() => {
                Ok(HeartbeatEvent::HearTimeout)
            },

            // sending tick
            _ = self.send_interval.tick(), if self.is_sending => {
                Ok(HeartbeatEvent::SendTicked)
            },
        }
    }

    /// Chooses a random timeout from the min-max range and kicks off the
    /// heartbeat hearing timer.
    pub(crate) fn kickoff_hear_timer(&self) -> Result<(), RaftKvError> {
        self.hear_timer.cancel()?;

        let timeout_ms = thread_rng().gen_range(
            self.hear_timeout_min.as_millis()
                ..=self.hear_timeout_max.as_millis(),
        );
        self.hear_timer
            .kickoff(Duration::from_millis(timeout_ms as u64))
    }
}

#[cfg(test)]
mod heartbeat_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_params() {
        assert!(Heartbeater::new_and_setup(
            "A".into(),
            Duration::from_millis(10),
            Duration::from_millis(400),
            Duration::from_millis(100),
        )
        .is_err());
        assert!(Heartbeater::new_and_setup(
            "A".into(),
            Duration::from_millis(200),
            Duration::from_millis(250),
            Duration::from_millis(100),
        )
        .is_err());
        assert!(Heartbeater::new_and_setup(
            "A".into(),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(300),
        )
        .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hear_timeout_fires() -> Result<(), RaftKvError> {
        let mut hb = Heartbeater::new_and_setup(
            "A".into(),
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(50),
        )?;
        hb.kickoff_hear_timer()?;
        assert_eq!(hb.get_event().await?, HeartbeatEvent::HearTimeout);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_tick_when_enabled() -> Result<(), RaftKvError> {
        let mut hb = Heartbeater::new_and_setup(
            "A".into(),
            Duration::from_millis(400),
            Duration::from_millis(800),
            Duration::from_millis(20),
        )?;
        hb.set_sending(true);
        assert_eq!(hb.get_event().await?, HeartbeatEvent::SendTicked);
        Ok(())
    }
}
