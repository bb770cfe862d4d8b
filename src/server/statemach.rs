//! RaftKV server state machine module implementation.

use std::collections::HashMap;

use crate::server::ReplicaId;
use crate::utils::RaftKvError;

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Command ID type. Composed by the replication engine to attribute execution
/// results back to log slots or in-flight reads.
pub type CommandId = u64;

/// Command to the state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Get the value of given key.
    Get { key: String },

    /// Put a new value into key.
    Put { key: String, value: String },
}

/// Command execution result returned by the state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    /// `Some(value)` if key is found in state machine, else `None`.
    Get { value: Option<String> },

    /// `Some(old_value)` if key was in state machine, else `None`.
    Put { old_value: Option<String> },
}

/// State is simply a `HashMap` from `String` key -> `String` value.
type State = HashMap<String, String>;

/// The local volatile state machine, which is simply an in-memory HashMap
/// owned by a spawned executor task. Commands submitted through the exec
/// channel are executed strictly in submission order.
pub(crate) struct StateMachine {
    /// My replica ID.
    _me: ReplicaId,

    /// Sender side of the exec channel.
    tx_exec: mpsc::UnboundedSender<(CommandId, Command)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<(CommandId, CommandResult)>,

    /// Join handle of the executor task. The state HashMap is owned by this
    /// task.
    _executor_handle: JoinHandle<()>,
}

// StateMachine public API implementation
impl StateMachine {
    /// Creates a new state machine module and spawns the executor task.
    /// Creates an exec channel for submitting commands to the state machine
    /// and an ack channel for getting results.
    pub(crate) fn new_and_setup(
        me: ReplicaId,
    ) -> Result<Self, RaftKvError> {
        let (tx_exec, rx_exec) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();

        let executor_handle =
            tokio::spawn(Self::executor_task(me.clone(), rx_exec, tx_ack));

        Ok(StateMachine {
            _me: me,
            tx_exec,
            rx_ack,
            _executor_handle: executor_handle,
        })
    }

    /// Submits a command by sending it to the exec channel.
    pub(crate) fn submit_cmd(
        &mut self,
        id: CommandId,
        cmd: Command,
    ) -> Result<(), RaftKvError> {
        self.tx_exec
            .send((id, cmd))
            .map_err(|e| RaftKvError(e.to_string()))
    }

    /// Waits for the next execution result by receiving from the ack channel.
    pub(crate) async fn get_result(
        &mut self,
    ) -> Result<(CommandId, CommandResult), RaftKvError> {
        match self.rx_ack.recv().await {
            Some((id, result)) => Ok((id, result)),
            None => Err(RaftKvError::msg("ack channel has been closed")),
        }
    }
}

// StateMachine executor task implementation
impl StateMachine {
    /// Executes given command on the state machine state.
    fn execute(state: &mut State, cmd: &Command) -> CommandResult {
        match cmd {
            Command::Get { key } => CommandResult::Get {
                value: state.get(key).cloned(),
            },
            Command::Put { key, value } => CommandResult::Put {
                old_value: state.insert(key.clone(), value.clone()),
            },
        }
    }

    /// Executor task function.
    async fn executor_task(
        me: ReplicaId,
        mut rx_exec: mpsc::UnboundedReceiver<(CommandId, Command)>,
        tx_ack: mpsc::UnboundedSender<(CommandId, CommandResult)>,
    ) {
        pf_debug!(me; "executor task spawned");

        // create the state HashMap
        let mut state = State::new();

        while let Some((id, cmd)) = rx_exec.recv().await {
            let res = Self::execute(&mut state, &cmd);
            pf_trace!(me; "executed {:?}", cmd);

            if tx_ack.send((id, res)).is_err() {
                break; // receiver gone, replica is shutting down
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "executor task exited");
    }
}

#[cfg(test)]
mod statemach_tests {
    use super::*;

    #[test]
    fn get_empty() {
        let mut state = State::new();
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Get { key: "x".into() }
            ),
            CommandResult::Get { value: None }
        );
    }

    #[test]
    fn put_one_get_one() {
        let mut state = State::new();
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Put {
                    key: "x".into(),
                    value: "84".into(),
                }
            ),
            CommandResult::Put { old_value: None }
        );
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Get { key: "x".into() }
            ),
            CommandResult::Get {
                value: Some("84".into())
            }
        );
    }

    #[test]
    fn put_twice() {
        let mut state = State::new();
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Put {
                    key: "x".into(),
                    value: "84".into()
                }
            ),
            CommandResult::Put { old_value: None }
        );
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Put {
                    key: "x".into(),
                    value: "96".into()
                }
            ),
            CommandResult::Put {
                old_value: Some("84".into())
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_exec_ack() -> Result<(), RaftKvError> {
        let mut sm = StateMachine::new_and_setup("A".into())?;
        sm.submit_cmd(
            0,
            Command::Put {
                key: "x".into(),
                value: "84".into(),
            },
        )?;
        sm.submit_cmd(1, Command::Get { key: "x".into() })?;
        sm.submit_cmd(2, Command::Get { key: "y".into() })?;
        assert_eq!(
            sm.get_result().await?,
            (0, CommandResult::Put { old_value: None })
        );
        assert_eq!(
            sm.get_result().await?,
            (
                1,
                CommandResult::Get {
                    value: Some("84".into())
                }
            )
        );
        assert_eq!(
            sm.get_result().await?,
            (2, CommandResult::Get { value: None })
        );
        Ok(())
    }
}
