//! RaftKV server datagram transport module implementation.
//!
//! All traffic (peer-to-peer and client-facing) flows through one central
//! simulator socket on localhost, addressed by short replica IDs inside a
//! self-describing JSON envelope. The bus is lossy, unordered, and
//! unauthenticated; durability of any single datagram is never assumed by
//! upper layers.

use std::fmt;
use std::sync::Arc;

use crate::server::{ReplicaId, BROADCAST};
use crate::utils::RaftKvError;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Maximum size of one datagram off the simulator bus.
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Universal message envelope. Every datagram on the bus is exactly one
/// envelope; the type-specific fields of `msg` are flattened alongside the
/// addressing fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<Msg> {
    /// Sender ID.
    pub src: ReplicaId,

    /// Receiver ID, or `FFFF` for broadcast.
    pub dst: ReplicaId,

    /// Best-known leader ID at the sender, or `FFFF` if unknown.
    pub leader: ReplicaId,

    /// Tagged message body.
    #[serde(flatten)]
    pub msg: Msg,
}

/// Server datagram transport module.
pub(crate) struct TransportHub<Msg> {
    /// My replica ID.
    me: ReplicaId,

    /// Receiver side of the recv channel, filled by the listener task.
    rx_recv: mpsc::UnboundedReceiver<Envelope<Msg>>,

    /// Sender side of the send channel, drained by the messenger task.
    tx_send: mpsc::UnboundedSender<Envelope<Msg>>,

    /// Join handle of the listener task.
    _listener_handle: JoinHandle<()>,

    /// Join handle of the messenger task.
    _messenger_handle: JoinHandle<()>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Creates a new datagram transport hub. Binds an ephemeral local UDP
    /// port, points it at the simulator socket, and spawns the listener and
    /// messenger tasks.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        sim_port: u16,
    ) -> Result<Self, RaftKvError> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        socket.connect(("127.0.0.1", sim_port)).await?;
        let socket = Arc::new(socket);

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_send, rx_send) = mpsc::unbounded_channel();

        let listener_handle = tokio::spawn(Self::listener_task(
            me.clone(),
            socket.clone(),
            tx_recv,
        ));
        let messenger_handle =
            tokio::spawn(Self::messenger_task(me.clone(), socket, rx_send));

        Ok(TransportHub {
            me,
            rx_recv,
            tx_send,
            _listener_handle: listener_handle,
            _messenger_handle: messenger_handle,
        })
    }

    /// Sends a message to a given replica or client ID by enqueueing it to
    /// the messenger task.
    pub(crate) fn send_msg(
        &mut self,
        msg: Msg,
        dst: ReplicaId,
        leader: ReplicaId,
    ) -> Result<(), RaftKvError> {
        self.tx_send
            .send(Envelope {
                src: self.me.clone(),
                dst,
                leader,
                msg,
            })
            .map_err(|e| RaftKvError(e.to_string()))
    }

    /// Broadcasts a message to all peer replicas through the simulator's
    /// `FFFF` fan-out address.
    pub(crate) fn bcast_msg(
        &mut self,
        msg: Msg,
        leader: ReplicaId,
    ) -> Result<(), RaftKvError> {
        self.send_msg(msg, BROADCAST.into(), leader)
    }

    /// Waits for the next incoming envelope addressed to me (or broadcast).
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<Envelope<Msg>, RaftKvError> {
        match self.rx_recv.recv().await {
            Some(envelope) => Ok(envelope),
            None => Err(RaftKvError::msg("recv channel has been closed")),
        }
    }
}

// TransportHub background tasks implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Listener task: decodes datagrams off the socket and forwards
    /// well-formed envelopes addressed to me into the recv channel.
    async fn listener_task(
        me: ReplicaId,
        socket: Arc<UdpSocket>,
        tx_recv: mpsc::UnboundedSender<Envelope<Msg>>,
    ) {
        pf_debug!(me; "listener task spawned");
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let len = match socket.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    pf_error!(me; "error receiving datagram: {}", e);
                    continue;
                }
            };

            match serde_json::from_slice::<Envelope<Msg>>(&buf[..len]) {
                Ok(envelope) => {
                    // messages not for me may show up on a misbehaving bus
                    if envelope.dst != me && envelope.dst != BROADCAST {
                        pf_trace!(me; "ignored stray datagram dst {}",
                                      envelope.dst);
                        continue;
                    }
                    if tx_recv.send(envelope).is_err() {
                        break; // hub dropped, terminate
                    }
                }
                Err(e) => {
                    pf_warn!(me; "dropped undecodable datagram: {}", e);
                }
            }
        }

        pf_debug!(me; "listener task exited");
    }

    /// Messenger task: encodes envelopes from the send channel and writes
    /// them to the simulator socket.
    async fn messenger_task(
        me: ReplicaId,
        socket: Arc<UdpSocket>,
        mut rx_send: mpsc::UnboundedReceiver<Envelope<Msg>>,
    ) {
        pf_debug!(me; "messenger task spawned");

        while let Some(envelope) = rx_send.recv().await {
            match serde_json::to_vec(&envelope) {
                Ok(bytes) => {
                    if let Err(e) = socket.send(&bytes).await {
                        pf_error!(me; "error sending datagram -> {}: {}",
                                      envelope.dst, e);
                    }
                }
                Err(e) => {
                    pf_error!(me; "error encoding envelope: {}", e);
                }
            }
        }

        pf_debug!(me; "messenger task exited");
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;

    #[derive(
        Debug, PartialEq, Eq, Clone, Serialize, Deserialize,
    )]
    #[serde(tag = "type")]
    enum TestMsg {
        #[serde(rename = "ping")]
        Ping { seq: u64 },

        #[serde(rename = "pong")]
        Pong { seq: u64 },
    }

    #[test]
    fn envelope_codec() -> Result<(), RaftKvError> {
        let envelope = Envelope {
            src: "A".to_string(),
            dst: BROADCAST.to_string(),
            leader: "C".to_string(),
            msg: TestMsg::Ping { seq: 7 },
        };
        let bytes = serde_json::to_vec(&envelope)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        assert_eq!(value["src"], "A");
        assert_eq!(value["dst"], "FFFF");
        assert_eq!(value["leader"], "C");
        assert_eq!(value["type"], "ping");
        assert_eq!(value["seq"], 7);

        let decoded: Envelope<TestMsg> = serde_json::from_slice(&bytes)?;
        assert_eq!(decoded.src, envelope.src);
        assert_eq!(decoded.msg, envelope.msg);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hub_send_recv() -> Result<(), RaftKvError> {
        // a stand-in simulator socket that bounces everything to the sender
        let sim = UdpSocket::bind("127.0.0.1:0").await?;
        let sim_port = sim.local_addr()?.port();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            while let Ok((len, addr)) = sim.recv_from(&mut buf).await {
                sim.send_to(&buf[..len], addr).await.unwrap();
            }
        });

        let mut hub: TransportHub<TestMsg> =
            TransportHub::new_and_setup("A".into(), sim_port).await?;
        hub.send_msg(
            TestMsg::Pong { seq: 33 },
            "A".into(),
            BROADCAST.into(),
        )?;
        let envelope = hub.recv_msg().await?;
        assert_eq!(envelope.src, "A");
        assert_eq!(envelope.msg, TestMsg::Pong { seq: 33 });
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hub_drops_stray() -> Result<(), RaftKvError> {
        let sim = UdpSocket::bind("127.0.0.1:0").await?;
        let sim_port = sim.local_addr()?.port();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            while let Ok((len, addr)) = sim.recv_from(&mut buf).await {
                sim.send_to(&buf[..len], addr).await.unwrap();
            }
        });

        let mut hub: TransportHub<TestMsg> =
            TransportHub::new_and_setup("A".into(), sim_port).await?;
        // addressed to somebody else entirely
        hub.send_msg(TestMsg::Ping { seq: 1 }, "B".into(), BROADCAST.into())?;
        hub.send_msg(TestMsg::Ping { seq: 2 }, "A".into(), BROADCAST.into())?;
        let envelope = hub.recv_msg().await?;
        assert_eq!(envelope.msg, TestMsg::Ping { seq: 2 });
        Ok(())
    }
}
