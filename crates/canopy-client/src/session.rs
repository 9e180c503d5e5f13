//! Agent side of the control stream
//!
//! After the registration handshake a driver task owns the connection: it
//! writes queued agent messages, answers server pings and forwards server
//! messages to the session. Forwarding never waits on the consumer, so pings
//! are answered even while nobody calls [`AgentSession::next`].

use crate::client::ClientFramed;
use crate::{ClientError, ClientResult};
use canopy_proto::{
    AgentHealth, AgentMessage, AgentPayload, Frame, Heartbeat, RegistrationAck, ServerMessage,
    ServerPayload,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const OUTGOING_BUFFER: usize = 32;

/// Wait for the server's registration ack, answering pings meanwhile
pub(crate) async fn await_ack(framed: &mut ClientFramed) -> ClientResult<RegistrationAck> {
    loop {
        match framed.next().await {
            Some(Ok(Frame::Server(ServerMessage {
                payload: ServerPayload::RegistrationAck(ack),
                ..
            }))) => return Ok(ack),
            Some(Ok(Frame::Server(other))) => {
                return Err(ClientError::Protocol(format!(
                    "expected registration ack, got {}",
                    other.kind()
                )))
            }
            Some(Ok(Frame::Ping { timestamp })) => framed.send(Frame::Pong { timestamp }).await?,
            Some(Ok(Frame::Pong { .. })) => {}
            Some(Ok(Frame::Close(Some(status)))) => return Err(ClientError::Rpc(status)),
            Some(Ok(Frame::Close(None))) | None => return Err(ClientError::ConnectionClosed),
            Some(Ok(other)) => {
                return Err(ClientError::Protocol(format!(
                    "unexpected frame during registration: {:?}",
                    other
                )))
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// A registered agent stream
#[derive(Debug)]
pub struct AgentSession {
    ack: RegistrationAck,
    outgoing: mpsc::Sender<Frame>,
    incoming: mpsc::UnboundedReceiver<ClientResult<ServerMessage>>,
    driver: JoinHandle<()>,
}

impl AgentSession {
    pub(crate) fn start(framed: ClientFramed, ack: RegistrationAck) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(framed, outgoing_rx, incoming_tx));

        Self {
            ack,
            outgoing: outgoing_tx,
            incoming: incoming_rx,
            driver,
        }
    }

    /// The server's acknowledgment of this session's registration
    pub fn ack(&self) -> &RegistrationAck {
        &self.ack
    }

    pub fn session_id(&self) -> &str {
        &self.ack.session_id
    }

    /// Queue a message for the server; returns its message id
    pub async fn send(&self, payload: AgentPayload) -> ClientResult<String> {
        let message = AgentMessage::new(payload);
        let message_id = message.message_id.clone();
        self.outgoing
            .send(Frame::Agent(message))
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(message_id)
    }

    pub async fn heartbeat(&self, status: AgentHealth, active_jobs: u32) -> ClientResult<String> {
        self.send(AgentPayload::Heartbeat(Heartbeat {
            status,
            active_jobs,
        }))
        .await
    }

    /// Next message from the server; `None` once the server ends the stream
    ///
    /// Messages are buffered without limit until read.
    pub async fn next(&mut self) -> ClientResult<Option<ServerMessage>> {
        match self.incoming.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// End the stream and wait for the server's final status
    ///
    /// Server messages not yet read are discarded.
    pub async fn close(self) -> ClientResult<()> {
        let AgentSession {
            outgoing,
            mut incoming,
            driver,
            ..
        } = self;
        drop(outgoing);

        let mut outcome = Ok(());
        while let Some(item) = incoming.recv().await {
            if let Err(e) = item {
                outcome = Err(e);
            }
        }
        if let Err(e) = driver.await {
            warn!(error = %e, "Session driver task failed");
        }
        outcome
    }
}

async fn drive(
    mut framed: ClientFramed,
    mut outgoing: mpsc::Receiver<Frame>,
    incoming: mpsc::UnboundedSender<ClientResult<ServerMessage>>,
) {
    let mut sending = true;

    loop {
        tokio::select! {
            frame = outgoing.recv(), if sending => {
                let frame = match frame {
                    Some(frame) => frame,
                    None => {
                        // Session closed locally; half-close and wait for the server
                        sending = false;
                        Frame::Close(None)
                    }
                };
                if let Err(e) = framed.send(frame).await {
                    let _ = incoming.send(Err(e.into()));
                    return;
                }
            }
            frame = framed.next() => match frame {
                Some(Ok(Frame::Server(message))) => {
                    if incoming.send(Ok(message)).is_err() && !sending {
                        return;
                    }
                }
                Some(Ok(Frame::Ping { timestamp })) => {
                    if let Err(e) = framed.send(Frame::Pong { timestamp }).await {
                        let _ = incoming.send(Err(e.into()));
                        return;
                    }
                }
                Some(Ok(Frame::Pong { .. })) => {}
                Some(Ok(Frame::Close(status))) => {
                    debug!(status = ?status, "Server closed agent stream");
                    if let Some(status) = status {
                        let _ = incoming.send(Err(ClientError::Rpc(status)));
                    }
                    return;
                }
                Some(Ok(other)) => {
                    let _ = incoming.send(Err(ClientError::Protocol(format!(
                        "unexpected frame on agent stream: {:?}",
                        other
                    ))));
                    return;
                }
                Some(Err(e)) => {
                    let _ = incoming.send(Err(e.into()));
                    return;
                }
                None => {
                    debug!("Server disconnected");
                    return;
                }
            },
        }
    }
}
