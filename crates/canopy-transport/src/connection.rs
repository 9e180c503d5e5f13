//! Server-side connection driver
//!
//! A [`ServerConnection`] wraps one accepted (TLS) stream. It first waits for
//! the peer's `Open` frame. Unary calls are answered in place; the agent stream
//! is handed to a background driver task that owns the socket, exchanges
//! frames with the peer, enforces the keepalive policy and exposes the stream
//! as a pair of typed channels.

use crate::keepalive::{KeepalivePolicy, KeepaliveViolation, PingPolicer};
use crate::{TransportError, TransportResult};
use canopy_proto::{
    AgentMessage, Call, CodecError, Frame, FrameCodec, Reply, RpcStatus, ServerMessage,
};
use futures::channel::{mpsc, oneshot};
use futures::{Sink, SinkExt, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INBOUND_BUFFER: usize = 32;
const OUTBOUND_BUFFER: usize = 32;

pub type InboundStream = mpsc::Receiver<Result<AgentMessage, RpcStatus>>;

/// One accepted control-plane connection
pub struct ServerConnection<S> {
    framed: Framed<S, FrameCodec>,
    policy: KeepalivePolicy,
    policer: PingPolicer,
    peer: String,
    opened_at: Instant,
}

impl<S> ServerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: S, policy: KeepalivePolicy, peer: impl Into<String>) -> Self {
        let policer = PingPolicer::new(&policy);
        Self {
            framed: Framed::new(io, FrameCodec::new()),
            policy,
            policer,
            peer: peer.into(),
            opened_at: Instant::now(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Wait for the peer to open a call, answering pings meanwhile
    ///
    /// Bounded by the policy's idle limit.
    pub async fn accept_call(&mut self) -> TransportResult<Call> {
        let deadline = self.opened_at + self.policy.max_connection_idle;

        loop {
            let frame = match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Err(_) => {
                    debug!(peer = %self.peer, "Connection idle without opening a call");
                    return Err(TransportError::Timeout);
                }
                Ok(None) => return Err(TransportError::StreamClosed),
                Ok(Some(frame)) => frame?,
            };

            match frame {
                Frame::Open(call) => return Ok(call),
                Frame::Ping { timestamp } => {
                    if let Err(violation) = self.policer.on_ping(Instant::now(), false) {
                        warn!(peer = %self.peer, "Closing connection: {}", violation);
                        let status = RpcStatus::resource_exhausted(violation.to_string());
                        let _ = self.send_close(Some(status)).await;
                        return Err(violation.into());
                    }
                    self.framed.send(Frame::Pong { timestamp }).await?;
                }
                Frame::Pong { .. } => {}
                other => {
                    return Err(TransportError::ProtocolError(format!(
                        "expected Open frame, got {}",
                        frame_name(&other)
                    )))
                }
            }
        }
    }

    /// Answer a unary call and close the connection
    pub async fn reply(mut self, reply: Result<Reply, RpcStatus>) -> TransportResult<()> {
        self.framed.send(Frame::Reply(reply)).await?;
        self.framed.close().await?;
        Ok(())
    }

    /// Close without streaming, e.g. when an agent stream is refused
    pub async fn close(mut self, status: Option<RpcStatus>) -> TransportResult<()> {
        self.send_close(status).await
    }

    async fn send_close(&mut self, status: Option<RpcStatus>) -> TransportResult<()> {
        self.framed.send(Frame::Close(status)).await?;
        self.framed.close().await?;
        Ok(())
    }

    /// Hand the connection to a driver task and expose it as typed channels
    ///
    /// `cancel` fires when the connection reaches its maximum age or the
    /// driver gives up on the peer; the stream's consumer should treat it as
    /// a request to finish.
    pub fn into_stream(self, cancel: CancellationToken) -> StreamHalves {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (finish_tx, finish_rx) = oneshot::channel();

        let driver = StreamDriver {
            framed: self.framed,
            policy: self.policy,
            policer: self.policer,
            peer: self.peer,
            opened_at: self.opened_at,
            cancel,
            inbound_tx: Some(inbound_tx),
        };
        let pump = tokio::spawn(driver.run(outbound_rx, finish_rx));

        StreamHalves {
            inbound: inbound_rx,
            outbound: OutboundSink { tx: outbound_tx },
            closer: StreamCloser { finish_tx, pump },
        }
    }
}

/// The agent stream as seen by the control service
pub struct StreamHalves {
    /// Messages from the agent; an `Err` item is a transport-level failure
    pub inbound: InboundStream,
    pub outbound: OutboundSink,
    pub closer: StreamCloser,
}

/// Sink for messages to the agent
#[derive(Debug, Clone)]
pub struct OutboundSink {
    tx: mpsc::Sender<ServerMessage>,
}

fn sink_closed(_: mpsc::SendError) -> RpcStatus {
    RpcStatus::unavailable("connection closed")
}

impl Sink<ServerMessage> for OutboundSink {
    type Error = RpcStatus;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RpcStatus>> {
        Pin::new(&mut self.get_mut().tx)
            .poll_ready(cx)
            .map_err(sink_closed)
    }

    fn start_send(self: Pin<&mut Self>, item: ServerMessage) -> Result<(), RpcStatus> {
        Pin::new(&mut self.get_mut().tx)
            .start_send(item)
            .map_err(sink_closed)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RpcStatus>> {
        Pin::new(&mut self.get_mut().tx)
            .poll_flush(cx)
            .map_err(sink_closed)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), RpcStatus>> {
        Pin::new(&mut self.get_mut().tx)
            .poll_close(cx)
            .map_err(sink_closed)
    }
}

/// Completes the stream once the control service has returned
pub struct StreamCloser {
    finish_tx: oneshot::Sender<Option<RpcStatus>>,
    pump: JoinHandle<()>,
}

impl StreamCloser {
    /// Report the stream outcome to the peer and wait for the driver to exit
    ///
    /// The driver sends the final status once every outbound sink is dropped.
    pub async fn finish(self, status: Option<RpcStatus>) {
        let _ = self.finish_tx.send(status);
        if let Err(e) = self.pump.await {
            warn!(error = %e, "Connection driver task failed");
        }
    }
}

struct StreamDriver<S> {
    framed: Framed<S, FrameCodec>,
    policy: KeepalivePolicy,
    policer: PingPolicer,
    peer: String,
    opened_at: Instant,
    cancel: CancellationToken,
    inbound_tx: Option<mpsc::Sender<Result<AgentMessage, RpcStatus>>>,
}

impl<S> StreamDriver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(
        mut self,
        mut outbound_rx: mpsc::Receiver<ServerMessage>,
        finish_rx: oneshot::Receiver<Option<RpcStatus>>,
    ) {
        let failure = self.exchange(&mut outbound_rx).await;

        match failure {
            None => {
                self.inbound_tx = None;
                let status = finish_rx.await.unwrap_or(None);
                debug!(peer = %self.peer, status = ?status, "Agent stream finished");
                self.close_peer(status).await;
            }
            Some(status) => {
                warn!(peer = %self.peer, status = %status, "Terminating agent stream");
                self.cancel.cancel();
                if let Some(mut tx) = self.inbound_tx.take() {
                    let _ = tx.try_send(Err(status.clone()));
                }
                self.close_peer(Some(status)).await;
            }
        }
    }

    /// Pump frames until the service drops its sink (`None`) or the
    /// connection fails (`Some(status)`)
    async fn exchange(
        &mut self,
        outbound_rx: &mut mpsc::Receiver<ServerMessage>,
    ) -> Option<RpcStatus> {
        let mut read_open = true;
        let mut ping_timer = tokio::time::interval_at(
            Instant::now() + self.policy.ping_interval,
            self.policy.ping_interval,
        );
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;
        let age_deadline = self.opened_at + self.policy.max_connection_age;
        let mut grace_deadline: Option<Instant> = None;
        let stall_limit = self.policy.ping_interval + self.policy.ping_timeout;

        loop {
            tokio::select! {
                msg = outbound_rx.next() => match msg {
                    Some(msg) => {
                        let deadline = write_deadline(stall_limit, pong_deadline, grace_deadline);
                        if let Err(status) = self.write(Frame::Server(msg), deadline).await {
                            return Some(status);
                        }
                        self.policer.on_data_sent();
                    }
                    None => return None,
                },
                frame = self.framed.next(), if read_open => match frame {
                    Some(Ok(Frame::Agent(msg))) => self.forward(Ok(msg)).await,
                    Some(Ok(Frame::Ping { timestamp })) => {
                        if let Err(violation) = self.policer.on_ping(Instant::now(), true) {
                            return Some(RpcStatus::resource_exhausted(violation.to_string()));
                        }
                        let deadline = write_deadline(stall_limit, pong_deadline, grace_deadline);
                        if let Err(status) = self.write(Frame::Pong { timestamp }, deadline).await {
                            return Some(status);
                        }
                    }
                    Some(Ok(Frame::Pong { .. })) => pong_deadline = None,
                    Some(Ok(Frame::Close(status))) => {
                        debug!(peer = %self.peer, status = ?status, "Peer closed agent stream");
                        if let Some(status) = status {
                            self.forward(Err(status)).await;
                        }
                        self.inbound_tx = None;
                        read_open = false;
                    }
                    Some(Ok(other)) => {
                        return Some(RpcStatus::invalid_argument(format!(
                            "unexpected {} frame on agent stream",
                            frame_name(&other)
                        )));
                    }
                    Some(Err(e)) => return Some(read_failure(e)),
                    None => {
                        debug!(peer = %self.peer, "Peer disconnected");
                        self.inbound_tx = None;
                        read_open = false;
                    }
                },
                _ = ping_timer.tick(), if pong_deadline.is_none() => {
                    let deadline = Instant::now() + self.policy.ping_timeout;
                    let ping = Frame::Ping { timestamp: unix_millis() };
                    if let Err(status) = self.write(ping, write_deadline(stall_limit, Some(deadline), grace_deadline)).await {
                        return Some(status);
                    }
                    pong_deadline = Some(deadline);
                }
                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    let violation = KeepaliveViolation::PongTimeout(self.policy.ping_timeout);
                    return Some(RpcStatus::unavailable(violation.to_string()));
                }
                _ = sleep_until(age_deadline), if grace_deadline.is_none() => {
                    info!(peer = %self.peer, "Connection reached maximum age, asking stream to finish");
                    self.cancel.cancel();
                    grace_deadline = Some(Instant::now() + self.policy.max_connection_age_grace);
                }
                _ = sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if grace_deadline.is_some() => {
                    return Some(RpcStatus::unavailable("maximum connection age exceeded"));
                }
            }
        }
    }

    /// Write one frame, giving up once `deadline` passes
    ///
    /// A peer that stops reading would otherwise park the driver in a socket
    /// write where none of the keepalive timers can fire.
    async fn write(&mut self, frame: Frame, deadline: Instant) -> Result<(), RpcStatus> {
        match tokio::time::timeout_at(deadline, self.framed.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(write_failure(e)),
            Err(_) => {
                warn!(peer = %self.peer, "Peer stopped reading, write timed out");
                Err(RpcStatus::unavailable("write timed out: peer stopped reading"))
            }
        }
    }

    async fn forward(&mut self, item: Result<AgentMessage, RpcStatus>) {
        if let Some(tx) = self.inbound_tx.as_mut() {
            if tx.send(item).await.is_err() {
                // Consumer is gone; keep draining the socket for pongs
                self.inbound_tx = None;
            }
        }
    }

    async fn close_peer(&mut self, status: Option<RpcStatus>) {
        let limit = self.policy.ping_timeout;
        let framed = &mut self.framed;
        let closing = async move {
            framed.send(Frame::Close(status)).await?;
            framed.close().await
        };
        match tokio::time::timeout(limit, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %self.peer, error = %e, "Failed to close connection cleanly"),
            Err(_) => debug!(peer = %self.peer, "Timed out closing connection"),
        }
    }
}

fn read_failure(e: CodecError) -> RpcStatus {
    match e {
        CodecError::MessageTooLarge(size) => {
            RpcStatus::resource_exhausted(format!("message too large: {} bytes", size))
        }
        other => RpcStatus::unavailable(format!("read failed: {}", other)),
    }
}

/// Latest instant a write may finish: the pending pong or grace deadline, or
/// one ping round when neither is pending
fn write_deadline(
    stall_limit: Duration,
    pong_deadline: Option<Instant>,
    grace_deadline: Option<Instant>,
) -> Instant {
    [pong_deadline, grace_deadline]
        .into_iter()
        .flatten()
        .fold(Instant::now() + stall_limit, Instant::min)
}

fn write_failure(e: CodecError) -> RpcStatus {
    RpcStatus::unavailable(format!("write failed: {}", e))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Open(_) => "Open",
        Frame::Reply(_) => "Reply",
        Frame::Agent(_) => "Agent",
        Frame::Server(_) => "Server",
        Frame::Close(_) => "Close",
        Frame::Ping { .. } => "Ping",
        Frame::Pong { .. } => "Pong",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_proto::{
        AgentPayload, Command, CommandKind, HealthCheckResponse, Heartbeat, ServerPayload,
        ServingStatus, StatusCode,
    };
    use tokio::io::DuplexStream;

    type ClientEnd = Framed<DuplexStream, FrameCodec>;

    fn pair(policy: KeepalivePolicy) -> (ServerConnection<DuplexStream>, ClientEnd) {
        pair_with_buffer(policy, 64 * 1024)
    }

    fn pair_with_buffer(
        policy: KeepalivePolicy,
        buffer: usize,
    ) -> (ServerConnection<DuplexStream>, ClientEnd) {
        let (server_io, client_io) = tokio::io::duplex(buffer);
        (
            ServerConnection::new(server_io, policy, "test-peer"),
            Framed::new(client_io, FrameCodec::new()),
        )
    }

    #[tokio::test]
    async fn test_unary_call() {
        let (mut server, mut client) = pair(KeepalivePolicy::default());

        client.send(Frame::Ping { timestamp: 7 }).await.unwrap();
        client.send(Frame::Open(Call::HealthCheck)).await.unwrap();

        let call = server.accept_call().await.unwrap();
        assert_eq!(call, Call::HealthCheck);
        server
            .reply(Ok(Reply::Health(HealthCheckResponse {
                status: ServingStatus::Serving,
            })))
            .await
            .unwrap();

        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Frame::Pong { timestamp: 7 }
        );
        match client.next().await.unwrap().unwrap() {
            Frame::Reply(Ok(Reply::Health(resp))) => assert_eq!(resp.status, ServingStatus::Serving),
            other => panic!("Expected health reply, got {:?}", other),
        }
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unexpected_first_frame() {
        let (mut server, mut client) = pair(KeepalivePolicy::default());
        client.send(Frame::Close(None)).await.unwrap();

        assert!(matches!(
            server.accept_call().await,
            Err(TransportError::ProtocolError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_before_open() {
        let (mut server, _client) = pair(KeepalivePolicy::default());

        let started = Instant::now();
        assert!(matches!(server.accept_call().await, Err(TransportError::Timeout)));
        assert!(started.elapsed() >= Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_stream_exchange() {
        let (mut server, mut client) = pair(KeepalivePolicy::default());
        client.send(Frame::Open(Call::AgentStream)).await.unwrap();
        assert_eq!(server.accept_call().await.unwrap(), Call::AgentStream);

        let StreamHalves {
            mut inbound,
            mut outbound,
            closer,
        } = server.into_stream(CancellationToken::new());

        let heartbeat = AgentMessage::new(AgentPayload::Heartbeat(Heartbeat::default()));
        client.send(Frame::Agent(heartbeat.clone())).await.unwrap();
        assert_eq!(inbound.next().await.unwrap().unwrap(), heartbeat);

        let command = ServerMessage::new(ServerPayload::Command(Command::new(
            CommandKind::RestartJob {
                job_id: "job-1".to_string(),
            },
        )));
        outbound.send(command.clone()).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Frame::Server(command)
        );

        // Peer ends its side; the consumer sees end of stream
        client.send(Frame::Close(None)).await.unwrap();
        assert!(inbound.next().await.is_none());

        drop(outbound);
        closer.finish(None).await;
        assert_eq!(client.next().await.unwrap().unwrap(), Frame::Close(None));
    }

    #[tokio::test]
    async fn test_stream_finish_with_error_status() {
        let (mut server, mut client) = pair(KeepalivePolicy::default());
        client.send(Frame::Open(Call::AgentStream)).await.unwrap();
        server.accept_call().await.unwrap();

        let halves = server.into_stream(CancellationToken::new());
        drop(halves.outbound);
        halves
            .closer
            .finish(Some(RpcStatus::invalid_argument("first message must be registration")))
            .await;

        match client.next().await.unwrap().unwrap() {
            Frame::Close(Some(status)) => assert_eq!(status.code, StatusCode::InvalidArgument),
            other => panic!("Expected close with status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_flood_closes_stream() {
        let (mut server, mut client) = pair(KeepalivePolicy::default());
        client.send(Frame::Open(Call::AgentStream)).await.unwrap();
        server.accept_call().await.unwrap();

        let cancel = CancellationToken::new();
        let mut halves = server.into_stream(cancel.clone());

        for i in 0..5 {
            client.send(Frame::Ping { timestamp: i }).await.unwrap();
        }

        match halves.inbound.next().await {
            Some(Err(status)) => assert_eq!(status.code, StatusCode::ResourceExhausted),
            other => panic!("Expected keepalive failure, got {:?}", other),
        }
        assert!(cancel.is_cancelled());

        // Pongs for the tolerated pings, then the close
        let mut closed = None;
        while let Some(Ok(frame)) = client.next().await {
            if let Frame::Close(status) = frame {
                closed = status;
                break;
            }
        }
        assert_eq!(closed.map(|s| s.code), Some(StatusCode::ResourceExhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_timeout() {
        let (mut server, mut client) = pair(KeepalivePolicy::default());
        client.send(Frame::Open(Call::AgentStream)).await.unwrap();
        server.accept_call().await.unwrap();

        let cancel = CancellationToken::new();
        let mut halves = server.into_stream(cancel.clone());

        // The client reads the ping but never answers it
        let started = Instant::now();
        assert!(matches!(
            client.next().await.unwrap().unwrap(),
            Frame::Ping { .. }
        ));

        match halves.inbound.next().await {
            Some(Err(status)) => assert_eq!(status.code, StatusCode::Unavailable),
            other => panic!("Expected keepalive timeout, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_connection_age_cancels_stream() {
        let policy = KeepalivePolicy::default()
            .with_max_connection_age(Duration::from_secs(5), Duration::from_secs(5));
        let (mut server, mut client) = pair(policy);
        client.send(Frame::Open(Call::AgentStream)).await.unwrap();
        server.accept_call().await.unwrap();

        let cancel = CancellationToken::new();
        let halves = server.into_stream(cancel.clone());

        cancel.cancelled().await;

        // Consumer winds down within the grace period
        drop(halves.outbound);
        drop(halves.inbound);
        halves.closer.finish(None).await;
        assert_eq!(client.next().await.unwrap().unwrap(), Frame::Close(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_that_stops_reading_is_cut_off() {
        let (mut server, mut client) = pair_with_buffer(KeepalivePolicy::default(), 4 * 1024);
        client.send(Frame::Open(Call::AgentStream)).await.unwrap();
        server.accept_call().await.unwrap();

        let cancel = CancellationToken::new();
        let StreamHalves {
            mut inbound,
            mut outbound,
            closer: _closer,
        } = server.into_stream(cancel.clone());

        // Far more than the socket buffer holds; the client never reads
        let writer = tokio::spawn(async move {
            for i in 0..200 {
                let command = ServerMessage::new(ServerPayload::Command(Command::new(
                    CommandKind::ScaleJob {
                        job_id: format!("job-{}", i),
                        new_parallelism: 2,
                    },
                )));
                if outbound.send(command).await.is_err() {
                    break;
                }
            }
        });

        let started = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(600), inbound.next())
            .await
            .expect("driver stayed blocked on a stalled peer");
        match outcome {
            Some(Err(status)) => assert_eq!(status.code, StatusCode::Unavailable),
            other => panic!("Expected write timeout, got {:?}", other),
        }
        let policy = KeepalivePolicy::default();
        assert!(started.elapsed() <= policy.ping_interval + policy.ping_timeout);
        assert!(cancel.is_cancelled());

        writer.await.unwrap();
        drop(client);
    }
}
