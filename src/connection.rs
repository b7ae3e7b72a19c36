use crate::tunnel::{self, packet_flags, packet_type, ModelInfo, SetpointWrite};
use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Sequence number of the model-probe ping issued right after session
/// establishment.
pub const INITIAL_PING_SEQ: u16 = 50;
/// Keep-alive pings draw from this ring and wrap back to its start.
pub const KEEPALIVE_SEQ_FIRST: u16 = 100;
pub const KEEPALIVE_SEQ_LAST: u16 = 199;
/// User requests start here; past 65535 the counter wraps back to 300 so
/// it never re-enters the reserved ranges.
pub const FIRST_USER_SEQ: u16 = 300;

const CONNECT_GRACE: Duration = Duration::from_secs(2);
const MAX_FRAME: usize = 2048;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("device id and email must be set, and the id must not be the discovery wildcard")]
    InvalidArgument,
    #[error("could not bind a local UDP socket")]
    Bind(#[source] std::io::Error),
    #[error("could not reach `{1}` over UDP")]
    Socket(#[source] std::io::Error, SocketAddr),
    #[error("the controller did not answer the connect request in time")]
    ConnectTimeout,
    #[error("the controller refused the session with status {status:#010x}")]
    ConnectRefused { status: u32 },
    #[error("the session is not connected")]
    NotConnected,
    #[error("read request {seq} timed out")]
    ReadTimeout { seq: u16 },
    #[error("write request {seq} timed out")]
    WriteTimeout { seq: u16 },
    #[error("the session was closed while the request was in flight")]
    SessionClosed,
    #[error("malformed reply to request {seq}")]
    Protocol { seq: u16 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Model info extracted from the reply to the initial ping.
    Model(ModelInfo),
    /// A DATA frame whose sequence number matched no pending request.
    UnmatchedData { seq: u16 },
    /// The session is gone; `reason` is `None` on a local disconnect.
    Closed { reason: Option<Error> },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub device_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub email: String,
    pub connect_retries: u32,
    pub connect_retry_interval: Duration,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl SessionConfig {
    pub fn new(device_id: impl Into<String>, ip: IpAddr, email: impl Into<String>) -> Self {
        SessionConfig {
            device_id: device_id.into(),
            ip,
            port: tunnel::TUNNEL_PORT,
            email: email.into(),
            connect_retries: 3,
            connect_retry_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

struct Shared {
    state: Mutex<SessionState>,
}

impl Shared {
    fn set(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn get(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct RawReply {
    seq: u16,
    command: Vec<u8>,
}

type Responder = oneshot::Sender<Result<RawReply, Error>>;

enum Command {
    ReadDatapoints {
        entries: Vec<(u8, u32)>,
        responder: Responder,
    },
    ReadSetpoints {
        entries: Vec<(u8, u16)>,
        responder: Responder,
    },
    WriteSetpoints {
        writes: Vec<SetpointWrite>,
        responder: Responder,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// A stateful session to one controller. Cheap to clone; all mutable
/// session state lives on the worker task, which is the sole owner of the
/// socket, the sequence counters, and the pending-request table.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    client_id: u32,
    server_id: u32,
}

impl Session {
    /// Binds a socket, runs the U_CONNECT handshake with retransmission,
    /// and spawns the session worker. The worker's first action is the
    /// model-probe ping on the reserved sequence number.
    pub async fn connect(
        config: SessionConfig,
    ) -> Result<(Session, mpsc::UnboundedReceiver<SessionEvent>), Error> {
        if config.email.is_empty() || config.device_id.is_empty() || config.device_id == "*" {
            return Err(Error::InvalidArgument);
        }
        let remote = SocketAddr::from((config.ip, config.port));
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(Error::Bind)?;
        socket
            .connect(remote)
            .await
            .map_err(|e| Error::Socket(e, remote))?;

        let client_id: u32 = rand::random();
        let request = tunnel::build_connect_request(client_id, &config.email);
        let deadline = Instant::now()
            + config.connect_retry_interval * config.connect_retries
            + CONNECT_GRACE;
        let mut next_send = Instant::now();
        let mut sends_left = config.connect_retries + 1;
        let mut buffer = [0u8; MAX_FRAME];
        info!(message = "connecting", device = %config.device_id, %remote);
        let response = loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_send), if sends_left > 0 => {
                    socket.send(&request).await.map_err(|e| Error::Socket(e, remote))?;
                    sends_left -= 1;
                    next_send += config.connect_retry_interval;
                }
                received = socket.recv(&mut buffer) => {
                    let len = received.map_err(|e| Error::Socket(e, remote))?;
                    // Stray frames are expected; only a well-formed
                    // U_CONNECT response ends the handshake.
                    if let Some(response) = tunnel::parse_connect_response(&buffer[..len]) {
                        break response;
                    }
                    trace!(message = "ignoring frame during handshake", len);
                }
                _ = tokio::time::sleep_until(deadline) => return Err(Error::ConnectTimeout),
            }
        };
        if response.status != tunnel::CONNECT_STATUS_OK {
            return Err(Error::ConnectRefused {
                status: response.status,
            });
        }
        info!(message = "connected", server_id = response.server_id);

        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Connected),
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            remote,
            shared: Arc::clone(&shared),
            events: events_tx,
            config,
            client_id,
            server_id: response.server_id,
            pending: BTreeMap::new(),
            deadlines: VecDeque::with_capacity(8),
            next_seq: FIRST_USER_SEQ,
            keepalive_seq: KEEPALIVE_SEQ_FIRST,
        };
        tokio::spawn(worker.main_loop(socket, commands_rx));
        let session = Session {
            commands: commands_tx,
            shared,
            client_id,
            server_id: response.server_id,
        };
        Ok((session, events_rx))
    }

    pub fn state(&self) -> SessionState {
        self.shared.get()
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub async fn read_datapoints(&self, entries: Vec<(u8, u32)>) -> Result<Vec<i16>, Error> {
        let reply = self
            .request(|responder| Command::ReadDatapoints { entries, responder })
            .await?;
        tunnel::parse_datapoint_values(&reply.command)
            .ok_or(Error::Protocol { seq: reply.seq })
    }

    pub async fn read_setpoints(&self, entries: Vec<(u8, u16)>) -> Result<Vec<u16>, Error> {
        let reply = self
            .request(|responder| Command::ReadSetpoints { entries, responder })
            .await?;
        tunnel::parse_setpoint_values(&reply.command)
            .ok_or(Error::Protocol { seq: reply.seq })
    }

    /// Resolves as soon as a reply correlates with the request's sequence
    /// number; the reply body is not inspected.
    pub async fn write_setpoints(&self, writes: Vec<SetpointWrite>) -> Result<(), Error> {
        self.request(|responder| Command::WriteSetpoints { writes, responder })
            .await?;
        Ok(())
    }

    async fn request(&self, build: impl FnOnce(Responder) -> Command) -> Result<RawReply, Error> {
        if self.state() != SessionState::Connected {
            return Err(Error::NotConnected);
        }
        let (responder, reply) = oneshot::channel();
        self.commands
            .send(build(responder))
            .map_err(|_| Error::NotConnected)?;
        reply.await.map_err(|_| Error::SessionClosed)?
    }

    /// Stops the worker, rejects every pending request and closes the
    /// socket. Idempotent.
    pub async fn disconnect(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Disconnect { done }).is_ok() {
            let _ = finished.await;
        }
    }
}

enum PendingKind {
    Read,
    Write,
}

struct PendingRequest {
    kind: PendingKind,
    responder: Responder,
}

type PinnedSleep<'a> = pin::Pin<&'a mut tokio::time::Sleep>;

struct Worker {
    remote: SocketAddr,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<SessionEvent>,
    config: SessionConfig,
    client_id: u32,
    server_id: u32,
    pending: BTreeMap<u16, PendingRequest>,
    /// Outstanding requests in send order. Every request shares one
    /// timeout duration, so send order is deadline order and a linear
    /// scan is plenty for the handful of in-flight requests a session
    /// ever has.
    deadlines: VecDeque<(u16, Instant)>,
    next_seq: u16,
    keepalive_seq: u16,
}

fn next_user_seq(seq: u16) -> u16 {
    if seq == u16::MAX {
        FIRST_USER_SEQ
    } else {
        seq + 1
    }
}

impl Worker {
    async fn main_loop(mut self, socket: UdpSocket, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut buffer = [0u8; MAX_FRAME];
        let mut request_timeout = pin::pin!(tokio::time::sleep_until(Instant::now()));
        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.config.keepalive_interval,
            self.config.keepalive_interval,
        );
        // Probe the firmware for model info before anything else; the
        // reply comes back on the reserved sequence number.
        if let Err(e) = self.send_ping(&socket, INITIAL_PING_SEQ, 0).await {
            return self.close(Some(e));
        }
        loop {
            tokio::select! {
                biased;
                received = socket.recv(&mut buffer) => {
                    match received {
                        Err(e) => return self.close(Some(Error::Socket(e, self.remote))),
                        Ok(len) => self.handle_frame(&buffer[..len]),
                    }
                }

                _ = &mut request_timeout, if !self.deadlines.is_empty() => {
                    self.expire(request_timeout.as_mut());
                }

                _ = keepalive.tick() => {
                    let seq = self.keepalive_seq;
                    self.keepalive_seq = if seq == KEEPALIVE_SEQ_LAST {
                        KEEPALIVE_SEQ_FIRST
                    } else {
                        seq + 1
                    };
                    // A lost keep-alive is not fatal by itself; liveness
                    // policy lives with the polling engine.
                    if let Err(e) = self.send_ping(&socket, seq, packet_flags::TAG).await {
                        return self.close(Some(e));
                    }
                }

                command = commands.recv() => match command {
                    None => return self.close(None),
                    Some(Command::Disconnect { done }) => {
                        self.close(None);
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => {
                        if let Err(e) = self.handle_request(&socket, command, request_timeout.as_mut()).await {
                            return self.close(Some(e));
                        }
                    }
                },
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let Some(header) = tunnel::Header::parse(frame) else {
            trace!(message = "dropping runt frame", len = frame.len());
            return;
        };
        match header.packet_type {
            // Late handshake retransmits and liveness probes from the
            // controller need no action.
            packet_type::U_CONNECT | packet_type::U_ALIVE => {}
            packet_type::DATA => {
                let Some((seq, command)) = tunnel::parse_data_response(frame) else {
                    trace!(message = "dropping malformed data frame", len = frame.len());
                    return;
                };
                if seq == INITIAL_PING_SEQ {
                    let info = tunnel::parse_ping_response(command);
                    debug!(message = "model info", ?info);
                    let _ = self.events.send(SessionEvent::Model(info));
                } else if (KEEPALIVE_SEQ_FIRST..=KEEPALIVE_SEQ_LAST).contains(&seq) {
                    trace!(message = "keep-alive reply", seq);
                } else if let Some(request) = self.pending.remove(&seq) {
                    self.deadlines.retain(|(pending_seq, _)| *pending_seq != seq);
                    let _ = request.responder.send(Ok(RawReply {
                        seq,
                        command: command.to_vec(),
                    }));
                } else {
                    debug!(message = "a reply we were not expecting", seq);
                    let _ = self.events.send(SessionEvent::UnmatchedData { seq });
                }
            }
            other => trace!(message = "dropping unknown packet type", packet_type = other),
        }
    }

    async fn handle_request(
        &mut self,
        socket: &UdpSocket,
        command: Command,
        sleep: PinnedSleep<'_>,
    ) -> Result<(), Error> {
        let (kind, command_buffer, responder) = match command {
            Command::ReadDatapoints { entries, responder } => (
                PendingKind::Read,
                tunnel::datapoint_read_command(&entries),
                responder,
            ),
            Command::ReadSetpoints { entries, responder } => (
                PendingKind::Read,
                tunnel::setpoint_read_command(&entries),
                responder,
            ),
            Command::WriteSetpoints { writes, responder } => (
                PendingKind::Write,
                tunnel::setpoint_write_command(&writes),
                responder,
            ),
            Command::Disconnect { .. } => unreachable!("handled by the main loop"),
        };
        let seq = self.next_seq;
        self.next_seq = next_user_seq(self.next_seq);
        let frame =
            tunnel::build_data_packet(self.client_id, self.server_id, seq, 0, &command_buffer);
        trace!(message = "sending request", seq, len = frame.len());
        if let Err(e) = socket.send(&frame).await {
            let _ = responder.send(Err(Error::SessionClosed));
            return Err(Error::Socket(e, self.remote));
        }
        let deadline = Instant::now() + self.config.request_timeout;
        if self.deadlines.is_empty() {
            sleep.reset(deadline);
        }
        self.deadlines.push_back((seq, deadline));
        self.pending.insert(seq, PendingRequest { kind, responder });
        Ok(())
    }

    fn expire(&mut self, sleep: PinnedSleep<'_>) {
        let now = Instant::now();
        while let Some((seq, deadline)) = self.deadlines.front().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_front();
            let Some(request) = self.pending.remove(&seq) else {
                continue;
            };
            debug!(message = "request timed out", seq);
            let error = match request.kind {
                PendingKind::Read => Error::ReadTimeout { seq },
                PendingKind::Write => Error::WriteTimeout { seq },
            };
            let _ = request.responder.send(Err(error));
        }
        if let Some((_, deadline)) = self.deadlines.front() {
            sleep.reset(*deadline);
        }
    }

    async fn send_ping(&self, socket: &UdpSocket, seq: u16, flags: u8) -> Result<(), Error> {
        let frame = tunnel::build_data_packet(
            self.client_id,
            self.server_id,
            seq,
            flags,
            &tunnel::ping_command(),
        );
        trace!(message = "sending ping", seq);
        socket
            .send(&frame)
            .await
            .map(drop)
            .map_err(|e| Error::Socket(e, self.remote))
    }

    fn close(&mut self, reason: Option<Error>) {
        debug!(message = "closing session", reason = ?reason);
        self.shared.set(SessionState::Closed);
        self.deadlines.clear();
        for (_, request) in std::mem::take(&mut self.pending) {
            let _ = request.responder.send(Err(Error::SessionClosed));
        }
        let _ = self.events.send(SessionEvent::Closed { reason });
    }
}
