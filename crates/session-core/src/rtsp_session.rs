//! The RTSP Session (spec §3, §4.6–§4.8): one client connection, driven end
//! to end by a single [`Task::run`] invocation rather than the spec's
//! repeated `run(events)` re-entry, since a suspended `.await` already
//! resumes at exactly the point it parked (see [`crate::state`]'s module
//! doc comment for why that makes the two models equivalent here).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use infra_common::config::SharedConfig;
use infra_common::tasks::{flags, Mailbox, Scheduler, Task, TaskAction};
use infra_common::timeout::TimeoutService;
use rtp_session::{PlaybackState, RtpSession};
use rtsp_proto::headers::names;
use rtsp_proto::{interleaved, parser, tunnel as http_tunnel, Method, Request, Response, StatusCode};
use rtsp_transport::{AcceptHandler, SocketPool};

use crate::error::{Error, Result};
use crate::id::{IdGenerator, SampledSessionStats, ServerCounters};
use crate::module::ModuleRegistry;
use crate::registry::{Resolved, RtpSessionRegistry, RtspSessionRegistry};
use crate::role::RoleContext;
use crate::state::{SessionState, TunnelRole};
use crate::tunnel::{BindOutcome, PendingTunnel, TunnelMap};

/// Live process-wide counters mixed into generated session ids (spec §4.9)
/// and consulted by resource-exhaustion checks (spec §7).
#[derive(Default)]
pub struct ServerCounterState {
    pub total_packets_sent: AtomicU64,
    pub bandwidth_bits_per_sec: AtomicU64,
    pub active_connections: AtomicU64,
}

/// Every service an RTSP Session needs that outlives any one connection
/// (spec §2's "Server Core" collaborators). One instance is shared by every
/// session in the process.
pub struct SessionDeps {
    pub config: SharedConfig,
    pub modules: Arc<ModuleRegistry>,
    pub rtp_sessions: Arc<RtpSessionRegistry>,
    pub rtsp_sessions: Arc<RtspSessionRegistry>,
    pub tunnel_map: Arc<TunnelMap>,
    pub timeouts: Arc<TimeoutService>,
    pub global_lock: Arc<AsyncMutex<()>>,
    pub socket_pool: SocketPool,
    pub counters: ServerCounterState,
}

impl SessionDeps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SharedConfig,
        modules: Arc<ModuleRegistry>,
        rtp_sessions: Arc<RtpSessionRegistry>,
        rtsp_sessions: Arc<RtspSessionRegistry>,
        tunnel_map: Arc<TunnelMap>,
        timeouts: Arc<TimeoutService>,
        socket_pool: SocketPool,
    ) -> Arc<Self> {
        Arc::new(SessionDeps {
            config,
            modules,
            rtp_sessions,
            rtsp_sessions,
            tunnel_map,
            timeouts,
            global_lock: Arc::new(AsyncMutex::new(())),
            socket_pool,
            counters: ServerCounterState::default(),
        })
    }

    /// Sample a randomly chosen live RTP session's stats (spec §4.9). An
    /// empty registry (the very first session in the process) samples as
    /// all zero.
    fn sample_live_session_stats(&self) -> SampledSessionStats {
        let ids = self.rtp_sessions.ids();
        if ids.is_empty() {
            return SampledSessionStats::default();
        }
        let pick = ids[rand::thread_rng().gen_range(0..ids.len())];
        let Some(session) = self.rtp_sessions.resolve(pick) else {
            return SampledSessionStats::default();
        };
        SampledSessionStats {
            packet_count: session.packets_sent(),
            created_at_micros: session.created_at().elapsed().as_micros() as u64,
            play_time_micros: session.play_time().as_micros() as u64,
            bytes_sent: session.bytes_sent(),
        }
    }

    fn server_counters(&self) -> ServerCounters {
        ServerCounters {
            bandwidth_bits_per_sec: self.counters.bandwidth_bits_per_sec.load(Ordering::Relaxed),
            total_packets_sent: self.counters.total_packets_sent.load(Ordering::Relaxed),
        }
    }

    /// Generate a fresh, currently-unused session id (spec §4.9), retrying
    /// past collisions against both session maps.
    pub fn generate_session_id(&self) -> u64 {
        let sample = self.sample_live_session_stats();
        let counters = self.server_counters();
        IdGenerator::generate_unique(sample, counters, |candidate| {
            self.rtsp_sessions.contains(candidate) || self.rtp_sessions.contains(candidate)
        })
    }

    /// Recompute `total_packets_sent`/`bandwidth_bits_per_sec` from the live
    /// RTP session registry (spec §4.9's id-generator entropy, and the
    /// server-status file's statistics, spec §6). Called periodically by
    /// Server Core rather than on every packet, since neither consumer needs
    /// sub-second freshness.
    pub fn refresh_counters(&self) {
        let mut packets = 0u64;
        let mut bits_per_sec = 0u64;
        for id in self.rtp_sessions.ids() {
            let Some(session) = self.rtp_sessions.resolve(id) else {
                continue;
            };
            packets += session.packets_sent();
            let play_secs = session.play_time().as_secs().max(1);
            bits_per_sec += (session.bytes_sent() * 8) / play_secs;
        }
        self.counters.total_packets_sent.store(packets, Ordering::Relaxed);
        self.counters.bandwidth_bits_per_sec.store(bits_per_sec, Ordering::Relaxed);
    }
}

/// Shared per-connection state (spec §3): everything a module or the
/// tunnel map needs to read or mutate about a session besides the request
/// currently in flight.
pub struct RtspSessionHandle {
    pub id: u64,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    state: SyncMutex<SessionState>,
    tunnel_role: SyncMutex<TunnelRole>,
    pub proxy_cookie: SyncMutex<Option<String>>,
    pub last_user: SyncMutex<Option<String>>,
    /// Set by a default SETUP module once it creates or attaches an RTP
    /// Session; dropping this (on TEARDOWN, or when the handle itself is
    /// destroyed) releases that session's refcount (spec §3, §5).
    pub rtp_session: SyncMutex<Option<Resolved<RtpSession>>>,
    /// Held from `ReadingRequest` through `CleaningUp` (spec §5): a tunnel
    /// bind is refused while this is held, since the session is mid-read.
    pub read_mutex: Arc<AsyncMutex<()>>,
    /// Held from `HaveNonTunnelMessage` through `CleaningUp` (spec §5).
    pub request_mutex: AsyncMutex<()>,
    pub mailbox: Arc<Mailbox>,
    alive: AtomicBool,
}

impl RtspSessionHandle {
    pub fn new(id: u64, local_addr: SocketAddr, remote_addr: SocketAddr, mailbox: Arc<Mailbox>) -> Self {
        RtspSessionHandle {
            id,
            local_addr,
            remote_addr,
            state: SyncMutex::new(SessionState::ReadingFirstRequest),
            tunnel_role: SyncMutex::new(TunnelRole::None),
            proxy_cookie: SyncMutex::new(None),
            last_user: SyncMutex::new(None),
            rtp_session: SyncMutex::new(None),
            read_mutex: Arc::new(AsyncMutex::new(())),
            request_mutex: AsyncMutex::new(()),
            mailbox,
            alive: AtomicBool::new(true),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub fn tunnel_role(&self) -> TunnelRole {
        *self.tunnel_role.lock()
    }

    pub fn set_tunnel_role(&self, role: TunnelRole) {
        *self.tunnel_role.lock() = role;
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Whether this session's attached RTP Session is currently `Playing`
    /// (spec §4.7's `PLAY`-ping rule: a second `PLAY` with no `Range` on an
    /// already-playing session skips the preprocessor/request roles).
    pub fn is_already_playing(&self) -> bool {
        self.rtp_session
            .lock()
            .as_ref()
            .map(|rtp| rtp.state() == PlaybackState::Playing)
            .unwrap_or(false)
    }
}

/// Which socket a session is currently reading from: its own TCP stream, or
/// (once bound as the GET half of an HTTP tunnel) a donated socket whose
/// bytes arrive as a continuous base64 stream (spec §4.6).
enum ReadSide {
    Direct(OwnedReadHalf),
    Tunnel(OwnedReadHalf, rtsp_proto::IncrementalBase64Decoder),
}

enum Sniffed {
    Rtsp(Request),
    Interleaved(interleaved::InterleavedFrame),
    HttpGet(http_tunnel::HttpTunnelRequest),
    HttpPost(http_tunnel::HttpTunnelRequest),
}

/// One TCP (or tunnel-bound) connection's RTSP Session (spec §3). Created
/// by [`SessionAcceptor`] and driven to completion by a single [`Task::run`]
/// call.
pub struct RtspSession {
    pub handle: Resolved<RtspSessionHandle>,
    deps: Arc<SessionDeps>,
    stream: SyncMutex<Option<TcpStream>>,
}

impl RtspSession {
    pub fn new(handle: Resolved<RtspSessionHandle>, deps: Arc<SessionDeps>, stream: TcpStream) -> Self {
        RtspSession {
            handle,
            deps,
            stream: SyncMutex::new(Some(stream)),
        }
    }

    async fn drive(&self) -> Result<()> {
        let stream = self
            .stream
            .lock()
            .take()
            .expect("RtspSession::run invoked more than once");
        let (read_half, mut write_half) = stream.into_split();
        let mut read_side = ReadSide::Direct(read_half);
        let mut buf = BytesMut::with_capacity(4096);

        self.deps.timeouts.register(
            self.handle.id,
            self.handle.mailbox.clone(),
            Instant::now() + self.idle_timeout(),
        );

        loop {
            let max_size = self.deps.config.snapshot().max_request_size_bytes;
            let message = match read_next_message(&mut read_side, &mut buf, max_size, &self.handle.mailbox).await {
                Ok(message) => message,
                Err(Error::RequestLevel(proto_err)) => {
                    // spec §7, Request-level: malformed syntax, an
                    // over-length request, or bad tunnel base64 gets a
                    // `400`/`414`/`455` response rather than a teardown.
                    // The buffer's resync point is unknowable once parsing
                    // has failed, so (per the supplemented behavior in
                    // SPEC_FULL.md §C.1) the connection is closed right
                    // after the response is flushed.
                    if let Some(status) = proto_err.request_level_status() {
                        let response = Response::new(status);
                        self.send(&mut write_half, &response).await?;
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.deps
                .timeouts
                .refresh(self.handle.id, Instant::now() + self.idle_timeout());

            match message {
                Sniffed::Rtsp(request) => {
                    let close = self
                        .dispatch_one(&mut write_half, &mut read_side, &mut buf, request)
                        .await?;
                    if close {
                        return Ok(());
                    }
                }
                Sniffed::Interleaved(frame) => {
                    // Incoming RTCP-over-TCP from the client (spec §4.7):
                    // no response produced, delivered to the
                    // `RTSPIncomingData` lifecycle role in arrival order
                    // (spec §4.5, §5).
                    self.deps
                        .modules
                        .dispatch_incoming_data(&self.handle, frame.channel, &frame.payload)
                        .await;
                }
                Sniffed::HttpGet(request) => {
                    self.begin_tunnel_get(&mut write_half, &mut read_side, &mut buf, request)
                        .await?;
                }
                Sniffed::HttpPost(request) => {
                    self.hand_off_as_tunnel_post(read_side, &buf, request).await?;
                    return Ok(());
                }
            }
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.deps.config.snapshot().session_timeout_secs.max(1))
    }

    /// Handle whatever spec §4.7 says the core answers directly, without
    /// ever entering the module pipeline: `OPTIONS` (always core-handled,
    /// answered from the frozen `Public:` header) and a bodyless
    /// `SET_PARAMETER` (an RFC 2326 keepalive ping).
    async fn handle_core_request(&self, request: &Request) -> Result<Option<Response>> {
        // spec §6: `Require` is one of the headers "participating in core
        // logic". This tree ships no optional RTSP extension (no module
        // advertises one via `Module::claims_methods`/a dedicated
        // capability list), so any non-empty `Require` names a feature
        // nothing here implements (RFC 2326 §12.32): reject before role
        // dispatch rather than let a module guess at which option to
        // honor.
        if let Some(required) = request.headers.get(names::REQUIRE) {
            if !required.trim().is_empty() {
                return Ok(Some(
                    Response::new(StatusCode::OPTION_NOT_SUPPORTED)
                        .with_cseq(request.cseq())
                        .with_header(names::UNSUPPORTED, required.to_string()),
                ));
            }
        }

        match request.method {
            Method::Options => Ok(Some(
                Response::new(StatusCode::OK)
                    .with_cseq(request.cseq())
                    .with_header(names::PUBLIC, self.deps.modules.public_header().to_string()),
            )),
            Method::SetParameter if request.body.is_empty() => {
                Ok(Some(Response::new(StatusCode::OK).with_cseq(request.cseq())))
            }
            _ => Ok(None),
        }
    }

    async fn dispatch_one(
        &self,
        write_half: &mut OwnedWriteHalf,
        read_side: &mut ReadSide,
        buf: &mut BytesMut,
        request: Request,
    ) -> Result<bool> {
        if let Some(response) = self.handle_core_request(&request).await? {
            let close = request.headers.wants_connection_close() || response.headers.wants_connection_close();
            self.send(write_half, &response).await?;
            return Ok(close);
        }

        let cseq = request.cseq().map(str::to_string);
        let wants_close = request.headers.wants_connection_close();
        let wants_rate_probe = request.method == Method::Setup
            && request
                .headers
                .get(names::X_DYNAMIC_RATE)
                .map(|v| v == "1")
                .unwrap_or(false);

        let _request_guard = self.handle.request_mutex.lock().await;
        self.handle.set_state(SessionState::HaveNonTunnelMessage);

        let mut ctx = RoleContext::new(self.handle.clone(), request);
        self.deps
            .modules
            .dispatch_request_pipeline(&mut ctx, &self.deps.global_lock)
            .await;

        let response = ctx
            .response
            .unwrap_or_else(|| Response::new(StatusCode::NOT_FOUND).with_cseq(cseq.as_deref()));
        let close = wants_close || response.headers.wants_connection_close();
        let setup_ok = response.status == StatusCode::OK;

        self.handle.set_state(SessionState::SendingResponse);
        self.send(write_half, &response).await?;
        self.handle.set_state(SessionState::CleaningUp);

        if wants_rate_probe && setup_ok && !close {
            self.run_dynamic_rate_probe(write_half, read_side, buf).await?;
        }

        Ok(close)
    }

    async fn send(&self, write_half: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
        write_half.write_all(&response.to_bytes()).await?;
        Ok(())
    }

    /// spec §4.7: a SETUP carrying `x-dynamic-rate: 1` gets an `OPTIONS`
    /// request issued back to the client, right after the SETUP response is
    /// flushed, timing the round trip for adaptive thinning. The spec's own
    /// Open Question resolves the ordering this way explicitly: response
    /// first, then probe.
    async fn run_dynamic_rate_probe(
        &self,
        write_half: &mut OwnedWriteHalf,
        read_side: &mut ReadSide,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let Some(rtp) = self.handle.rtp_session.lock().clone() else {
            return Ok(());
        };

        let mut probe_headers = rtsp_proto::HeaderList::new();
        probe_headers.push(names::CSEQ, "0");
        let probe = Request {
            method: Method::Options,
            uri: "*".into(),
            version: rtsp_proto::Version::RTSP_1_0,
            headers: probe_headers,
            body: Bytes::new(),
        };

        let started = Instant::now();
        write_half.write_all(&probe.to_bytes()).await?;
        let max_size = self.deps.config.snapshot().max_request_size_bytes;
        await_status_line(read_side, buf, &self.handle.mailbox, max_size).await?;
        *rtp.measured_rtt.lock().unwrap() = Some(started.elapsed());
        Ok(())
    }

    /// Register this connection as the GET half of an HTTP tunnel, answer
    /// its fixed `200 OK`, then wait for the matching POST to donate its
    /// read half (spec §4.6).
    async fn begin_tunnel_get(
        &self,
        write_half: &mut OwnedWriteHalf,
        read_side: &mut ReadSide,
        buf: &mut BytesMut,
        request: http_tunnel::HttpTunnelRequest,
    ) -> Result<()> {
        let cookie = request
            .cookie()
            .map(str::to_string)
            .ok_or_else(|| Error::TransportFatal("tunnel GET missing X-Sessioncookie".into()))?;

        self.handle.set_tunnel_role(TunnelRole::GetSide);
        *self.handle.proxy_cookie.lock() = Some(cookie.clone());
        self.handle.set_state(SessionState::WaitingToBindTunnel);

        let pending = PendingTunnel {
            get_session_id: self.handle.id,
            get_mailbox: self.handle.mailbox.clone(),
            read_mutex: self.handle.read_mutex.clone(),
        };
        let mut rx = self
            .deps
            .tunnel_map
            .register_get(&cookie, pending)
            .map_err(|e| Error::TransportFatal(e.to_string()))?;

        write_half.write_all(&http_tunnel::tunnel_ok_response()).await?;

        let (donated_read, prefetched) = loop {
            tokio::select! {
                result = &mut rx => {
                    break result.map_err(|_| Error::TransportFatal("tunnel POST channel dropped".into()))?;
                }
                events = self.handle.mailbox.wait_for_signal() => {
                    if let Some(err) = fatal_signal(events) {
                        return Err(err);
                    }
                    // Benign wake (e.g. the bind's own notification racing
                    // the oneshot); keep waiting for the actual socket.
                }
            }
        };

        // `prefetched` is whatever raw base64 the POST already read past
        // its own header block; it must go through the same incremental
        // decoder as everything read off the donated socket afterward
        // (spec §4.6), not straight into `buf` as if it were already RTSP.
        let mut decoder = rtsp_proto::IncrementalBase64Decoder::new();
        let decoded = decoder.feed(&prefetched)?;
        buf.extend_from_slice(&decoded);
        *read_side = ReadSide::Tunnel(donated_read, decoder);
        self.handle.set_state(SessionState::ReadingRequest);
        Ok(())
    }

    /// Hand this connection's read half off to the GET session registered
    /// under the same cookie (spec §4.6). The write half stays in `drive`'s
    /// scope and is simply dropped when this session terminates, closing
    /// only the outgoing direction.
    async fn hand_off_as_tunnel_post(
        &self,
        read_side: ReadSide,
        buf: &BytesMut,
        request: http_tunnel::HttpTunnelRequest,
    ) -> Result<()> {
        let cookie = request
            .cookie()
            .map(str::to_string)
            .ok_or_else(|| Error::TransportFatal("tunnel POST missing X-Sessioncookie".into()))?;

        let ReadSide::Direct(read_half) = read_side else {
            return Err(Error::TransportFatal(
                "tunnel POST arrived on an already-tunnelled socket".into(),
            ));
        };

        self.handle.set_tunnel_role(TunnelRole::PostSide);
        self.handle.set_state(SessionState::SocketBoundIntoTunnel);

        let prefetched = Bytes::copy_from_slice(&buf[..]);
        let outcome = self
            .deps
            .tunnel_map
            .bind_post(&cookie, read_half, prefetched, self.idle_timeout())
            .await;

        match outcome {
            BindOutcome::Bound { .. } => Ok(()),
            BindOutcome::NotFound => Err(Error::TransportFatal(
                "no GET session registered under this tunnel cookie".into(),
            )),
            BindOutcome::ReadMutexBusy => Err(Error::TransportFatal(
                "GET session's read mutex was busy at bind time".into(),
            )),
        }
    }
}

#[async_trait]
impl Task for RtspSession {
    fn name(&self) -> &str {
        "rtsp-session"
    }

    async fn run(&self, _events: u8) -> TaskAction {
        self.deps.counters.active_connections.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.drive().await {
            if e.is_transport_fatal() {
                tracing::debug!(session = self.handle.id, error = %e, "session terminated");
            } else {
                warn!(session = self.handle.id, error = %e, "session ended with an unconverted error");
            }
        }
        self.handle.mark_dead();
        self.deps.modules.dispatch_session_closing(&self.handle).await;
        self.deps.rtsp_sessions.force_remove(self.handle.id);
        self.deps.timeouts.unregister(self.handle.id);
        self.deps.counters.active_connections.fetch_sub(1, Ordering::SeqCst);
        TaskAction::Terminate
    }
}

fn fatal_signal(events: u8) -> Option<Error> {
    if events & flags::KILL != 0 {
        Some(Error::TransportFatal("session killed".into()))
    } else if events & flags::TIMEOUT != 0 {
        Some(Error::TransportFatal("idle timeout".into()))
    } else {
        None
    }
}

/// Which framing the front of `buf` looks like, or `None` if not enough
/// bytes have arrived yet to tell. Distinguishes `POST`/`GET` (HTTP tunnel
/// framing) from RTSP's own `PLAY`/`GET_PARAMETER` by the byte right after
/// the shared prefix (`' '` for HTTP, `'_'` or another letter for RTSP).
enum Sniff {
    Interleaved,
    Http,
    Rtsp,
}

fn sniff(buf: &[u8]) -> Option<Sniff> {
    match *buf.first()? {
        interleaved::MAGIC => Some(Sniff::Interleaved),
        b'G' => {
            if buf.len() < 4 {
                None
            } else if &buf[..4] == b"GET " {
                Some(Sniff::Http)
            } else {
                Some(Sniff::Rtsp)
            }
        }
        b'P' => {
            if buf.len() < 5 {
                None
            } else if &buf[..5] == b"POST " {
                Some(Sniff::Http)
            } else {
                Some(Sniff::Rtsp)
            }
        }
        _ => Some(Sniff::Rtsp),
    }
}

fn try_parse_one(buf: &mut BytesMut, max_size: usize) -> Result<Option<Sniffed>> {
    let Some(kind) = sniff(buf) else {
        return Ok(None);
    };

    match kind {
        Sniff::Interleaved => {
            let mut tmp = buf.clone().freeze();
            match interleaved::try_decode(&mut tmp)? {
                Some(frame) => {
                    let consumed = buf.len() - tmp.len();
                    buf.advance(consumed);
                    Ok(Some(Sniffed::Interleaved(frame)))
                }
                None => Ok(None),
            }
        }
        Sniff::Http => match http_tunnel::parse_http_request(buf, max_size) {
            Ok((request, consumed)) => {
                buf.advance(consumed);
                Ok(Some(match request.method {
                    http_tunnel::HttpMethod::Get => Sniffed::HttpGet(request),
                    http_tunnel::HttpMethod::Post => Sniffed::HttpPost(request),
                }))
            }
            Err(rtsp_proto::Error::Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        },
        Sniff::Rtsp => match parser::parse_request(buf, max_size) {
            Ok(parsed) => {
                buf.advance(parsed.consumed);
                Ok(Some(Sniffed::Rtsp(parsed.request)))
            }
            Err(rtsp_proto::Error::Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        },
    }
}

async fn read_next_message(
    read_side: &mut ReadSide,
    buf: &mut BytesMut,
    max_size: usize,
    mailbox: &Mailbox,
) -> Result<Sniffed> {
    loop {
        if let Some(message) = try_parse_one(buf, max_size)? {
            return Ok(message);
        }
        if read_some(read_side, buf, mailbox).await? == 0 {
            return Err(Error::TransportFatal("peer closed connection".into()));
        }
    }
}

/// Read whatever bytes are available into `buf` (through the incremental
/// base64 decoder if this is the tunnel-bound side), racing an
/// administrative kill or idle timeout delivered via `mailbox`. Returns the
/// number of raw bytes read off the wire (`0` means the peer closed).
async fn read_some(read_side: &mut ReadSide, buf: &mut BytesMut, mailbox: &Mailbox) -> Result<usize> {
    loop {
        match read_side {
            ReadSide::Direct(read_half) => {
                tokio::select! {
                    result = read_half.read_buf(buf) => return Ok(result?),
                    events = mailbox.wait_for_signal() => {
                        if let Some(err) = fatal_signal(events) {
                            return Err(err);
                        }
                    }
                }
            }
            ReadSide::Tunnel(read_half, decoder) => {
                let mut scratch = [0u8; 4096];
                let n = tokio::select! {
                    result = read_half.read(&mut scratch) => result?,
                    events = mailbox.wait_for_signal() => {
                        if let Some(err) = fatal_signal(events) {
                            return Err(err);
                        }
                        continue;
                    }
                };
                if n == 0 {
                    return Ok(0);
                }
                let decoded = decoder.feed(&scratch[..n])?;
                buf.extend_from_slice(&decoded);
                return Ok(n);
            }
        }
    }
}

/// Find the index of the CRLFCRLF that ends a response's header block, the
/// same scan `rtsp-proto`'s request parser runs, since the dynamic-rate
/// probe reads a bare response with no parser of its own to lean on.
fn find_crlfcrlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Block until `buf` holds a full response head (terminating CRLFCRLF),
/// reading more off `read_side` as needed, then consume it. Used only for
/// the dynamic-rate probe's own `OPTIONS` round trip; the response body (if
/// any, none expected for `OPTIONS`) is left for the next real request to
/// pick up.
async fn await_status_line(
    read_side: &mut ReadSide,
    buf: &mut BytesMut,
    mailbox: &Mailbox,
    max_size: usize,
) -> Result<()> {
    loop {
        if let Some(end) = find_crlfcrlf(buf) {
            buf.advance(end + 4);
            return Ok(());
        }
        if buf.len() > max_size {
            return Err(Error::TransportFatal("dynamic-rate probe response too large".into()));
        }
        if read_some(read_side, buf, mailbox).await? == 0 {
            return Err(Error::TransportFatal("peer closed connection during probe".into()));
        }
    }
}

/// Spins up a fresh [`RtspSession`] task for every accepted TCP connection
/// (spec §2: "Listener → RTSP Session").
pub struct SessionAcceptor {
    deps: Arc<SessionDeps>,
    scheduler: Arc<Scheduler>,
}

impl SessionAcceptor {
    pub fn new(deps: Arc<SessionDeps>, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(SessionAcceptor { deps, scheduler })
    }
}

impl AcceptHandler for SessionAcceptor {
    fn on_accept(&self, stream: TcpStream, local_addr: SocketAddr, peer_addr: SocketAddr) {
        let deps = self.deps.clone();
        let scheduler = self.scheduler.clone();

        infra_common::tasks::spawn_detached(async move {
            let id = deps.generate_session_id();
            let mailbox = Mailbox::new();
            let handle = RtspSessionHandle::new(id, local_addr, peer_addr, mailbox.clone());
            let resolved = deps.rtsp_sessions.insert(id, handle);

            let task = Arc::new(RtspSession::new(resolved.clone(), deps.clone(), stream));

            match scheduler.spawn_with_mailbox(task, mailbox.clone()).await {
                Ok(_) => {
                    // `Scheduler::drive` blocks for a mailbox signal before
                    // its first `run` call; this session's work starts
                    // entirely inside that first `run`, so kick it once.
                    mailbox.signal(flags::USER_SIGNAL);
                }
                Err(e) => {
                    warn!(session = id, error = %e, "failed to spawn RTSP session task");
                    deps.rtsp_sessions.force_remove(id);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn handle_tracks_state_and_tunnel_role() {
        let handle = RtspSessionHandle::new(1, addr(), addr(), Mailbox::new());
        assert_eq!(handle.state(), SessionState::ReadingFirstRequest);
        handle.set_state(SessionState::ReadingRequest);
        assert_eq!(handle.state(), SessionState::ReadingRequest);

        assert_eq!(handle.tunnel_role(), TunnelRole::None);
        handle.set_tunnel_role(TunnelRole::GetSide);
        assert_eq!(handle.tunnel_role(), TunnelRole::GetSide);
    }

    #[test]
    fn mark_dead_is_observable() {
        let handle = RtspSessionHandle::new(1, addr(), addr(), Mailbox::new());
        assert!(handle.is_alive());
        handle.mark_dead();
        assert!(!handle.is_alive());
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn options_is_core_handled_without_touching_the_module_pipeline() {
        let deps = test_deps();
        let handle = deps.rtsp_sessions.insert(
            1,
            RtspSessionHandle::new(1, addr(), addr(), Mailbox::new()),
        );
        let (client, server) = loopback_pair().await;
        let session = RtspSession::new(handle, deps, server);

        let request = Request {
            method: Method::Options,
            uri: "*".into(),
            version: rtsp_proto::Version::RTSP_1_0,
            headers: rtsp_proto::HeaderList::new(),
            body: bytes::Bytes::new(),
        };
        let response = session.handle_core_request(&request).await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        drop(client);
    }

    #[tokio::test]
    async fn require_header_is_rejected_before_role_dispatch() {
        let deps = test_deps();
        let handle = deps.rtsp_sessions.insert(
            2,
            RtspSessionHandle::new(2, addr(), addr(), Mailbox::new()),
        );
        let (client, server) = loopback_pair().await;
        let session = RtspSession::new(handle, deps, server);

        let mut headers = rtsp_proto::HeaderList::new();
        headers.push(names::REQUIRE, "com.example.unknown-feature");
        let request = Request {
            method: Method::Setup,
            uri: "rtsp://h/m.mov".into(),
            version: rtsp_proto::Version::RTSP_1_0,
            headers,
            body: bytes::Bytes::new(),
        };
        let response = session.handle_core_request(&request).await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OPTION_NOT_SUPPORTED);
        assert_eq!(response.headers.get(names::UNSUPPORTED), Some("com.example.unknown-feature"));
        drop(client);
    }

    #[tokio::test]
    async fn tunnel_get_decodes_prefetched_post_bytes_through_base64() {
        use base64::Engine;

        let deps = test_deps();
        let handle = deps.rtsp_sessions.insert(
            3,
            RtspSessionHandle::new(3, addr(), addr(), Mailbox::new()),
        );
        let (_dummy_client, dummy_server) = loopback_pair().await;
        let session = RtspSession::new(handle, deps.clone(), dummy_server);

        let (_get_client, get_server) = loopback_pair().await;
        let (get_read, mut get_write) = get_server.into_split();
        let mut read_side = ReadSide::Direct(get_read);
        let mut buf = BytesMut::new();

        let mut get_headers = rtsp_proto::HeaderList::new();
        get_headers.push(names::X_SESSIONCOOKIE, "tc0");
        get_headers.push(names::ACCEPT, "application/x-rtsp-tunnelled");
        let get_request = http_tunnel::HttpTunnelRequest {
            method: http_tunnel::HttpMethod::Get,
            path: "/x".into(),
            headers: get_headers,
            body: Bytes::new(),
        };

        let (_post_client, post_server) = loopback_pair().await;
        let (post_read, _post_write) = post_server.into_split();

        // What the POST half already read past its header block: raw
        // base64, not RTSP. Only its *decoded* bytes may ever reach `buf`.
        let plaintext = b"OPTIONS * RTSP/1.0\r\nCSeq: 9\r\n\r\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(plaintext);

        let tunnel_map = deps.tunnel_map.clone();
        let bind_task = tokio::spawn(async move {
            tunnel_map
                .bind_post("tc0", post_read, Bytes::from(encoded.into_bytes()), Duration::from_millis(200))
                .await
        });

        session
            .begin_tunnel_get(&mut get_write, &mut read_side, &mut buf, get_request)
            .await
            .unwrap();

        let outcome = bind_task.await.unwrap();
        assert!(matches!(outcome, BindOutcome::Bound { .. }));
        assert_eq!(&buf[..], &plaintext[..], "prefetched bytes must be decoded, not passed through raw");
        assert!(matches!(read_side, ReadSide::Tunnel(..)));
    }

    fn test_deps() -> Arc<SessionDeps> {
        SessionDeps::new(
            SharedConfig::load(None).unwrap(),
            Arc::new(ModuleRegistry::builder().build()),
            Arc::new(RtpSessionRegistry::new()),
            Arc::new(RtspSessionRegistry::new()),
            TunnelMap::new(),
            TimeoutService::new(Duration::from_millis(50)),
            SocketPool::new(64 * 1024),
        )
    }
}
