//! Default core-shipped modules (spec §4.5: "every role ships with a
//! working, replaceable default"): Digest/Basic authentication backed by a
//! small in-memory user store, a blanket allow-if-authenticated authorizer,
//! and the `SETUP`/`PLAY`/`PAUSE`/`TEARDOWN` RTP-session lifecycle itself.
//! A real deployment is expected to register its own modules ahead of (or
//! instead of) these; nothing here is special-cased by the dispatcher.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;

use infra_common::config::SharedConfig;
use rtp_session::{PayloadInfo, RtpSession, RtpStream, Transport};
use rtsp_proto::auth::{self, DigestAlgorithm};
use rtsp_proto::headers::names;
use rtsp_proto::{Method, Response, StatusCode};
use rtsp_transport::SocketPool;

use crate::module::Module;
use crate::registry::RtpSessionRegistry;
use crate::role::{ModuleOutcome, Role, RoleContext};

/// One configured user's Digest `H(A1)` (spec §4.8: "the core never sees a
/// cleartext password").
#[derive(Clone)]
struct UserEntry {
    ha1: String,
}

/// A small in-memory credential store, good enough for a default
/// deployment; anything beyond a handful of named users belongs in a
/// replacement Authenticate module.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: HashMap<String, UserEntry>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `username`, storing `H(username:realm:password)` rather
    /// than the cleartext password (spec §4.8).
    pub fn add_user(&mut self, username: impl Into<String>, realm: &str, password: &str) -> &mut Self {
        let username = username.into();
        let ha1 = auth::compute_ha1(DigestAlgorithm::Md5, &username, realm, password);
        self.users.insert(username, UserEntry { ha1 });
        self
    }

    fn ha1(&self, username: &str) -> Option<&str> {
        self.users.get(username).map(|e| e.ha1.as_str())
    }
}

/// Nonce-count replay tracking for one issued Digest nonce (spec §4.8,
/// §4.9). Nonces are never reused across challenges, so there is nothing to
/// clean up beyond the module's own lifetime. Used only before an RTP
/// Session exists to track nonce-count against instead (e.g. the very
/// first `DESCRIBE`); once a request carries an RTP Session, tracking
/// moves there (spec §3: "tracked per RTP Session").
struct IssuedNonce {
    opaque: String,
    last_nc: AtomicU32,
}

/// Digest authentication, falling back to Basic when the client sends
/// that instead (spec §4.8: "accepts whichever scheme the client offers").
/// Any request with no `Authorization` header at all is challenged fresh.
pub struct DigestAuthModule {
    realm: String,
    users: InMemoryUserStore,
    nonces: DashMap<String, IssuedNonce>,
    roles: [Role; 1],
}

impl DigestAuthModule {
    pub fn new(realm: impl Into<String>, users: InMemoryUserStore) -> Arc<Self> {
        Arc::new(DigestAuthModule {
            realm: realm.into(),
            users,
            nonces: DashMap::new(),
            roles: [Role::Authenticate],
        })
    }

    /// Mint a brand-new nonce, seeding both the module's own fallback
    /// store and (when this request already has an RTP Session attached)
    /// that session's tracked nonce, and build the `401` response for it.
    fn fresh_challenge_response(&self, cseq: Option<&str>, rtp: Option<&RtpSession>) -> Response {
        let mut rng = rand::thread_rng();
        let nonce = format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>());
        let opaque = format!("{:016x}", rng.gen::<u64>());
        self.nonces.insert(
            nonce.clone(),
            IssuedNonce {
                opaque: opaque.clone(),
                last_nc: AtomicU32::new(0),
            },
        );
        if let Some(rtp) = rtp {
            rtp.seed_digest_nonce(&nonce, &opaque, Some("auth"));
        }
        Response::new(StatusCode::UNAUTHORIZED)
            .with_cseq(cseq)
            .with_header(
                names::WWW_AUTHENTICATE,
                auth::build_digest_challenge(&self.realm, &nonce, &opaque, Some("auth"), false),
            )
    }

    /// Re-issue the *same* nonce/opaque with `stale=true` (spec §4.8, §8
    /// scenario 4: nonce-count reuse gets a stale re-challenge, not a new
    /// nonce).
    fn stale_challenge_response(&self, cseq: Option<&str>, nonce: &str, opaque: &str) -> Response {
        Response::new(StatusCode::UNAUTHORIZED)
            .with_cseq(cseq)
            .with_header(
                names::WWW_AUTHENTICATE,
                auth::build_digest_challenge(&self.realm, nonce, opaque, Some("auth"), true),
            )
    }

    fn opaque_for(&self, nonce: &str) -> Option<String> {
        self.nonces.get(nonce).map(|e| e.opaque.clone())
    }

    /// `true` if `nc` strictly increases over whatever was last accepted
    /// for this nonce (spec §4.8: reject replays with `401 stale=true`).
    /// Only consulted when no RTP Session is attached yet; once one
    /// exists, [`RtpSession::check_or_init_nonce_count`] takes over.
    fn nonce_count_ok(&self, nonce: &str, nc_hex: &str) -> bool {
        let Ok(nc) = u32::from_str_radix(nc_hex, 16) else {
            return false;
        };
        let Some(entry) = self.nonces.get(nonce) else {
            return false;
        };
        let prev = entry.last_nc.load(Ordering::SeqCst);
        if nc <= prev {
            return false;
        }
        entry.last_nc.store(nc, Ordering::SeqCst);
        true
    }
}

#[async_trait]
impl Module for DigestAuthModule {
    fn name(&self) -> &str {
        "default-digest-auth"
    }

    fn roles(&self) -> &[Role] {
        &self.roles
    }

    async fn handle(&self, _role: Role, ctx: &mut RoleContext) -> ModuleOutcome {
        let cseq = ctx.request.cseq().map(str::to_string);
        let method = ctx.request.method.as_str().to_string();
        let rtp = ctx.session.rtp_session.lock().clone();
        let rtp = rtp.as_deref();

        let Some(header) = ctx.request.headers.get(names::AUTHORIZATION).map(str::to_string) else {
            ctx.send_response(self.fresh_challenge_response(cseq.as_deref(), rtp));
            return ModuleOutcome::Done;
        };

        if let Some(params) = auth::parse_digest_header(&header) {
            let Some(ha1) = self.users.ha1(&params.username).map(str::to_string) else {
                ctx.send_response(self.fresh_challenge_response(cseq.as_deref(), rtp));
                return ModuleOutcome::Done;
            };
            let expected = auth::compute_digest_response(DigestAlgorithm::Md5, &ha1, &method, &params);
            if expected != params.response {
                ctx.send_response(self.fresh_challenge_response(cseq.as_deref(), rtp));
                return ModuleOutcome::Done;
            }

            // Credentials check out; a reused nonce-count is a replay
            // (spec §4.8, §8 scenario 4), not a bad-credentials case, so it
            // gets the *same* nonce back with `stale=true` rather than a
            // fresh challenge.
            let nc_ok = match &params.nc {
                Some(nc_hex) => match u32::from_str_radix(nc_hex, 16) {
                    Ok(nc) => match rtp {
                        Some(rtp) => rtp
                            .check_or_init_nonce_count(
                                &params.nonce,
                                params.opaque.as_deref().unwrap_or_default(),
                                params.qop.as_deref(),
                                nc,
                            )
                            .is_ok(),
                        None => self.nonce_count_ok(&params.nonce, nc_hex),
                    },
                    Err(_) => false,
                },
                None => true,
            };

            if !nc_ok {
                let opaque = match rtp.and_then(|rtp| rtp.digest_nonce_and_opaque()) {
                    Some((_, opaque)) => opaque,
                    None => self.opaque_for(&params.nonce).unwrap_or_default(),
                };
                ctx.send_response(self.stale_challenge_response(cseq.as_deref(), &params.nonce, &opaque));
                return ModuleOutcome::Done;
            }

            ctx.authenticated_user = Some(params.username);
            return ModuleOutcome::Done;
        } else if let Some((user, password)) = auth::decode_basic(&header) {
            let supplied_ha1 = auth::compute_ha1(DigestAlgorithm::Md5, &user, &self.realm, &password);
            if self.users.ha1(&user) == Some(supplied_ha1.as_str()) {
                ctx.authenticated_user = Some(user);
                return ModuleOutcome::Done;
            }
        }

        ctx.send_response(self.fresh_challenge_response(cseq.as_deref(), rtp));
        ModuleOutcome::Done
    }
}

/// Blanket "authenticated is authorized" policy (spec §4.8's default: no
/// per-path ACLs out of the box). A deployment wanting finer-grained rules
/// registers its own `Authorize` module instead.
pub struct AllowAuthenticatedModule {
    roles: [Role; 1],
}

impl AllowAuthenticatedModule {
    pub fn new() -> Arc<Self> {
        Arc::new(AllowAuthenticatedModule {
            roles: [Role::Authorize],
        })
    }
}

#[async_trait]
impl Module for AllowAuthenticatedModule {
    fn name(&self) -> &str {
        "default-allow-authenticated"
    }

    fn roles(&self) -> &[Role] {
        &self.roles
    }

    async fn handle(&self, _role: Role, ctx: &mut RoleContext) -> ModuleOutcome {
        if ctx.response_sent {
            return ModuleOutcome::Done;
        }
        if ctx.authenticated_user.is_some() {
            ctx.authorized = true;
        } else {
            ctx.send_response(Response::new(StatusCode::FORBIDDEN).with_cseq(ctx.request.cseq()));
        }
        ModuleOutcome::Done
    }
}

/// A `client_port=a-b` or `interleaved=a-b` pair parsed out of a
/// `Transport` header.
struct ParsedTransport {
    udp: bool,
    client_ports: Option<(u16, u16)>,
    interleaved: Option<(u8, u8)>,
}

/// Pull out the pieces of a `Transport` header this module cares about,
/// ignoring parameters (`unicast`, `mode=`, ...) it doesn't act on. Good
/// enough for the common `RTP/AVP;unicast;client_port=a-b` and
/// `RTP/AVP/TCP;interleaved=a-b` forms (spec §4.7).
fn parse_transport(value: &str) -> ParsedTransport {
    let udp = !value.contains("RTP/AVP/TCP");
    let mut client_ports = None;
    let mut interleaved = None;

    for param in value.split(';') {
        let param = param.trim();
        if let Some(range) = param.strip_prefix("client_port=") {
            client_ports = parse_port_pair(range);
        } else if let Some(range) = param.strip_prefix("interleaved=") {
            if let Some((a, b)) = range.split_once('-') {
                if let (Ok(a), Ok(b)) = (a.parse(), b.parse()) {
                    interleaved = Some((a, b));
                }
            }
        }
    }

    ParsedTransport {
        udp,
        client_ports,
        interleaved,
    }
}

fn parse_port_pair(range: &str) -> Option<(u16, u16)> {
    let (a, b) = range.split_once('-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

/// The `SETUP`/`PLAY`/`PAUSE`/`TEARDOWN` lifecycle (spec §4.7): owns RTP
/// Session creation/attachment, UDP socket-pair acquisition, and the
/// connection/bandwidth ceiling checks spec §7 asks for at `SETUP`/`PLAY`
/// time. Registered under `Request`; a deployment wanting custom transport
/// negotiation replaces this module wholesale.
pub struct RtpLifecycleModule {
    rtp_sessions: Arc<RtpSessionRegistry>,
    socket_pool: SocketPool,
    config: SharedConfig,
    roles: [Role; 1],
}

impl RtpLifecycleModule {
    pub fn new(rtp_sessions: Arc<RtpSessionRegistry>, socket_pool: SocketPool, config: SharedConfig) -> Arc<Self> {
        Arc::new(RtpLifecycleModule {
            rtp_sessions,
            socket_pool,
            config,
            roles: [Role::Request],
        })
    }

    fn error_response(status: StatusCode, cseq: Option<&str>) -> Response {
        Response::new(status).with_cseq(cseq)
    }

    async fn handle_setup(&self, ctx: &mut RoleContext) -> ModuleOutcome {
        let cseq = ctx.request.cseq().map(str::to_string);
        let cfg = self.config.snapshot();

        if self.rtp_sessions.len() >= cfg.max_connections {
            ctx.send_response(Self::error_response(StatusCode::NOT_ENOUGH_BANDWIDTH, cseq.as_deref()));
            return ModuleOutcome::Done;
        }

        let Some(transport_header) = ctx.request.headers.get(names::TRANSPORT).map(str::to_string) else {
            ctx.send_response(Self::error_response(StatusCode::BAD_REQUEST, cseq.as_deref()));
            return ModuleOutcome::Done;
        };
        let parsed = parse_transport(&transport_header);

        let existing = ctx
            .session
            .rtp_session
            .lock()
            .clone();
        let rtp = match existing {
            Some(rtp) => rtp,
            None => {
                let id = ctx.session.id;
                match self.rtp_sessions.try_claim(id, RtpSession::new(id)) {
                    Ok(resolved) => {
                        *ctx.session.rtp_session.lock() = Some(resolved.clone());
                        resolved
                    }
                    Err(_) => match self.rtp_sessions.resolve(id) {
                        Some(resolved) => {
                            *ctx.session.rtp_session.lock() = Some(resolved.clone());
                            resolved
                        }
                        None => {
                            ctx.send_response(Self::error_response(StatusCode::INTERNAL_SERVER_ERROR, cseq.as_deref()));
                            return ModuleOutcome::Done;
                        }
                    },
                }
            }
        };

        let ssrc: u32 = rand::thread_rng().gen();
        let payload = PayloadInfo {
            payload_type: 96,
            clock_rate: 90_000,
            encoding_name: "unknown".to_string(),
        };

        let transport_ack = if let Some((rtp_ch, rtcp_ch)) = parsed.interleaved {
            rtp.add_stream(RtpStream::new(ssrc, payload, Transport::Interleaved(rtp_ch, rtcp_ch)));
            format!("RTP/AVP/TCP;interleaved={}-{}", rtp_ch, rtcp_ch)
        } else if parsed.udp {
            let local_ip: IpAddr = ctx.session.local_addr.ip();
            let pair = match self.socket_pool.acquire(local_ip, cfg.rtp_port_base).await {
                Ok(pair) => pair,
                Err(_) => {
                    ctx.send_response(Self::error_response(StatusCode::SERVICE_UNAVAILABLE, cseq.as_deref()));
                    return ModuleOutcome::Done;
                }
            };
            let server_port = pair.rtp_port;
            rtp.add_stream(RtpStream::new(ssrc, payload, Transport::Udp(pair)));
            match parsed.client_ports {
                Some((a, b)) => format!(
                    "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                    a, b, server_port, server_port + 1
                ),
                None => format!("RTP/AVP;unicast;server_port={}-{}", server_port, server_port + 1),
            }
        } else {
            ctx.send_response(Self::error_response(StatusCode::BAD_REQUEST, cseq.as_deref()));
            return ModuleOutcome::Done;
        };

        ctx.send_response(
            Response::new(StatusCode::OK)
                .with_cseq(cseq.as_deref())
                .with_header(names::SESSION, crate::id::render(ctx.session.id))
                .with_header(names::TRANSPORT, transport_ack),
        );
        ModuleOutcome::Done
    }

    fn handle_play(&self, ctx: &mut RoleContext) -> ModuleOutcome {
        let cseq = ctx.request.cseq().map(str::to_string);
        let Some(rtp) = ctx.session.rtp_session.lock().clone() else {
            ctx.send_response(Self::error_response(StatusCode::SESSION_NOT_FOUND, cseq.as_deref()));
            return ModuleOutcome::Done;
        };
        let cfg = self.config.snapshot();
        if cfg.max_bandwidth_bits_per_sec > 0 {
            let projected: u64 = self
                .rtp_sessions
                .ids()
                .iter()
                .filter_map(|id| self.rtp_sessions.resolve(*id))
                .map(|s| s.bytes_sent() * 8)
                .sum();
            if projected > cfg.max_bandwidth_bits_per_sec {
                ctx.send_response(Self::error_response(StatusCode::NOT_ENOUGH_BANDWIDTH, cseq.as_deref()));
                return ModuleOutcome::Done;
            }
        }
        let was_playing = rtp.state() == rtp_session::PlaybackState::Playing;
        rtp.start_playing();
        if !was_playing {
            // spec §2, §4.6: a newly playing RTP Session dispatches to
            // whatever packet-sending module a preprocessor attached. A
            // no-op when none did (the default deployment ships no media
            // reader, spec §1).
            rtp_session::spawn_packet_pump(rtp.as_arc());
        }
        ctx.send_response(
            Response::new(StatusCode::OK)
                .with_cseq(cseq.as_deref())
                .with_header(names::SESSION, crate::id::render(ctx.session.id)),
        );
        ModuleOutcome::Done
    }

    fn handle_pause(&self, ctx: &mut RoleContext) -> ModuleOutcome {
        let cseq = ctx.request.cseq().map(str::to_string);
        let Some(rtp) = ctx.session.rtp_session.lock().clone() else {
            ctx.send_response(Self::error_response(StatusCode::SESSION_NOT_FOUND, cseq.as_deref()));
            return ModuleOutcome::Done;
        };
        rtp.pause();
        ctx.send_response(Response::new(StatusCode::OK).with_cseq(cseq.as_deref()));
        ModuleOutcome::Done
    }

    fn handle_teardown(&self, ctx: &mut RoleContext) -> ModuleOutcome {
        let cseq = ctx.request.cseq().map(str::to_string);
        *ctx.session.rtp_session.lock() = None;
        self.rtp_sessions.force_remove(ctx.session.id);
        ctx.send_response(Response::new(StatusCode::OK).with_cseq(cseq.as_deref()));
        ModuleOutcome::Done
    }
}

#[async_trait]
impl Module for RtpLifecycleModule {
    fn name(&self) -> &str {
        "default-rtp-lifecycle"
    }

    fn roles(&self) -> &[Role] {
        &self.roles
    }

    fn claims_methods(&self) -> &[Method] {
        &[Method::Setup, Method::Play, Method::Pause, Method::Teardown]
    }

    async fn handle(&self, _role: Role, ctx: &mut RoleContext) -> ModuleOutcome {
        if ctx.response_sent {
            return ModuleOutcome::Done;
        }
        match ctx.request.method {
            Method::Setup => self.handle_setup(ctx).await,
            Method::Play => self.handle_play(ctx),
            Method::Pause => self.handle_pause(ctx),
            Method::Teardown => self.handle_teardown(ctx),
            _ => ModuleOutcome::Done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use infra_common::tasks::Mailbox;
    use rtsp_proto::{HeaderList, Request, Version};

    use crate::registry::{Registry, Resolved};
    use crate::rtsp_session::RtspSessionHandle;

    #[test]
    fn parses_udp_unicast_transport() {
        let parsed = parse_transport("RTP/AVP;unicast;client_port=5000-5001");
        assert!(parsed.udp);
        assert_eq!(parsed.client_ports, Some((5000, 5001)));
        assert!(parsed.interleaved.is_none());
    }

    #[test]
    fn parses_interleaved_transport() {
        let parsed = parse_transport("RTP/AVP/TCP;interleaved=0-1");
        assert!(!parsed.udp);
        assert_eq!(parsed.interleaved, Some((0, 1)));
    }

    #[test]
    fn user_store_round_trips_ha1() {
        let mut store = InMemoryUserStore::new();
        store.add_user("alice", "streaming", "secret");
        let expected = auth::compute_ha1(DigestAlgorithm::Md5, "alice", "streaming", "secret");
        assert_eq!(store.ha1("alice"), Some(expected.as_str()));
    }

    #[test]
    fn nonce_count_must_strictly_increase() {
        let module = DigestAuthModule::new("streaming", InMemoryUserStore::new());
        module.nonces.insert(
            "n1".to_string(),
            IssuedNonce {
                opaque: "op1".to_string(),
                last_nc: AtomicU32::new(0),
            },
        );
        assert!(module.nonce_count_ok("n1", "00000001"));
        assert!(!module.nonce_count_ok("n1", "00000001"));
        assert!(module.nonce_count_ok("n1", "00000002"));
    }

    fn session_with_rtp_attached() -> Resolved<RtspSessionHandle> {
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let rtsp_sessions: Registry<RtspSessionHandle> = Registry::new();
        let handle = rtsp_sessions.insert(1, RtspSessionHandle::new(1, addr, addr, Mailbox::new()));
        let rtp_sessions: Registry<RtpSession> = Registry::new();
        let rtp = rtp_sessions.insert(1, RtpSession::new(1));
        *handle.rtp_session.lock() = Some(rtp);
        handle
    }

    fn bare_describe_request() -> Request {
        let mut headers = HeaderList::new();
        headers.push(names::CSEQ, "1");
        Request {
            method: Method::Describe,
            uri: "rtsp://h/m.mov".into(),
            version: Version::RTSP_1_0,
            headers,
            body: Bytes::new(),
        }
    }

    fn digest_request(ha1: &str, nonce: &str, opaque: &str, nc: &str, username: &str) -> Request {
        let params = auth::DigestParams {
            username: username.to_string(),
            realm: "streaming".to_string(),
            nonce: nonce.to_string(),
            uri: "rtsp://h/m.mov".to_string(),
            response: String::new(),
            qop: Some("auth".to_string()),
            nc: Some(nc.to_string()),
            cnonce: Some("cnonce1".to_string()),
            opaque: Some(opaque.to_string()),
        };
        let response = auth::compute_digest_response(DigestAlgorithm::Md5, ha1, "DESCRIBE", &params);
        let header = format!(
            "Digest username=\"{}\", realm=\"streaming\", nonce=\"{}\", uri=\"rtsp://h/m.mov\", response=\"{}\", qop=auth, nc={}, cnonce=\"cnonce1\", opaque=\"{}\"",
            username, nonce, response, nc, opaque
        );
        let mut headers = HeaderList::new();
        headers.push(names::AUTHORIZATION, header);
        headers.push(names::CSEQ, "2");
        Request {
            method: Method::Describe,
            uri: "rtsp://h/m.mov".into(),
            version: Version::RTSP_1_0,
            headers,
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn nonce_replay_on_attached_rtp_session_reissues_same_nonce_stale() {
        let mut store = InMemoryUserStore::new();
        store.add_user("alice", "streaming", "secret");
        let ha1 = auth::compute_ha1(DigestAlgorithm::Md5, "alice", "streaming", "secret");
        let module = DigestAuthModule::new("streaming", store);
        let session = session_with_rtp_attached();

        let mut ctx = RoleContext::new(session.clone(), bare_describe_request());
        module.handle(Role::Authenticate, &mut ctx).await;
        let challenge = ctx.response.take().expect("fresh challenge");
        let www = challenge.headers.get(names::WWW_AUTHENTICATE).unwrap().to_string();
        assert!(!www.contains("stale=true"));
        let issued = auth::parse_digest_header(&www).expect("parses as digest params");
        let nonce = issued.nonce.clone();
        let opaque = issued.opaque.clone().expect("opaque present");

        let mut ctx2 = RoleContext::new(session.clone(), digest_request(&ha1, &nonce, &opaque, "00000001", "alice"));
        module.handle(Role::Authenticate, &mut ctx2).await;
        assert!(!ctx2.response_sent, "valid credentials with fresh nc must not be challenged");
        assert_eq!(ctx2.authenticated_user.as_deref(), Some("alice"));

        let mut ctx3 = RoleContext::new(session.clone(), digest_request(&ha1, &nonce, &opaque, "00000001", "alice"));
        module.handle(Role::Authenticate, &mut ctx3).await;
        let replay = ctx3.response.take().expect("replay is challenged again");
        assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
        let replay_www = replay.headers.get(names::WWW_AUTHENTICATE).unwrap().to_string();
        assert!(replay_www.contains("stale=true"), "replay must be flagged stale");
        let replay_params = auth::parse_digest_header(&replay_www).expect("parses as digest params");
        assert_eq!(replay_params.nonce, nonce, "replay must reuse the same nonce, not mint a new one");
        assert_eq!(replay_params.opaque.as_deref(), Some(opaque.as_str()));
    }
}
