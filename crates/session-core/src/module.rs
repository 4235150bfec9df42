//! The Module Registry (spec §4.5, §9): the extension point the core
//! dispatches through. The table is frozen after startup (or fully rebuilt
//! under the prefs lock on reload, spec §3).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rtsp_proto::Method;
use tokio::sync::Mutex as AsyncMutex;
use tracing::trace;

use rtsp_proto::headers::names;

use crate::role::{ModuleOutcome, Role, RoleContext};
use crate::state::SessionState;

/// The [`SessionState`] a request occupies while a given role's modules run
/// (spec §4.6). Used purely for observability; dispatch order and semantics
/// don't depend on it.
fn role_state(role: Role) -> SessionState {
    match role {
        Role::Filter => SessionState::FilteringRequest,
        Role::Route => SessionState::RoutingRequest,
        Role::Authenticate => SessionState::AuthenticatingRequest,
        Role::Authorize => SessionState::Authorizing,
        Role::Preprocessor => SessionState::Preprocessing,
        Role::Request => SessionState::Processing,
        Role::Postprocessor => SessionState::PostProcessing,
        _ => SessionState::HaveNonTunnelMessage,
    }
}

/// A pluggable handler registered under zero or more [`Role`]s. Implemented
/// by the file-reader, reflector, admin-HTTP, and access-log plug-ins that
/// spec §1 treats as external collaborators; the core only ever sees this
/// trait object.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Roles this module wants to be invoked for. The registry fans the
    /// module out into each of those roles' ordered sequences.
    fn roles(&self) -> &[Role];

    /// Handle one role invocation. The default no-op `Done` is correct for
    /// any role this module doesn't actually implement logic for but still
    /// wants to appear in (rare; mostly modules only list the roles they
    /// override).
    async fn handle(&self, _role: Role, _ctx: &mut RoleContext) -> ModuleOutcome {
        ModuleOutcome::Done
    }

    /// `Register`/`Initialize`/`RereadPrefs`/`Shutdown` (spec §4.5):
    /// lifecycle roles invoked outside request processing, with no session
    /// or request parameter block to hand over.
    async fn on_lifecycle(&self, _role: Role) {}

    /// `RTSPSessionClosing` (spec §4.5): fired once per session right
    /// before its registry entry is torn down.
    async fn on_session_closing(&self, _session: &crate::rtsp_session::RtspSessionHandle) {}

    /// `RTSPIncomingData` (spec §4.5): interleaved `$`-framed data arrived
    /// on an RTSP TCP connection. `channel` is the interleaved channel
    /// number from the frame header; `data` is the frame payload.
    async fn on_incoming_data(&self, _session: &crate::rtsp_session::RtspSessionHandle, _channel: u8, _data: &[u8]) {}

    /// Methods this module claims to handle, contributing to the `Public:`
    /// header built once at startup (spec §4.7). Most modules only claim
    /// methods through their `Request` or `Preprocessor` role.
    fn claims_methods(&self) -> &[Method] {
        &[]
    }
}

/// Invoke a single module for `role`, honoring its [`ModuleOutcome`]:
/// looping on `EventRequested` (sleeping then resuming at the same module)
/// and on `GlobalLockRequested` (re-invoking once under `global_lock`).
async fn run_one_module(
    module: &Arc<dyn Module>,
    role: Role,
    ctx: &mut RoleContext,
    global_lock: &AsyncMutex<()>,
) {
    loop {
        let outcome = module.handle(role, ctx).await;
        match outcome {
            ModuleOutcome::Done => return,
            ModuleOutcome::EventRequested { idle } => {
                trace!(module = module.name(), ?role, ?idle, "module requested idle suspension");
                tokio::time::sleep(idle).await;
                continue;
            }
            ModuleOutcome::GlobalLockRequested => {
                trace!(module = module.name(), ?role, "module requested the global lock");
                let _guard = global_lock.lock().await;
                match module.handle(role, ctx).await {
                    ModuleOutcome::Done => return,
                    ModuleOutcome::EventRequested { idle } => {
                        drop(_guard);
                        tokio::time::sleep(idle).await;
                        continue;
                    }
                    ModuleOutcome::GlobalLockRequested => continue,
                }
            }
        }
    }
}

/// The frozen `role → ordered modules` table, built once at startup (or
/// wholesale rebuilt under the prefs lock on reload, spec §3). Role
/// dispatch order is deterministic and identical to table order for every
/// request (spec §3's invariant, tested in spec §8).
pub struct ModuleRegistry {
    by_role: HashMap<Role, Vec<Arc<dyn Module>>>,
    public_header: String,
}

impl ModuleRegistry {
    pub fn builder() -> ModuleRegistryBuilder {
        ModuleRegistryBuilder::default()
    }

    /// The `Public:` header value built at init (spec §4.7): the union of
    /// methods modules claimed to handle, deduplicated, core-handled
    /// `OPTIONS` always present.
    pub fn public_header(&self) -> &str {
        &self.public_header
    }

    /// Dispatch all seven request-processing roles in order (spec §4.5).
    /// `Request` is skipped entirely if an earlier role already sent a
    /// response; `Postprocessor` always runs.
    pub async fn dispatch_request_pipeline(
        &self,
        ctx: &mut RoleContext,
        global_lock: &AsyncMutex<()>,
    ) {
        for role in [Role::Filter, Role::Route, Role::Authenticate, Role::Authorize] {
            ctx.session.set_state(role_state(role));
            self.dispatch_role(role, ctx, global_lock).await;
        }

        // spec §4.7: a second PLAY with no Range on an already-playing
        // session is an RFC 2326 keepalive ping, answered without running
        // the preprocessor or request roles.
        let is_play_ping = ctx.method() == Method::Play
            && !ctx.request.headers.contains(names::RANGE)
            && ctx.session.is_already_playing();

        if is_play_ping {
            if !ctx.response_sent {
                ctx.send_response(rtsp_proto::Response::new(rtsp_proto::StatusCode::OK).with_cseq(ctx.request.cseq()));
            }
        } else {
            ctx.session.set_state(role_state(Role::Preprocessor));
            self.dispatch_role(Role::Preprocessor, ctx, global_lock).await;

            if !ctx.response_sent {
                ctx.session.set_state(role_state(Role::Request));
                self.dispatch_role(Role::Request, ctx, global_lock).await;
            }
        }

        ctx.session.set_state(role_state(Role::Postprocessor));
        self.dispatch_role(Role::Postprocessor, ctx, global_lock).await;
    }

    /// Invoke every module registered for `role`, in registration order
    /// (spec §8's per-role ordering invariant). Modules are responsible
    /// for checking `ctx.response_sent` themselves before emitting a
    /// second response.
    pub async fn dispatch_role(&self, role: Role, ctx: &mut RoleContext, global_lock: &AsyncMutex<()>) {
        let Some(modules) = self.by_role.get(&role) else {
            return;
        };
        for module in modules {
            run_one_module(module, role, ctx, global_lock).await;
        }
    }

    pub fn modules_for(&self, role: Role) -> &[Arc<dyn Module>] {
        self.by_role.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Invoke every module registered for a lifecycle role (`Register`,
    /// `Initialize`, `RereadPrefs`, `Shutdown`) in registration order
    /// (spec §4.5). Used by Server Core at startup, on prefs reload, and
    /// at shutdown; never called from inside request processing.
    pub async fn dispatch_lifecycle(&self, role: Role) {
        for module in self.modules_for(role) {
            trace!(module = module.name(), ?role, "lifecycle role dispatch");
            module.on_lifecycle(role).await;
        }
    }

    /// `RTSPSessionClosing` (spec §4.5): fired once a session's task has
    /// decided to terminate, before its registry entry is removed.
    pub async fn dispatch_session_closing(&self, session: &crate::rtsp_session::RtspSessionHandle) {
        for module in self.modules_for(Role::RtspSessionClosing) {
            module.on_session_closing(session).await;
        }
    }

    /// `RTSPIncomingData` (spec §4.5): interleaved data arrived on an RTSP
    /// TCP connection, delivered to modules in registration order.
    pub async fn dispatch_incoming_data(&self, session: &crate::rtsp_session::RtspSessionHandle, channel: u8, data: &[u8]) {
        for module in self.modules_for(Role::RtspIncomingData) {
            module.on_incoming_data(session, channel, data).await;
        }
    }
}

#[derive(Default)]
pub struct ModuleRegistryBuilder {
    modules: Vec<Arc<dyn Module>>,
}

impl ModuleRegistryBuilder {
    pub fn register(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn build(self) -> ModuleRegistry {
        let mut by_role: HashMap<Role, Vec<Arc<dyn Module>>> = HashMap::new();
        let mut claimed: Vec<Method> = Vec::new();

        for module in &self.modules {
            for role in module.roles() {
                by_role.entry(*role).or_default().push(module.clone());
            }
            for method in module.claims_methods() {
                if !claimed.contains(method) {
                    claimed.push(*method);
                }
            }
        }

        if !claimed.contains(&Method::Options) {
            claimed.push(Method::Options);
        }

        let public_header = claimed
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");

        ModuleRegistry {
            by_role,
            public_header,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtsp_proto::{Request, Response, StatusCode, Version};

    use crate::registry::{Registry, Resolved};
    use crate::rtsp_session::RtspSessionHandle;
    use infra_common::tasks::Mailbox;

    fn dummy_session() -> Resolved<RtspSessionHandle> {
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let registry: Registry<RtspSessionHandle> = Registry::new();
        registry.insert(1, RtspSessionHandle::new(1, addr, addr, Mailbox::new()))
    }

    struct RespondingModule {
        roles: Vec<Role>,
    }

    #[async_trait]
    impl Module for RespondingModule {
        fn name(&self) -> &str {
            "responding"
        }

        fn roles(&self) -> &[Role] {
            &self.roles
        }

        async fn handle(&self, _role: Role, ctx: &mut RoleContext) -> ModuleOutcome {
            if !ctx.response_sent {
                ctx.send_response(Response::new(StatusCode::OK));
            }
            ModuleOutcome::Done
        }

        fn claims_methods(&self) -> &[Method] {
            &[Method::Describe]
        }
    }

    fn dummy_request() -> Request {
        Request {
            method: Method::Describe,
            uri: "rtsp://h/m.mov".into(),
            version: Version::RTSP_1_0,
            headers: rtsp_proto::HeaderList::new(),
            body: bytes::Bytes::new(),
        }
    }

    #[tokio::test]
    async fn request_role_is_skipped_when_preprocessor_already_responded() {
        let registry = ModuleRegistry::builder()
            .register(Arc::new(RespondingModule { roles: vec![Role::Preprocessor] }))
            .build();

        let mut ctx = RoleContext::new(dummy_session(), dummy_request());
        let lock = AsyncMutex::new(());
        registry.dispatch_request_pipeline(&mut ctx, &lock).await;

        assert!(ctx.response_sent);
        assert_eq!(registry.modules_for(Role::Request).len(), 0);
    }

    #[tokio::test]
    async fn public_header_includes_options_and_claimed_methods() {
        let registry = ModuleRegistry::builder()
            .register(Arc::new(RespondingModule { roles: vec![Role::Request] }))
            .build();
        assert_eq!(registry.public_header(), "DESCRIBE, OPTIONS");
    }

    struct GlobalLockModule {
        already_locked: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Module for GlobalLockModule {
        fn name(&self) -> &str {
            "global-lock"
        }

        fn roles(&self) -> &[Role] {
            &[Role::Preprocessor]
        }

        async fn handle(&self, _role: Role, ctx: &mut RoleContext) -> ModuleOutcome {
            if self
                .already_locked
                .swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                ctx.send_response(Response::new(StatusCode::OK));
                ModuleOutcome::Done
            } else {
                ModuleOutcome::GlobalLockRequested
            }
        }
    }

    #[tokio::test]
    async fn global_lock_requested_reinvokes_the_same_module() {
        let registry = ModuleRegistry::builder()
            .register(Arc::new(GlobalLockModule {
                already_locked: std::sync::atomic::AtomicBool::new(false),
            }))
            .build();

        let mut ctx = RoleContext::new(dummy_session(), dummy_request());
        let lock = AsyncMutex::new(());
        registry.dispatch_request_pipeline(&mut ctx, &lock).await;
        assert!(ctx.response_sent);
    }

    struct RecordingLifecycleModule {
        roles: Vec<Role>,
        lifecycle_calls: std::sync::Mutex<Vec<Role>>,
        closing_calls: std::sync::atomic::AtomicUsize,
        incoming_data_calls: std::sync::Mutex<Vec<(u8, Vec<u8>)>>,
    }

    #[async_trait]
    impl Module for RecordingLifecycleModule {
        fn name(&self) -> &str {
            "recording-lifecycle"
        }

        fn roles(&self) -> &[Role] {
            &self.roles
        }

        async fn on_lifecycle(&self, role: Role) {
            self.lifecycle_calls.lock().unwrap().push(role);
        }

        async fn on_session_closing(&self, _session: &crate::rtsp_session::RtspSessionHandle) {
            self.closing_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        async fn on_incoming_data(&self, _session: &crate::rtsp_session::RtspSessionHandle, channel: u8, data: &[u8]) {
            self.incoming_data_calls.lock().unwrap().push((channel, data.to_vec()));
        }
    }

    #[tokio::test]
    async fn lifecycle_roles_are_dispatched_outside_request_processing() {
        let module = Arc::new(RecordingLifecycleModule {
            roles: vec![Role::Initialize, Role::Shutdown, Role::RtspSessionClosing, Role::RtspIncomingData],
            lifecycle_calls: std::sync::Mutex::new(Vec::new()),
            closing_calls: std::sync::atomic::AtomicUsize::new(0),
            incoming_data_calls: std::sync::Mutex::new(Vec::new()),
        });
        let registry = ModuleRegistry::builder().register(module.clone()).build();

        registry.dispatch_lifecycle(Role::Initialize).await;
        registry.dispatch_lifecycle(Role::Shutdown).await;
        assert_eq!(*module.lifecycle_calls.lock().unwrap(), vec![Role::Initialize, Role::Shutdown]);

        let session = dummy_session();
        registry.dispatch_session_closing(&session).await;
        assert_eq!(module.closing_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        registry.dispatch_incoming_data(&session, 0, b"rtcp-bytes").await;
        assert_eq!(
            module.incoming_data_calls.lock().unwrap().as_slice(),
            &[(0u8, b"rtcp-bytes".to_vec())]
        );
    }
}
