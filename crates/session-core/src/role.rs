//! Roles and the per-call dispatch contract (spec §4.5).

use std::time::Duration;

use rtsp_proto::{Method, Request, Response};

use crate::dictionary::Dictionary;
use crate::registry::Resolved;
use crate::rtsp_session::RtspSessionHandle;

/// The fixed roles a module may implement. `REQUEST_PIPELINE` lists the
/// seven request-processing roles in their mandatory dispatch order; the
/// remainder are lifecycle roles invoked outside request processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Filter,
    Route,
    Authenticate,
    Authorize,
    Preprocessor,
    Request,
    Postprocessor,
    Register,
    Initialize,
    RereadPrefs,
    RtspSessionClosing,
    Shutdown,
    RtspIncomingData,
}

impl Role {
    /// The per-request role order, fixed by spec §4.5 numbering 1–7.
    pub const REQUEST_PIPELINE: [Role; 7] = [
        Role::Filter,
        Role::Route,
        Role::Authenticate,
        Role::Authorize,
        Role::Preprocessor,
        Role::Request,
        Role::Postprocessor,
    ];
}

/// What a module's call returns (spec §4.5's three-way contract).
#[derive(Debug, Clone, Copy)]
pub enum ModuleOutcome {
    /// Continue to the next module.
    Done,
    /// Suspend the session task for `idle`, then resume at the *same*
    /// module index.
    EventRequested { idle: Duration },
    /// Re-invoke this module under the process-wide global lock.
    GlobalLockRequested,
}

/// The parameter block a module sees for one role invocation. Owned rather
/// than borrowed so it can cross an `.await` (an idle suspension or a lock
/// acquisition) without fighting the borrow checker the way a live
/// reference into the session would.
pub struct RoleContext {
    /// The owning RTSP Session, exactly the "session" field spec §4.5 says
    /// the dispatcher supplies in every module's parameter block. A
    /// [`Resolved`] handle rather than a bare reference so a module that
    /// stashes it (e.g. to outlive this one invocation while waiting on an
    /// RTP session) holds the same refcounted lease the session map itself
    /// uses (spec §3's "shared by reference-count" rule, generalized here
    /// from RTP sessions to RTSP sessions too).
    pub session: Resolved<RtspSessionHandle>,
    pub request: Request,
    /// Set by a module that emits a response; once set, later modules in
    /// the same role must not emit a second one (spec §4.5). The
    /// dispatcher still calls every registered module in order regardless
    /// — the check is the module's own responsibility, matching spec §8's
    /// "module order within a role equal to registration order" invariant.
    pub response: Option<Response>,
    pub response_sent: bool,
    /// Per-request scratch space modules use instead of the core growing a
    /// field per plugin (spec §9's `Dictionary` pattern).
    pub attrs: Dictionary,
    /// Authenticated user name, once `Authenticate` has run.
    pub authenticated_user: Option<String>,
    /// Whether `Authorize` has granted the request.
    pub authorized: bool,
}

impl RoleContext {
    pub fn new(session: Resolved<RtspSessionHandle>, request: Request) -> Self {
        RoleContext {
            session,
            request,
            response: None,
            response_sent: false,
            attrs: Dictionary::new(),
            authenticated_user: None,
            authorized: false,
        }
    }

    /// Record a response and mark the flag, matching spec §9's resumption
    /// rule: "modules that send responses must set the response-sent flag
    /// before yielding."
    pub fn send_response(&mut self, response: Response) {
        self.response = Some(response);
        self.response_sent = true;
    }

    pub fn method(&self) -> Method {
        self.request.method
    }

    pub fn session_id(&self) -> u64 {
        self.session.id
    }
}
