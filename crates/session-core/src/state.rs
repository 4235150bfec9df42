//! The RTSP Session state machine's states (spec §4.6) and the HTTP
//! tunnel role flag (spec §3).
//!
//! Each state in spec §4.6 "may yield to the scheduler ... and resume at
//! the same state on the next `run`." In this Tokio rendering a state
//! transition is a plain function call inside one contiguous `async fn`,
//! and a "yield" is simply an `.await` point (on a socket read, an idle
//! sleep, or a lock acquisition); Tokio parks and resumes the task
//! transparently at each one. The module-dispatch cursor spec §3 describes
//! ("current module index plus per-module flags") is therefore the
//! *implicit* position of the `.await` inside [`crate::module::run_one_module`]
//! rather than a persisted integer field — the invariant it protects
//! (resuming at exactly the point of suspension, never re-executing a
//! module that already ran) is preserved by construction: a suspended
//! Rust future cannot be re-polled from anywhere but where it parked.

use std::fmt;

/// One RTSP Session's current position in the state machine (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    ReadingFirstRequest,
    HttpFilter,
    WaitingToBindTunnel,
    SocketBoundIntoTunnel,
    ReadingRequest,
    HaveNonTunnelMessage,
    FilteringRequest,
    RoutingRequest,
    AuthenticatingRequest,
    Authorizing,
    Preprocessing,
    Processing,
    PostProcessing,
    SendingResponse,
    CleaningUp,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which half of an HTTP tunnel pairing (if any) this session is playing
/// (spec §3: "flags for HTTP tunnel role (none / GET-side / POST-side)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelRole {
    None,
    GetSide,
    PostSide,
}
