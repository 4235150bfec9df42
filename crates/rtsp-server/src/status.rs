//! Server-status file (spec §6): written every `status_update_interval_secs`
//! seconds with current statistics, "format is an XML property list." `0`
//! disables it.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use session_core::SessionDeps;
use tokio::task::JoinHandle;
use tracing::warn;

fn render_plist(deps: &SessionDeps, started_at: Instant) -> String {
    deps.refresh_counters();

    let rtsp_sessions = deps.rtsp_sessions.len();
    let rtp_sessions = deps.rtp_sessions.len();
    let active_connections = deps.counters.active_connections.load(Ordering::Relaxed);
    let total_packets_sent = deps.counters.total_packets_sent.load(Ordering::Relaxed);
    let bandwidth_bits_per_sec = deps.counters.bandwidth_bits_per_sec.load(Ordering::Relaxed);
    let uptime_secs = started_at.elapsed().as_secs();

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n\
         <dict>\n\
         \t<key>ServerUptimeSeconds</key>\n\
         \t<integer>{uptime_secs}</integer>\n\
         \t<key>CurrentRTSPSessionCount</key>\n\
         \t<integer>{rtsp_sessions}</integer>\n\
         \t<key>CurrentRTPSessionCount</key>\n\
         \t<integer>{rtp_sessions}</integer>\n\
         \t<key>CurrentConnectionCount</key>\n\
         \t<integer>{active_connections}</integer>\n\
         \t<key>TotalPacketsSent</key>\n\
         \t<integer>{total_packets_sent}</integer>\n\
         \t<key>CurrentBandwidthBitsPerSecond</key>\n\
         \t<integer>{bandwidth_bits_per_sec}</integer>\n\
         </dict>\n\
         </plist>\n"
    )
}

/// Spawn the periodic writer. `None` if `interval` is zero (spec §6: "`0`
/// disables it").
pub fn spawn_status_writer(
    deps: Arc<SessionDeps>,
    path: std::path::PathBuf,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }

    let started_at = Instant::now();
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            write_once(&deps, &path, started_at);
        }
    }))
}

fn write_once(deps: &SessionDeps, path: &Path, started_at: Instant) {
    let contents = render_plist(deps, started_at);
    if let Err(e) = std::fs::write(path, contents) {
        warn!(path = %path.display(), error = %e, "failed to write server-status file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infra_common::config::SharedConfig;
    use infra_common::timeout::TimeoutService;
    use rtsp_transport::SocketPool;
    use session_core::{ModuleRegistry, RtpSessionRegistry, RtspSessionRegistry, TunnelMap};

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

    #[test]
    fn plist_carries_expected_keys() {
        let deps = test_deps();
        let rendered = render_plist(&deps, Instant::now());
        assert!(rendered.contains("<key>CurrentRTSPSessionCount</key>"));
        assert!(rendered.contains("<plist version=\"1.0\">"));
    }
}
