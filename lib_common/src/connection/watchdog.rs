//! # Connection Watchdog
//!
//! Supervises the engine from outside. On every tick it either rebuilds a
//! dropped session (with capped exponential backoff between failed attempts),
//! drops a session that went silent, or checks the server's protocol version.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

use super::backoff::Backoff;
use super::server_comm::ServerCommunication;
use crate::protocol::ServerVersion;

/// What a single watchdog check did.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogOutcome {
    Healthy,
    /// Connected, but the server speaks a different protocol version.
    VersionMismatch { local: ServerVersion, remote: ServerVersion },
    /// The session carried no inbound traffic for too long and was dropped.
    StaleDisconnected { idle: Duration },
    Reconnected { epoch: u64 },
    /// The reconnect attempt failed; the watchdog waited `delay` before returning.
    ReconnectFailed { delay: Duration },
}

pub struct ConnectionWatchdog {
    comm: Arc<ServerCommunication>,
    check_interval: Duration,
    stale_threshold: Duration,
    backoff: Backoff,
    local_version: ServerVersion,
    warned_epoch: Option<u64>,
}

impl ConnectionWatchdog {
    pub fn new(comm: Arc<ServerCommunication>) -> Self {
        let timings = comm.timings().clone();
        Self {
            comm,
            check_interval: timings.watchdog_interval(),
            stale_threshold: timings.stale_threshold(),
            backoff: Backoff::new(timings.reconnect_base_delay(), timings.reconnect_max_delay()),
            local_version: ServerVersion::local(),
            warned_epoch: None,
        }
    }

    /// Runs checks forever. The first check happens immediately, which is what
    /// opens the initial connection.
    pub async fn run(mut self) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check().await;
        }
    }

    /// # Check
    ///
    /// One supervision step.
    pub async fn check(&mut self) -> WatchdogOutcome {
        if self.comm.is_connected() {
            let idle = self.comm.idle_for();
            if idle > self.stale_threshold {
                warn!(idle_secs = idle.as_secs(), "No traffic from server, dropping stale session");
                self.comm.disconnect("stale session");
                return WatchdogOutcome::StaleDisconnected { idle };
            }
            return self.check_version();
        }

        match self.comm.connect().await {
            Ok(()) => {
                self.backoff.reset();
                let epoch = self.comm.epoch();
                info!(epoch, "Watchdog re-established the server session");
                // A mismatch is reported, but the session stays up.
                let _ = self.check_version();
                WatchdogOutcome::Reconnected { epoch }
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                error!(
                    target_addr = %self.comm.describe_target(),
                    attempt = self.backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Reconnect failed: {}",
                    e
                );
                sleep(delay).await;
                WatchdogOutcome::ReconnectFailed { delay }
            }
        }
    }

    /// Logs a version mismatch once per session.
    fn check_version(&mut self) -> WatchdogOutcome {
        let Some(remote) = self.comm.server_version() else {
            return WatchdogOutcome::Healthy;
        };
        if remote == self.local_version {
            return WatchdogOutcome::Healthy;
        }

        let epoch = self.comm.epoch();
        if self.warned_epoch != Some(epoch) {
            self.warned_epoch = Some(epoch);
            warn!(
                local_version = self.local_version.version,
                local_rev = self.local_version.rev,
                server_version = remote.version,
                server_rev = remote.rev,
                "Protocol version differs from the server's"
            );
        }
        WatchdogOutcome::VersionMismatch { local: self.local_version, remote }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::*;
    use crate::protocol::tags;
    use serde_json::json;

    #[tokio::test]
    async fn test_first_check_connects() {
        let harness = Harness::sensor_node();
        let mut watchdog = ConnectionWatchdog::new(harness.comm.clone());

        let checking = tokio::spawn(async move { watchdog.check().await });
        let mut server = harness.next_server().await;
        server.accept_handshake().await;

        assert_eq!(checking.await.unwrap(), WatchdogOutcome::Reconnected { epoch: 1 });
        assert!(harness.comm.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_backs_off() {
        let harness = Harness::sensor_node();
        harness.connector.set_failing(true);
        let mut watchdog = ConnectionWatchdog::new(harness.comm.clone());

        let first = watchdog.check().await;
        let second = watchdog.check().await;
        let (WatchdogOutcome::ReconnectFailed { delay: d1 }, WatchdogOutcome::ReconnectFailed { delay: d2 }) =
            (first, second)
        else {
            panic!("expected two failed reconnects");
        };
        assert!(d1 <= Duration::from_secs(1));
        assert!(d2 >= Duration::from_secs(1) && d2 <= Duration::from_secs(2));

        harness.connector.set_failing(false);
        let comm = harness.comm.clone();
        let checking = tokio::spawn(async move { watchdog.check().await });
        let mut server = harness.next_server().await;
        server.accept_handshake().await;
        assert!(matches!(checking.await.unwrap(), WatchdogOutcome::Reconnected { .. }));
        assert!(comm.is_connected());
    }

    #[tokio::test]
    async fn test_healthy_when_versions_match() {
        let (harness, _server) = Harness::connected_sensor_node().await;
        let mut watchdog = ConnectionWatchdog::new(harness.comm.clone());
        assert_eq!(watchdog.check().await, WatchdogOutcome::Healthy);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_flagged_but_not_fatal() {
        let harness = Harness::sensor_node();
        let comm = harness.comm.clone();
        let connecting = tokio::spawn(async move { comm.connect().await });
        let mut server = harness.next_server().await;

        let _auth = server.recv().await;
        server.send(&server_response(tags::AUTHENTICATION, json!({"version": 0.4, "rev": 0}))).await;
        let _registration = server.recv().await;
        server.send(&server_response(tags::REGISTRATION, json!({}))).await;
        connecting.await.unwrap().unwrap();

        let mut watchdog = ConnectionWatchdog::new(harness.comm.clone());
        let outcome = watchdog.check().await;
        assert!(matches!(outcome, WatchdogOutcome::VersionMismatch { remote, .. } if remote.rev == 0));
        assert_eq!(watchdog.warned_epoch, Some(1));
        assert!(harness.comm.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_session_is_dropped() {
        let mut settings = test_settings();
        settings.timings.keepalive_interval_secs = 600;
        let harness = Harness::with_provider(Arc::new(OneSensorProvider), settings);
        let _server = harness.connect().await;
        let mut watchdog = ConnectionWatchdog::new(harness.comm.clone());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(watchdog.check().await, WatchdogOutcome::Healthy);

        tokio::time::advance(Duration::from_secs(31)).await;
        let outcome = watchdog.check().await;
        assert!(matches!(outcome, WatchdogOutcome::StaleDisconnected { idle } if idle > Duration::from_secs(90)));
        assert!(!harness.comm.is_connected());
    }
}
