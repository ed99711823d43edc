//! Detection of changes to the OS-reported current session.
//!
//! A detector only reports what the registry says is current; deciding
//! whether that is actually a different session is the tracker's job.

use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    error::{PlatformError, PlatformResult},
    platform::{self, HostVersion, ListenerToken, ManagerHandle, SessionHandle, SessionManager},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub type DetectionCallback = Arc<dyn Fn(Option<SessionHandle>) + Send + Sync>;

/// Configured choice of detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DetectorStrategy {
    /// Pick from the host OS version.
    #[default]
    Auto,
    Event,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    EventBased,
    Polling,
}

impl DetectorStrategy {
    pub fn resolve(self, host: Option<HostVersion>) -> DetectorKind {
        match self {
            DetectorStrategy::Event => DetectorKind::EventBased,
            DetectorStrategy::Polling => DetectorKind::Polling,
            DetectorStrategy::Auto => match host {
                Some(version) if !version.has_reliable_session_events() => DetectorKind::Polling,
                _ => DetectorKind::EventBased,
            },
        }
    }
}

fn forward_current(manager: &dyn SessionManager, on_detected: &DetectionCallback) {
    match manager.current_session() {
        Ok(session) => on_detected(session),
        Err(err) => warn!(error = %err, "failed to query the current media session"),
    }
}

pub enum ChangeDetector {
    EventBased(EventDetector),
    Polling(PollingDetector),
}

impl ChangeDetector {
    pub fn new(
        kind: DetectorKind,
        manager: ManagerHandle,
        poll_interval: Duration,
        on_detected: DetectionCallback,
    ) -> Self {
        match kind {
            DetectorKind::EventBased => {
                ChangeDetector::EventBased(EventDetector::new(manager, on_detected))
            }
            DetectorKind::Polling => ChangeDetector::Polling(PollingDetector::new(
                manager,
                poll_interval,
                on_detected,
            )),
        }
    }

    pub fn kind(&self) -> DetectorKind {
        match self {
            ChangeDetector::EventBased(_) => DetectorKind::EventBased,
            ChangeDetector::Polling(_) => DetectorKind::Polling,
        }
    }

    pub fn start(&mut self) -> PlatformResult<()> {
        match self {
            ChangeDetector::EventBased(detector) => detector.start(),
            ChangeDetector::Polling(detector) => detector.start(),
        }
    }

    pub fn dispose(&mut self) {
        match self {
            ChangeDetector::EventBased(detector) => detector.dispose(),
            ChangeDetector::Polling(detector) => detector.dispose(),
        }
    }
}

impl Drop for ChangeDetector {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Forwards the current session on every sessions-changed notification.
pub struct EventDetector {
    manager: ManagerHandle,
    on_detected: DetectionCallback,
    token: Option<ListenerToken>,
}

impl EventDetector {
    pub fn new(manager: ManagerHandle, on_detected: DetectionCallback) -> Self {
        Self {
            manager,
            on_detected,
            token: None,
        }
    }

    pub fn start(&mut self) -> PlatformResult<()> {
        if self.token.is_some() {
            return Ok(());
        }
        // The handler lives inside the manager, so it must not keep it alive.
        let manager: Weak<dyn SessionManager> = Arc::downgrade(&self.manager);
        let on_detected = Arc::clone(&self.on_detected);
        let token = self.manager.on_sessions_changed(Arc::new(move || {
            if let Some(manager) = manager.upgrade() {
                forward_current(manager.as_ref(), &on_detected);
            }
        }))?;
        self.token = Some(token);
        info!("watching media sessions through change notifications");
        Ok(())
    }

    pub fn dispose(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(err) = self.manager.remove_sessions_changed(token) {
                warn!(error = %err, "failed to unsubscribe from session changes");
            }
        }
    }
}

/// Queries the registry on a fixed interval. The next wait only starts once
/// the previous tick has finished, so ticks never overlap.
pub struct PollingDetector {
    manager: ManagerHandle,
    on_detected: DetectionCallback,
    interval: Duration,
    stop: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl PollingDetector {
    pub fn new(manager: ManagerHandle, interval: Duration, on_detected: DetectionCallback) -> Self {
        Self {
            manager,
            on_detected,
            interval,
            stop: None,
            worker: None,
        }
    }

    pub fn start(&mut self) -> PlatformResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let manager = Arc::clone(&self.manager);
        let on_detected = Arc::clone(&self.on_detected);
        let interval = self.interval;

        let worker = thread::Builder::new()
            .name("media-session-poll".into())
            .spawn(move || {
                let _platform = platform::enter_thread();
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            forward_current(manager.as_ref(), &on_detected)
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("session polling stopped");
            })
            .map_err(|e| PlatformError::call("spawn poll thread", e))?;

        self.stop = Some(stop_tx);
        self.worker = Some(worker);
        info!(interval_ms = interval.as_millis() as u64, "polling for media session changes");
        Ok(())
    }

    pub fn dispose(&mut self) {
        // Dropping the sender ends the wait immediately.
        self.stop.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("session polling thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::MemoryRegistry;
    use std::{sync::Mutex, time::Instant};

    fn recording_callback() -> (DetectionCallback, Arc<Mutex<Vec<Option<String>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: DetectionCallback = Arc::new(move |session: Option<SessionHandle>| {
            let id = session.map(|s| s.source_app_id().unwrap());
            sink.lock().unwrap().push(id);
        });
        (callback, seen)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn auto_strategy_follows_host_version() {
        let win10 = HostVersion { major: 10, build: 19045 };
        let win11 = HostVersion { major: 10, build: 22621 };
        assert_eq!(DetectorStrategy::Auto.resolve(Some(win10)), DetectorKind::Polling);
        assert_eq!(DetectorStrategy::Auto.resolve(Some(win11)), DetectorKind::EventBased);
        assert_eq!(DetectorStrategy::Auto.resolve(None), DetectorKind::EventBased);
        assert_eq!(DetectorStrategy::Event.resolve(Some(win10)), DetectorKind::EventBased);
        assert_eq!(DetectorStrategy::Polling.resolve(Some(win11)), DetectorKind::Polling);
    }

    #[test]
    fn event_detector_forwards_on_notification_and_unsubscribes() {
        let registry = MemoryRegistry::new();
        let session = registry.create_session("spotify.exe");
        let (callback, seen) = recording_callback();
        let mut detector = ChangeDetector::new(
            DetectorKind::EventBased,
            registry.manager(),
            DEFAULT_POLL_INTERVAL,
            callback,
        );
        detector.start().unwrap();
        assert_eq!(registry.sessions_changed_listeners(), 1);

        registry.switch_to(Some(&session));
        registry.switch_to(None);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some("spotify.exe".to_string()), None]
        );

        detector.dispose();
        assert_eq!(registry.sessions_changed_listeners(), 0);
        registry.switch_to(Some(&session));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn event_detector_swallows_query_failures() {
        let registry = MemoryRegistry::new();
        let session = registry.create_session("vlc.exe");
        let (callback, seen) = recording_callback();
        let mut detector = ChangeDetector::new(
            DetectorKind::EventBased,
            registry.manager(),
            DEFAULT_POLL_INTERVAL,
            callback,
        );
        detector.start().unwrap();

        registry.fail_next_queries(1);
        registry.switch_to(Some(&session));
        registry.fire_sessions_changed();

        assert_eq!(*seen.lock().unwrap(), vec![Some("vlc.exe".to_string())]);
    }

    #[test]
    fn polling_detector_reports_every_tick() {
        let registry = MemoryRegistry::new();
        let session = registry.create_session("foobar2000.exe");
        registry.set_current(Some(&session));
        let (callback, seen) = recording_callback();
        let mut detector = ChangeDetector::new(
            DetectorKind::Polling,
            registry.manager(),
            Duration::from_millis(5),
            callback,
        );
        detector.start().unwrap();
        assert_eq!(detector.kind(), DetectorKind::Polling);

        wait_until(|| seen.lock().unwrap().len() >= 5);
        detector.dispose();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|id| id.as_deref() == Some("foobar2000.exe")));
    }

    #[test]
    fn polling_survives_failed_queries() {
        let registry = MemoryRegistry::new();
        registry.fail_next_queries(3);
        let (callback, seen) = recording_callback();
        let mut detector = ChangeDetector::new(
            DetectorKind::Polling,
            registry.manager(),
            Duration::from_millis(5),
            callback,
        );
        detector.start().unwrap();

        wait_until(|| seen.lock().unwrap().len() >= 2);
        detector.dispose();
        assert!(registry.query_count() >= 5);
    }

    #[test]
    fn disposed_polling_detector_stops_querying() {
        let registry = MemoryRegistry::new();
        let (callback, _seen) = recording_callback();
        let mut detector = ChangeDetector::new(
            DetectorKind::Polling,
            registry.manager(),
            Duration::from_millis(5),
            callback,
        );
        detector.start().unwrap();
        wait_until(|| registry.query_count() >= 1);

        detector.dispose();
        let after_dispose = registry.query_count();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.query_count(), after_dispose);

        // Disposing twice is harmless.
        detector.dispose();
    }
}
