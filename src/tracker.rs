//! Tracks the OS "current" media session and republishes its state.
//!
//! All state changes happen on one control thread. Detector callbacks and
//! per-session listeners run on whatever thread the platform uses; they only
//! queue a [`Control`] message. Metadata fetches are local tasks on the same
//! thread and are checked against the tracked session when they complete,
//! so a slow fetch can never overwrite a newer session's state.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    executor::{LocalPool, LocalSpawner},
    task::LocalSpawnExt,
    StreamExt,
};
use tracing::{debug, info, trace, warn};

use crate::{
    detector::{
        ChangeDetector, DetectionCallback, DetectorKind, DetectorStrategy, DEFAULT_POLL_INTERVAL,
    },
    error::{PlatformResult, TrackerError},
    model::{MediaProperties, PlaybackInfo, TransportCommand, TransportGlyph},
    observers::{EventHub, SubscriptionId},
    platform::{self, ListenerToken, ManagerHandle, SessionHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerOptions {
    pub strategy: DetectorStrategy,
    pub poll_interval: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            strategy: DetectorStrategy::Auto,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Payload of the session-changed stream.
#[derive(Clone)]
pub struct SessionChanged {
    pub manager: ManagerHandle,
    pub previous: Option<String>,
    pub current: Option<String>,
}

impl fmt::Debug for SessionChanged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionChanged")
            .field("previous", &self.previous)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

/// Consistent view of everything the tracker knows, taken under one lock.
#[derive(Clone, Debug, Default)]
pub struct TrackerSnapshot {
    pub source_app_id: Option<String>,
    pub playback: Option<PlaybackInfo>,
    pub properties: Option<MediaProperties>,
}

impl TrackerSnapshot {
    pub fn is_playing(&self) -> bool {
        self.playback.as_ref().is_some_and(PlaybackInfo::is_playing)
    }

    pub fn glyph(&self) -> TransportGlyph {
        TransportGlyph::for_state(self.source_app_id.is_some(), self.is_playing())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    SessionChanged,
    PlaybackInfoChanged,
    MediaPropertiesChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    stream: Stream,
    id: SubscriptionId,
}

impl Subscription {
    pub fn stream(&self) -> Stream {
        self.stream
    }
}

/// Which tracked session a notification or fetch belongs to. The epoch
/// changes on every transition, so A -> B -> A yields three distinct keys.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionKey {
    source_app_id: String,
    epoch: u64,
}

#[derive(Clone)]
struct TrackedSession {
    key: SessionKey,
    handle: SessionHandle,
}

#[derive(Clone, Default)]
struct TrackedState {
    session: Option<TrackedSession>,
    playback: Option<PlaybackInfo>,
    properties: Option<MediaProperties>,
}

impl TrackedState {
    fn is_current(&self, key: &SessionKey) -> bool {
        self.session.as_ref().is_some_and(|tracked| tracked.key == *key)
    }

    fn current(&self, key: &SessionKey) -> Option<TrackedSession> {
        self.session
            .as_ref()
            .filter(|tracked| tracked.key == *key)
            .cloned()
    }
}

struct Shared {
    manager: ManagerHandle,
    state: RwLock<TrackedState>,
    disposed: AtomicBool,
    session_changed: EventHub<SessionChanged>,
    playback_info_changed: EventHub<PlaybackInfo>,
    media_properties_changed: EventHub<()>,
}

impl Shared {
    fn new(manager: ManagerHandle) -> Self {
        Self {
            manager,
            state: RwLock::new(TrackedState::default()),
            disposed: AtomicBool::new(false),
            session_changed: EventHub::new(),
            playback_info_changed: EventHub::new(),
            media_properties_changed: EventHub::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackedState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackedState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

enum Control {
    Detected(Option<SessionHandle>),
    PlaybackInfoChanged(SessionKey),
    MediaPropertiesChanged(SessionKey),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Listener registrations on the current session, removed on drop.
struct Attachment {
    session: SessionHandle,
    source_app_id: String,
    playback: ListenerToken,
    properties: ListenerToken,
}

impl Attachment {
    fn attach(tracked: &TrackedSession, control: &UnboundedSender<Control>) -> PlatformResult<Self> {
        let session = Arc::clone(&tracked.handle);

        let (tx, key) = (control.clone(), tracked.key.clone());
        let playback = session.on_playback_info_changed(Arc::new(move || {
            let _ = tx.unbounded_send(Control::PlaybackInfoChanged(key.clone()));
        }))?;

        let (tx, key) = (control.clone(), tracked.key.clone());
        let properties = match session.on_media_properties_changed(Arc::new(move || {
            let _ = tx.unbounded_send(Control::MediaPropertiesChanged(key.clone()));
        })) {
            Ok(token) => token,
            Err(err) => {
                if let Err(undo) = session.remove_playback_info_changed(playback) {
                    warn!(error = %undo, "failed to roll back playback listener");
                }
                return Err(err);
            }
        };

        debug!(source = %tracked.key.source_app_id, "attached session listeners");
        Ok(Self {
            session,
            source_app_id: tracked.key.source_app_id.clone(),
            playback,
            properties,
        })
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if let Err(err) = self.session.remove_playback_info_changed(self.playback) {
            warn!(source = %self.source_app_id, error = %err, "failed to detach playback listener");
        }
        if let Err(err) = self.session.remove_media_properties_changed(self.properties) {
            warn!(source = %self.source_app_id, error = %err, "failed to detach properties listener");
        }
        debug!(source = %self.source_app_id, "detached session listeners");
    }
}

fn apply_media_properties(
    shared: &Shared,
    key: &SessionKey,
    result: PlatformResult<MediaProperties>,
) {
    if shared.is_disposed() {
        return;
    }
    let properties = match result {
        Ok(properties) => properties,
        Err(err) => {
            warn!(source = %key.source_app_id, error = %err, "failed to fetch media properties");
            return;
        }
    };
    {
        let mut state = shared.write();
        if !state.is_current(key) {
            debug!(source = %key.source_app_id, "discarding media properties of a replaced session");
            return;
        }
        state.properties = Some(properties);
    }
    shared.media_properties_changed.emit(&());
}

/// State owned by the control thread.
struct Engine {
    shared: Arc<Shared>,
    control: UnboundedSender<Control>,
    spawner: LocalSpawner,
    options: TrackerOptions,
    last_source_app_id: Option<String>,
    epoch: u64,
    attachment: Option<Attachment>,
    detector: Option<ChangeDetector>,
}

impl Engine {
    async fn run(
        mut self,
        mut inbox: UnboundedReceiver<Control>,
        ready: oneshot::Sender<DetectorKind>,
    ) {
        let kind = self.initialize();
        if ready.send(kind).is_err() {
            self.teardown();
            return;
        }

        while let Some(message) = inbox.next().await {
            match message {
                Control::Detected(session) => self.on_detected(session),
                Control::PlaybackInfoChanged(key) => self.on_playback_info_changed(&key),
                Control::MediaPropertiesChanged(key) => self.on_media_properties_changed(&key),
                Control::Flush(done) => self.spawn(async move {
                    // Runs after every fetch that is already able to finish.
                    let _ = done.send(());
                }),
                Control::Shutdown => break,
            }
        }
        self.teardown();
    }

    fn initialize(&mut self) -> DetectorKind {
        match self.shared.manager.current_session() {
            Ok(session) => self.on_detected(session),
            Err(err) => warn!(error = %err, "failed to read the initial media session"),
        }

        let host = platform::host_version();
        let kind = self.options.strategy.resolve(host);
        info!(?host, ?kind, "selected session change detector");
        self.start_detector(kind)
    }

    fn start_detector(&mut self, kind: DetectorKind) -> DetectorKind {
        let mut detector = ChangeDetector::new(
            kind,
            Arc::clone(&self.shared.manager),
            self.options.poll_interval,
            self.detection_callback(),
        );
        if let Err(err) = detector.start() {
            if kind == DetectorKind::EventBased {
                warn!(error = %err, "session change notifications unavailable, falling back to polling");
                return self.start_detector(DetectorKind::Polling);
            }
            warn!(error = %err, "failed to start session polling");
        }
        self.detector = Some(detector);
        kind
    }

    fn detection_callback(&self) -> DetectionCallback {
        let control = self.control.clone();
        Arc::new(move |session| {
            let _ = control.unbounded_send(Control::Detected(session));
        })
    }

    fn on_detected(&mut self, candidate: Option<SessionHandle>) {
        if self.shared.is_disposed() {
            return;
        }
        let next = match candidate {
            Some(handle) => match handle.source_app_id() {
                Ok(source_app_id) => Some((handle, source_app_id)),
                Err(err) => {
                    warn!(error = %err, "failed to identify the current media session");
                    return;
                }
            },
            None => None,
        };

        let next_id = next.as_ref().map(|(_, id)| id);
        if next_id == self.last_source_app_id.as_ref() {
            trace!(source = ?next_id, "current media session unchanged");
            return;
        }
        info!(from = ?self.last_source_app_id, to = ?next_id, "media session changed");
        self.transition(next);
    }

    fn transition(&mut self, next: Option<(SessionHandle, String)>) {
        // Nothing may reach the outgoing session once this returns.
        self.attachment = None;

        self.epoch += 1;
        let epoch = self.epoch;
        let tracked = next.map(|(handle, source_app_id)| TrackedSession {
            key: SessionKey {
                source_app_id,
                epoch,
            },
            handle,
        });
        let playback = tracked
            .as_ref()
            .and_then(|tracked| match tracked.handle.playback_info() {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(source = %tracked.key.source_app_id, error = %err, "failed to read playback info");
                    None
                }
            });

        let current = tracked.as_ref().map(|t| t.key.source_app_id.clone());
        let previous = std::mem::replace(&mut self.last_source_app_id, current.clone());
        *self.shared.write() = TrackedState {
            session: tracked.clone(),
            playback,
            properties: None,
        };

        if let Some(tracked) = &tracked {
            match Attachment::attach(tracked, &self.control) {
                Ok(attachment) => self.attachment = Some(attachment),
                Err(err) => {
                    warn!(source = %tracked.key.source_app_id, error = %err, "failed to attach session listeners")
                }
            }
        }

        self.shared.session_changed.emit(&SessionChanged {
            manager: Arc::clone(&self.shared.manager),
            previous,
            current,
        });
        self.shared.media_properties_changed.emit(&());

        if let Some(tracked) = tracked {
            self.fetch_media_properties(tracked);
        }
    }

    fn on_playback_info_changed(&mut self, key: &SessionKey) {
        if self.shared.is_disposed() {
            return;
        }
        let tracked = self.shared.read().current(key);
        let Some(tracked) = tracked else {
            trace!(source = %key.source_app_id, "ignoring playback change of a replaced session");
            return;
        };

        match tracked.handle.playback_info() {
            Ok(info) => {
                self.shared.write().playback = Some(info.clone());
                self.shared.playback_info_changed.emit(&info);
            }
            Err(err) => {
                warn!(source = %key.source_app_id, error = %err, "failed to read playback info")
            }
        }
    }

    fn on_media_properties_changed(&mut self, key: &SessionKey) {
        if self.shared.is_disposed() {
            return;
        }
        let tracked = self.shared.read().current(key);
        match tracked {
            Some(tracked) => self.fetch_media_properties(tracked),
            None => {
                trace!(source = %key.source_app_id, "ignoring properties change of a replaced session")
            }
        }
    }

    fn fetch_media_properties(&self, tracked: TrackedSession) {
        let fetch = tracked.handle.media_properties();
        let shared = Arc::clone(&self.shared);
        let key = tracked.key;
        self.spawn(async move {
            let result = fetch.await;
            apply_media_properties(&shared, &key, result);
        });
    }

    fn spawn(&self, task: impl Future<Output = ()> + 'static) {
        if let Err(err) = self.spawner.spawn_local(task) {
            warn!(error = %err, "failed to schedule a tracker task");
        }
    }

    fn teardown(&mut self) {
        if let Some(mut detector) = self.detector.take() {
            detector.dispose();
        }
        self.attachment = None;
        *self.shared.write() = TrackedState::default();
        debug!("media session tracker stopped");
    }
}

/// Single source of truth for the current media session, its playback info
/// and its metadata.
pub struct MediaSessionTracker {
    shared: Arc<Shared>,
    control: UnboundedSender<Control>,
    worker: Mutex<Option<JoinHandle<()>>>,
    detector_kind: DetectorKind,
}

impl MediaSessionTracker {
    /// Acquire the session registry and start tracking.
    ///
    /// Failing to acquire the registry is the only error: the caller should
    /// treat it as fatal. Once this returns the initial session, playback info
    /// and listeners are in place and the change detector is running.
    pub async fn initialize<F>(acquire: F, options: TrackerOptions) -> Result<Self, TrackerError>
    where
        F: Future<Output = PlatformResult<ManagerHandle>>,
    {
        let manager = acquire.await.map_err(TrackerError::Acquire)?;
        Self::start(manager, options).await
    }

    /// Start tracking with an already acquired registry.
    pub async fn start(manager: ManagerHandle, options: TrackerOptions) -> Result<Self, TrackerError> {
        let shared = Arc::new(Shared::new(manager));
        let (control_tx, control_rx) = mpsc::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();

        let engine_shared = Arc::clone(&shared);
        let engine_control = control_tx.clone();
        let worker = thread::Builder::new()
            .name("media-session-tracker".into())
            .spawn(move || {
                let _platform = platform::enter_thread();
                let mut pool = LocalPool::new();
                let engine = Engine {
                    shared: engine_shared,
                    control: engine_control,
                    spawner: pool.spawner(),
                    options,
                    last_source_app_id: None,
                    epoch: 0,
                    attachment: None,
                    detector: None,
                };
                pool.run_until(engine.run(control_rx, ready_tx));
            })
            .map_err(TrackerError::Spawn)?;

        let detector_kind = match ready_rx.await {
            Ok(kind) => kind,
            Err(_) => {
                if worker.join().is_err() {
                    warn!("media session tracker thread panicked during startup");
                }
                return Err(TrackerError::InitAborted);
            }
        };

        Ok(Self {
            shared,
            control: control_tx,
            worker: Mutex::new(Some(worker)),
            detector_kind,
        })
    }

    pub fn manager(&self) -> ManagerHandle {
        Arc::clone(&self.shared.manager)
    }

    pub fn detector_kind(&self) -> DetectorKind {
        self.detector_kind
    }

    pub fn current_session(&self) -> Option<SessionHandle> {
        self.shared
            .read()
            .session
            .as_ref()
            .map(|tracked| Arc::clone(&tracked.handle))
    }

    pub fn current_source_app_id(&self) -> Option<String> {
        self.shared
            .read()
            .session
            .as_ref()
            .map(|tracked| tracked.key.source_app_id.clone())
    }

    pub fn current_playback_info(&self) -> Option<PlaybackInfo> {
        self.shared.read().playback.clone()
    }

    pub fn current_media_properties(&self) -> Option<MediaProperties> {
        self.shared.read().properties.clone()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.shared.read();
        TrackerSnapshot {
            source_app_id: state
                .session
                .as_ref()
                .map(|tracked| tracked.key.source_app_id.clone()),
            playback: state.playback.clone(),
            properties: state.properties.clone(),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.shared
            .read()
            .playback
            .as_ref()
            .is_some_and(PlaybackInfo::is_playing)
    }

    pub fn glyph(&self) -> TransportGlyph {
        self.snapshot().glyph()
    }

    /// Handlers run on the tracker's control thread and must not block on
    /// [`MediaSessionTracker::flush`].
    pub fn on_session_changed<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionChanged) + Send + Sync + 'static,
    {
        Subscription {
            stream: Stream::SessionChanged,
            id: self.shared.session_changed.subscribe(handler),
        }
    }

    pub fn on_playback_info_changed<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PlaybackInfo) + Send + Sync + 'static,
    {
        Subscription {
            stream: Stream::PlaybackInfoChanged,
            id: self.shared.playback_info_changed.subscribe(handler),
        }
    }

    /// Signal only: read [`MediaSessionTracker::current_media_properties`]
    /// when it fires.
    pub fn on_media_properties_changed<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        Subscription {
            stream: Stream::MediaPropertiesChanged,
            id: self.shared.media_properties_changed.subscribe(move |_| handler()),
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        match subscription.stream {
            Stream::SessionChanged => self.shared.session_changed.unsubscribe(subscription.id),
            Stream::PlaybackInfoChanged => {
                self.shared.playback_info_changed.unsubscribe(subscription.id)
            }
            Stream::MediaPropertiesChanged => {
                self.shared.media_properties_changed.unsubscribe(subscription.id)
            }
        }
    }

    pub async fn toggle_play_pause(&self) {
        self.transport(TransportCommand::TogglePlayPause).await
    }

    pub async fn skip_next(&self) {
        self.transport(TransportCommand::SkipNext).await
    }

    pub async fn skip_previous(&self) {
        self.transport(TransportCommand::SkipPrevious).await
    }

    async fn transport(&self, command: TransportCommand) {
        if self.is_disposed() {
            return;
        }
        let Some(session) = self.current_session() else {
            debug!(command = command.as_str(), "no media session, ignoring command");
            return;
        };
        match session.send(command).await {
            Ok(true) => debug!(command = command.as_str(), "transport command accepted"),
            Ok(false) => warn!(command = command.as_str(), "media session rejected the command"),
            Err(err) => warn!(command = command.as_str(), error = %err, "transport command failed"),
        }
    }

    /// Wait until every notification queued before this call has been
    /// applied and emitted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.control.unbounded_send(Control::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Detach all listeners and stop the change detector. Safe to call more
    /// than once and from inside an observer callback.
    pub fn dispose(&self) {
        let first = !self.shared.disposed.swap(true, Ordering::SeqCst);
        if first {
            let _ = self.control.unbounded_send(Control::Shutdown);
            self.shared.session_changed.clear();
            self.shared.playback_info_changed.clear();
            self.shared.media_properties_changed.clear();
        }

        let mut worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // On the control thread itself (an observer disposing) the thread
        // winds down after the current message; a later call joins it.
        let on_control_thread = worker
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id());
        if !on_control_thread {
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    warn!("media session tracker thread panicked");
                }
            }
        }

        if first {
            info!("media session tracker disposed");
        }
    }
}

impl Drop for MediaSessionTracker {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{MediaProperties, PlaybackStatus},
        platform::memory::MemoryRegistry,
    };
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;

    const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

    fn event_options() -> TrackerOptions {
        TrackerOptions {
            strategy: DetectorStrategy::Event,
            ..TrackerOptions::default()
        }
    }

    fn start(registry: &MemoryRegistry) -> MediaSessionTracker {
        block_on(MediaSessionTracker::start(registry.manager(), event_options())).unwrap()
    }

    #[test]
    fn fetch_for_an_earlier_visit_of_the_same_source_is_discarded() {
        let registry = MemoryRegistry::new();
        let a = registry.create_session("a.exe");
        let b = registry.create_session("b.exe");
        a.set_properties(MediaProperties::new("A old", "x"));
        registry.set_current(Some(&a));
        let stale = a.hold_next_fetch();
        let tracker = start(&registry);

        registry.switch_to(Some(&b));
        a.set_properties(MediaProperties::new("A new", "x"));
        registry.switch_to(Some(&a));
        block_on(tracker.flush());
        assert_eq!(tracker.current_media_properties().unwrap().title, "A new");

        // Same source id, earlier epoch: still stale.
        assert!(stale.release(RELEASE_TIMEOUT));
        block_on(tracker.flush());
        assert_eq!(tracker.current_media_properties().unwrap().title, "A new");
    }

    #[test]
    fn notifications_from_a_detached_session_are_ignored() {
        let registry = MemoryRegistry::new();
        let a = registry.create_session("a.exe");
        let b = registry.create_session("b.exe");
        registry.set_current(Some(&a));
        let tracker = start(&registry);
        let playback_events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&playback_events);
        tracker.on_playback_info_changed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.switch_to(Some(&b));
        block_on(tracker.flush());
        a.set_status(PlaybackStatus::Playing);
        block_on(tracker.flush());

        assert_eq!(playback_events.load(Ordering::SeqCst), 0);
        assert_eq!(a.listener_counts(), (0, 0));
        assert_eq!(b.listener_counts(), (1, 1));
    }

    #[test]
    fn dispose_from_inside_an_observer_does_not_deadlock() {
        let registry = MemoryRegistry::new();
        let a = registry.create_session("a.exe");
        let tracker = Arc::new(start(&registry));
        let inner = Arc::clone(&tracker);
        tracker.on_session_changed(move |_| inner.dispose());

        registry.switch_to(Some(&a));
        block_on(tracker.flush());

        assert!(tracker.is_disposed());
        tracker.dispose();
        assert_eq!(registry.sessions_changed_listeners(), 0);
    }

    #[test]
    fn snapshot_reflects_a_single_consistent_state() {
        let registry = MemoryRegistry::new();
        let a = registry.create_session("a.exe");
        a.set_status(PlaybackStatus::Playing);
        a.set_properties(MediaProperties::new("Song", "Band"));
        registry.set_current(Some(&a));
        let tracker = start(&registry);
        block_on(tracker.flush());

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.source_app_id.as_deref(), Some("a.exe"));
        assert!(snapshot.is_playing());
        assert_eq!(snapshot.glyph(), TransportGlyph::Pause);
        assert_eq!(snapshot.properties.unwrap().title, "Song");
    }
}
