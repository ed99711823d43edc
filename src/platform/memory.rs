//! In-process media-session registry.
//!
//! Behaves like the OS service from the tracker's point of view: every
//! `current_session` query hands out a fresh handle, notifications are
//! delivered synchronously on the thread that caused them, and transport
//! commands change the session's playback state. Drives the headless runs
//! and the test-suite.

use std::{
    collections::BTreeMap,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use futures::{
    channel::oneshot,
    future::{self, BoxFuture},
    FutureExt,
};

use crate::{
    error::{PlatformError, PlatformResult},
    model::{MediaProperties, PlaybackInfo, PlaybackStatus, Thumbnail, TransportCommand},
    platform::{
        Callback, ListenerToken, MediaSession, SessionHandle, SessionManager, ThumbnailSource,
    },
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Listeners {
    next_token: i64,
    handlers: BTreeMap<i64, Callback>,
}

impl Listeners {
    fn add(&mut self, handler: Callback) -> ListenerToken {
        self.next_token += 1;
        self.handlers.insert(self.next_token, handler);
        ListenerToken(self.next_token)
    }

    fn remove(&mut self, token: ListenerToken) -> bool {
        self.handlers.remove(&token.0).is_some()
    }

    fn snapshot(&self) -> Vec<Callback> {
        self.handlers.values().cloned().collect()
    }
}

fn fire(handlers: Vec<Callback>) {
    for handler in handlers {
        handler();
    }
}

#[derive(Default)]
struct RegistryState {
    current: Option<MemorySession>,
    sessions_changed: Listeners,
    failing_queries: usize,
    queries: usize,
    refuse_subscriptions: bool,
}

#[derive(Default)]
struct RegistryShared {
    state: Mutex<RegistryState>,
    journal: Mutex<Vec<String>>,
}

/// Handle to the registry. Clones share the same registry.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    shared: Arc<RegistryShared>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manager(&self) -> Arc<dyn SessionManager> {
        Arc::new(self.clone())
    }

    /// Create a session that belongs to this registry. It is not current
    /// until passed to [`MemoryRegistry::switch_to`] or [`MemoryRegistry::set_current`].
    pub fn create_session(&self, source_app_id: &str) -> MemorySession {
        MemorySession {
            inner: Arc::new(SessionInner {
                source_app_id: source_app_id.to_string(),
                registry: Arc::clone(&self.shared),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Change the current session without notifying anyone, the way the
    /// older platforms do.
    pub fn set_current(&self, session: Option<&MemorySession>) {
        lock(&self.shared.state).current = session.cloned();
    }

    /// Change the current session and raise sessions-changed.
    pub fn switch_to(&self, session: Option<&MemorySession>) {
        self.set_current(session);
        self.fire_sessions_changed();
    }

    pub fn fire_sessions_changed(&self) {
        let handlers = lock(&self.shared.state).sessions_changed.snapshot();
        fire(handlers);
    }

    /// Make the next `count` current-session queries fail.
    pub fn fail_next_queries(&self, count: usize) {
        lock(&self.shared.state).failing_queries = count;
    }

    /// Make sessions-changed subscriptions fail, as on hosts without
    /// working notifications.
    pub fn fail_sessions_changed_subscription(&self, fail: bool) {
        lock(&self.shared.state).refuse_subscriptions = fail;
    }

    /// Number of current-session queries answered or failed so far.
    pub fn query_count(&self) -> usize {
        lock(&self.shared.state).queries
    }

    pub fn sessions_changed_listeners(&self) -> usize {
        lock(&self.shared.state).sessions_changed.handlers.len()
    }

    /// Append an entry to the shared journal of attach/detach operations.
    pub fn note(&self, entry: impl Into<String>) {
        lock(&self.shared.journal).push(entry.into());
    }

    pub fn journal(&self) -> Vec<String> {
        lock(&self.shared.journal).clone()
    }
}

impl SessionManager for MemoryRegistry {
    fn current_session(&self) -> PlatformResult<Option<SessionHandle>> {
        let mut state = lock(&self.shared.state);
        state.queries += 1;
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(PlatformError::call("GetCurrentSession", "injected failure"));
        }
        Ok(state
            .current
            .clone()
            .map(|session| Arc::new(session) as SessionHandle))
    }

    fn on_sessions_changed(&self, handler: Callback) -> PlatformResult<ListenerToken> {
        let mut state = lock(&self.shared.state);
        if state.refuse_subscriptions {
            return Err(PlatformError::call("SessionsChanged", "injected failure"));
        }
        Ok(state.sessions_changed.add(handler))
    }

    fn remove_sessions_changed(&self, token: ListenerToken) -> PlatformResult<()> {
        lock(&self.shared.state).sessions_changed.remove(token);
        Ok(())
    }
}

#[derive(Default)]
struct SessionState {
    playback: PlaybackInfo,
    properties: MediaProperties,
    playback_listeners: Listeners,
    properties_listeners: Listeners,
    held_fetches: Vec<HeldFetch>,
    commands: Vec<TransportCommand>,
    fail_commands: bool,
}

struct HeldFetch {
    release: oneshot::Receiver<()>,
    delivered: mpsc::Sender<()>,
}

struct SessionInner {
    source_app_id: String,
    registry: Arc<RegistryShared>,
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn note(&self, action: &str) {
        lock(&self.registry.journal).push(format!("{action}:{}", self.source_app_id));
    }
}

/// A session owned by a [`MemoryRegistry`]. Clones refer to the same session.
#[derive(Clone)]
pub struct MemorySession {
    inner: Arc<SessionInner>,
}

impl MemorySession {
    pub fn id(&self) -> &str {
        &self.inner.source_app_id
    }

    /// Update the playback status and raise playback-info-changed.
    pub fn set_status(&self, status: PlaybackStatus) {
        let handlers = {
            let mut state = lock(&self.inner.state);
            state.playback.status = status;
            state.playback_listeners.snapshot()
        };
        fire(handlers);
    }

    /// Update the track metadata and raise media-properties-changed.
    pub fn set_properties(&self, properties: MediaProperties) {
        let handlers = {
            let mut state = lock(&self.inner.state);
            state.properties = properties;
            state.properties_listeners.snapshot()
        };
        fire(handlers);
    }

    /// Hold the next metadata fetch until the returned gate is released.
    pub fn hold_next_fetch(&self) -> FetchGate {
        let (release_tx, release_rx) = oneshot::channel();
        let (delivered_tx, delivered_rx) = mpsc::channel();
        lock(&self.inner.state).held_fetches.push(HeldFetch {
            release: release_rx,
            delivered: delivered_tx,
        });
        FetchGate {
            release: Some(release_tx),
            delivered: delivered_rx,
        }
    }

    pub fn fail_commands(&self, fail: bool) {
        lock(&self.inner.state).fail_commands = fail;
    }

    pub fn commands(&self) -> Vec<TransportCommand> {
        lock(&self.inner.state).commands.clone()
    }

    /// Registered (playback, properties) listeners.
    pub fn listener_counts(&self) -> (usize, usize) {
        let state = lock(&self.inner.state);
        (
            state.playback_listeners.handlers.len(),
            state.properties_listeners.handlers.len(),
        )
    }
}

impl MediaSession for MemorySession {
    fn source_app_id(&self) -> PlatformResult<String> {
        Ok(self.inner.source_app_id.clone())
    }

    fn playback_info(&self) -> PlatformResult<PlaybackInfo> {
        Ok(lock(&self.inner.state).playback.clone())
    }

    fn media_properties(&self) -> BoxFuture<'static, PlatformResult<MediaProperties>> {
        let inner = &self.inner;
        let held = {
            let mut state = lock(&inner.state);
            if state.held_fetches.is_empty() {
                None
            } else {
                Some(state.held_fetches.remove(0))
            }
        };

        // The result reflects the session at request time, however late it
        // is delivered.
        let properties = lock(&inner.state).properties.clone();

        async move {
            if let Some(held) = held {
                held.release
                    .await
                    .map_err(|_| PlatformError::call("TryGetMediaPropertiesAsync", "abandoned"))?;
                let _ = held.delivered.send(());
            }
            Ok(properties)
        }
        .boxed()
    }

    fn on_playback_info_changed(&self, handler: Callback) -> PlatformResult<ListenerToken> {
        self.inner.note("attach-playback");
        Ok(lock(&self.inner.state).playback_listeners.add(handler))
    }

    fn remove_playback_info_changed(&self, token: ListenerToken) -> PlatformResult<()> {
        self.inner.note("detach-playback");
        lock(&self.inner.state).playback_listeners.remove(token);
        Ok(())
    }

    fn on_media_properties_changed(&self, handler: Callback) -> PlatformResult<ListenerToken> {
        self.inner.note("attach-properties");
        Ok(lock(&self.inner.state).properties_listeners.add(handler))
    }

    fn remove_media_properties_changed(&self, token: ListenerToken) -> PlatformResult<()> {
        self.inner.note("detach-properties");
        lock(&self.inner.state).properties_listeners.remove(token);
        Ok(())
    }

    fn send(&self, command: TransportCommand) -> BoxFuture<'static, PlatformResult<bool>> {
        let inner = Arc::clone(&self.inner);
        async move {
            let handlers = {
                let mut state = lock(&inner.state);
                if state.fail_commands {
                    return Err(PlatformError::call(command.as_str(), "injected failure"));
                }
                state.commands.push(command);
                match command {
                    TransportCommand::TogglePlayPause => {
                        state.playback.status = match state.playback.status {
                            PlaybackStatus::Playing => PlaybackStatus::Paused,
                            _ => PlaybackStatus::Playing,
                        };
                        state.playback_listeners.snapshot()
                    }
                    TransportCommand::SkipNext | TransportCommand::SkipPrevious => Vec::new(),
                }
            };
            fire(handlers);
            Ok(true)
        }
        .boxed()
    }
}

/// Artwork kept in memory.
pub struct MemoryThumbnail {
    bytes: Vec<u8>,
}

impl MemoryThumbnail {
    pub fn thumbnail(bytes: impl Into<Vec<u8>>) -> Thumbnail {
        Thumbnail::new(Arc::new(MemoryThumbnail {
            bytes: bytes.into(),
        }))
    }
}

impl ThumbnailSource for MemoryThumbnail {
    fn read(&self) -> BoxFuture<'static, PlatformResult<Vec<u8>>> {
        future::ready(Ok(self.bytes.clone())).boxed()
    }
}

/// Releases a fetch held by [`MemorySession::hold_next_fetch`].
pub struct FetchGate {
    release: Option<oneshot::Sender<()>>,
    delivered: mpsc::Receiver<()>,
}

impl FetchGate {
    /// Let the fetch complete and wait until its result has been handed to
    /// the caller. Returns `false` if nobody was waiting for it any more.
    pub fn release(mut self, timeout: Duration) -> bool {
        let Some(release) = self.release.take() else {
            return false;
        };
        if release.send(()).is_err() {
            return false;
        }
        match self.delivered.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_query_returns_a_fresh_handle_for_the_same_session() {
        let registry = MemoryRegistry::new();
        let session = registry.create_session("player.exe");
        registry.set_current(Some(&session));

        let first = registry.current_session().unwrap().unwrap();
        let second = registry.current_session().unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.source_app_id().unwrap(), second.source_app_id().unwrap());
        assert_eq!(registry.query_count(), 2);
    }

    #[test]
    fn injected_query_failures_run_out() {
        let registry = MemoryRegistry::new();
        registry.fail_next_queries(2);
        assert!(registry.current_session().is_err());
        assert!(registry.current_session().is_err());
        assert!(registry.current_session().unwrap().is_none());
    }

    #[test]
    fn switch_to_notifies_listeners_until_removed() {
        let registry = MemoryRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let token = registry
            .on_sessions_changed(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        registry.switch_to(None);
        registry.remove_sessions_changed(token).unwrap();
        registry.switch_to(None);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.sessions_changed_listeners(), 0);
    }

    #[test]
    fn toggle_flips_between_playing_and_paused() {
        let registry = MemoryRegistry::new();
        let session = registry.create_session("player.exe");
        session.set_status(PlaybackStatus::Paused);

        assert!(block_on(session.send(TransportCommand::TogglePlayPause)).unwrap());
        assert_eq!(session.playback_info().unwrap().status, PlaybackStatus::Playing);
        assert!(block_on(session.send(TransportCommand::TogglePlayPause)).unwrap());
        assert_eq!(session.playback_info().unwrap().status, PlaybackStatus::Paused);
    }

    #[test]
    fn held_fetch_resolves_after_release() {
        let registry = MemoryRegistry::new();
        let session = registry.create_session("player.exe");
        session.set_properties(MediaProperties::new("Track", "Artist"));
        let gate = session.hold_next_fetch();
        let fetch = session.media_properties();

        let waiter = std::thread::spawn(move || block_on(fetch));
        assert!(gate.release(Duration::from_secs(5)));
        let properties = waiter.join().unwrap().unwrap();
        assert_eq!(properties.title, "Track");
    }

    #[test]
    fn refused_subscriptions_register_nothing() {
        let registry = MemoryRegistry::new();
        registry.fail_sessions_changed_subscription(true);
        assert!(registry.on_sessions_changed(Arc::new(|| {})).is_err());
        assert_eq!(registry.sessions_changed_listeners(), 0);

        registry.fail_sessions_changed_subscription(false);
        assert!(registry.on_sessions_changed(Arc::new(|| {})).is_ok());
    }

    #[test]
    fn memory_thumbnail_reads_back_its_bytes() {
        let thumbnail = MemoryThumbnail::thumbnail(vec![0x89, b'P', b'N', b'G']);
        assert_eq!(block_on(thumbnail.read()).unwrap(), vec![0x89, b'P', b'N', b'G']);
        // Reads are repeatable.
        assert_eq!(block_on(thumbnail.read()).unwrap().len(), 4);
    }
}
