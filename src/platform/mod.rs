//! Seam between the tracker and the OS media-session service.
//!
//! The tracker only talks to [`SessionManager`] and [`MediaSession`]. The
//! Windows backend wraps the Global System Media Transport Controls API;
//! [`memory`] provides an in-process registry for headless runs and tests.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{
    error::PlatformResult,
    model::{MediaProperties, PlaybackInfo, TransportCommand},
};

pub mod memory;
#[cfg(target_os = "windows")]
pub mod windows;

/// Notification handler registered with the platform. May run on any thread.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Registration returned by the `on_*` methods, handed back to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(pub i64);

pub type SessionHandle = Arc<dyn MediaSession>;
pub type ManagerHandle = Arc<dyn SessionManager>;

/// Process-wide registry of media sessions.
pub trait SessionManager: Send + Sync {
    /// The session the OS currently considers "current", if any.
    fn current_session(&self) -> PlatformResult<Option<SessionHandle>>;

    fn on_sessions_changed(&self, handler: Callback) -> PlatformResult<ListenerToken>;

    fn remove_sessions_changed(&self, token: ListenerToken) -> PlatformResult<()>;
}

/// One application's media playback channel.
///
/// Two handles for the same logical session compare equal only through
/// [`MediaSession::source_app_id`]; the registry is free to hand out a new
/// handle on every query.
pub trait MediaSession: Send + Sync {
    fn source_app_id(&self) -> PlatformResult<String>;

    fn playback_info(&self) -> PlatformResult<PlaybackInfo>;

    fn media_properties(&self) -> BoxFuture<'static, PlatformResult<MediaProperties>>;

    fn on_playback_info_changed(&self, handler: Callback) -> PlatformResult<ListenerToken>;

    fn remove_playback_info_changed(&self, token: ListenerToken) -> PlatformResult<()>;

    fn on_media_properties_changed(&self, handler: Callback) -> PlatformResult<ListenerToken>;

    fn remove_media_properties_changed(&self, token: ListenerToken) -> PlatformResult<()>;

    /// Issue a transport command. `Ok(false)` means the source refused it.
    fn send(&self, command: TransportCommand) -> BoxFuture<'static, PlatformResult<bool>>;
}

pub trait ThumbnailSource: Send + Sync {
    fn read(&self) -> BoxFuture<'static, PlatformResult<Vec<u8>>>;
}

/// OS version of the host, used to pick a change-detection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostVersion {
    pub major: u32,
    pub build: u32,
}

impl HostVersion {
    /// First Windows build whose registry reliably reports session changes.
    pub const FIRST_EVENT_RELIABLE_BUILD: u32 = 22000;

    /// Windows 10 (major 10, build below 22000) drops `SessionsChanged`
    /// notifications and has to be polled.
    pub fn has_reliable_session_events(&self) -> bool {
        !(self.major == 10 && self.build < Self::FIRST_EVENT_RELIABLE_BUILD)
    }
}

#[cfg(target_os = "windows")]
pub fn host_version() -> Option<HostVersion> {
    windows::host_version()
}

#[cfg(not(target_os = "windows"))]
pub fn host_version() -> Option<HostVersion> {
    None
}

/// Per-thread platform setup for threads that call into the session service.
/// Released when dropped.
pub struct ThreadGuard {
    #[cfg(target_os = "windows")]
    _com: Option<windows::ComGuard>,
}

pub fn enter_thread() -> ThreadGuard {
    ThreadGuard {
        #[cfg(target_os = "windows")]
        _com: windows::ComGuard::enter(),
    }
}
