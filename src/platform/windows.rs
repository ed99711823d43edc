//! Global System Media Transport Controls backend.

use std::{future::IntoFuture, sync::Arc, thread};

use futures::{channel::oneshot, executor::block_on, future::BoxFuture, FutureExt};
use tracing::warn;

use ::windows::{
    core::{AgileReference, Result as WinResult},
    Foundation::TypedEventHandler,
    Media::Control::{
        GlobalSystemMediaTransportControlsSession,
        GlobalSystemMediaTransportControlsSessionManager,
        GlobalSystemMediaTransportControlsSessionMediaProperties,
        GlobalSystemMediaTransportControlsSessionPlaybackInfo,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus,
    },
    Storage::Streams::{DataReader, IRandomAccessStreamReference, InputStreamOptions},
    System::Profile::AnalyticsInfo,
    Win32::{
        Foundation::RPC_E_CHANGED_MODE,
        System::Com::{CoInitializeEx, CoUninitialize, COINIT_MULTITHREADED},
    },
};

use crate::{
    error::{PlatformError, PlatformResult},
    model::{
        MediaProperties, PlaybackControls, PlaybackInfo, PlaybackStatus, Thumbnail,
        TransportCommand,
    },
    platform::{
        Callback, HostVersion, ListenerToken, ManagerHandle, MediaSession, SessionHandle,
        SessionManager, ThumbnailSource,
    },
};

const THUMBNAIL_CHUNK: u32 = 64 * 1024;

/// Acquire the process-wide session manager.
pub async fn request_manager() -> PlatformResult<ManagerHandle> {
    let operation = GlobalSystemMediaTransportControlsSessionManager::RequestAsync()
        .map_err(|e| PlatformError::Unavailable(format!("{e:?}")))?;
    let inner = operation
        .into_future()
        .await
        .map_err(|e| PlatformError::Unavailable(format!("{e:?}")))?;
    Ok(Arc::new(WindowsSessionManager { inner }))
}

/// Reads the OS version from the device family version, a packed
/// `major.minor.build.revision` quadruple of 16-bit fields.
pub fn host_version() -> Option<HostVersion> {
    let packed: u64 = AnalyticsInfo::VersionInfo()
        .and_then(|info| info.DeviceFamilyVersion())
        .ok()?
        .to_string_lossy()
        .parse()
        .ok()?;
    Some(HostVersion {
        major: ((packed >> 48) & 0xFFFF) as u32,
        build: ((packed >> 16) & 0xFFFF) as u32,
    })
}

/// COM initialisation for the current thread, undone on drop.
pub struct ComGuard;

impl ComGuard {
    pub fn enter() -> Option<Self> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr.is_ok() {
            Some(ComGuard)
        } else {
            if hr != RPC_E_CHANGED_MODE {
                warn!(?hr, "COM init failed");
            }
            None
        }
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        unsafe {
            CoUninitialize();
        }
    }
}

struct WindowsSessionManager {
    inner: GlobalSystemMediaTransportControlsSessionManager,
}

impl SessionManager for WindowsSessionManager {
    fn current_session(&self) -> PlatformResult<Option<SessionHandle>> {
        match self.inner.GetCurrentSession() {
            Ok(session) => Ok(Some(Arc::new(WindowsSession { inner: session }))),
            // GetCurrentSession reports "no session" as a null result.
            Err(e) if e.code().is_ok() => Ok(None),
            Err(e) => Err(PlatformError::call("GetCurrentSession", format!("{e:?}"))),
        }
    }

    fn on_sessions_changed(&self, handler: Callback) -> PlatformResult<ListenerToken> {
        self.inner
            .SessionsChanged(&TypedEventHandler::new(move |_, _| {
                handler();
                Ok(())
            }))
            .map(ListenerToken)
            .map_err(|e| PlatformError::call("SessionsChanged", format!("{e:?}")))
    }

    fn remove_sessions_changed(&self, token: ListenerToken) -> PlatformResult<()> {
        self.inner
            .RemoveSessionsChanged(token.0)
            .map_err(|e| PlatformError::call("RemoveSessionsChanged", format!("{e:?}")))
    }
}

struct WindowsSession {
    inner: GlobalSystemMediaTransportControlsSession,
}

fn map_status(status: GlobalSystemMediaTransportControlsSessionPlaybackStatus) -> PlaybackStatus {
    match status {
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Closed => PlaybackStatus::Closed,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Opened => PlaybackStatus::Opened,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Changing => PlaybackStatus::Changing,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Stopped => PlaybackStatus::Stopped,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Playing => PlaybackStatus::Playing,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Paused => PlaybackStatus::Paused,
        _ => PlaybackStatus::Unknown,
    }
}

fn read_playback_info(
    info: &GlobalSystemMediaTransportControlsSessionPlaybackInfo,
) -> WinResult<PlaybackInfo> {
    let controls = info.Controls()?;
    Ok(PlaybackInfo {
        status: map_status(info.PlaybackStatus()?),
        controls: PlaybackControls {
            play: controls.IsPlayEnabled()?,
            pause: controls.IsPauseEnabled()?,
            stop: controls.IsStopEnabled()?,
            next: controls.IsNextEnabled()?,
            previous: controls.IsPreviousEnabled()?,
            toggle_play_pause: controls.IsPlayPauseToggleEnabled()?,
        },
    })
}

fn read_media_properties(
    props: &GlobalSystemMediaTransportControlsSessionMediaProperties,
) -> WinResult<MediaProperties> {
    let track_number = props.TrackNumber()?;
    let thumbnail = props
        .Thumbnail()
        .ok()
        .and_then(|reference| AgileReference::new(&reference).ok())
        .map(|reference| {
            Thumbnail::new(Arc::new(WindowsThumbnail {
                reference: Arc::new(reference),
            }) as Arc<dyn ThumbnailSource>)
        });
    Ok(MediaProperties {
        title: props.Title()?.to_string_lossy(),
        artist: props.Artist()?.to_string_lossy(),
        album_title: props.AlbumTitle()?.to_string_lossy(),
        album_artist: props.AlbumArtist()?.to_string_lossy(),
        track_number: u32::try_from(track_number).ok().filter(|n| *n > 0),
        thumbnail,
    })
}

impl MediaSession for WindowsSession {
    fn source_app_id(&self) -> PlatformResult<String> {
        self.inner
            .SourceAppUserModelId()
            .map(|id| id.to_string_lossy())
            .map_err(|e| PlatformError::call("SourceAppUserModelId", format!("{e:?}")))
    }

    fn playback_info(&self) -> PlatformResult<PlaybackInfo> {
        self.inner
            .GetPlaybackInfo()
            .and_then(|info| read_playback_info(&info))
            .map_err(|e| PlatformError::call("GetPlaybackInfo", format!("{e:?}")))
    }

    fn media_properties(&self) -> BoxFuture<'static, PlatformResult<MediaProperties>> {
        let operation = self.inner.TryGetMediaPropertiesAsync();
        async move {
            let props = operation?.into_future().await?;
            read_media_properties(&props)
        }
        .map(|result: WinResult<MediaProperties>| {
            result.map_err(|e| PlatformError::call("TryGetMediaPropertiesAsync", format!("{e:?}")))
        })
        .boxed()
    }

    fn on_playback_info_changed(&self, handler: Callback) -> PlatformResult<ListenerToken> {
        self.inner
            .PlaybackInfoChanged(&TypedEventHandler::new(move |_, _| {
                handler();
                Ok(())
            }))
            .map(ListenerToken)
            .map_err(|e| PlatformError::call("PlaybackInfoChanged", format!("{e:?}")))
    }

    fn remove_playback_info_changed(&self, token: ListenerToken) -> PlatformResult<()> {
        self.inner
            .RemovePlaybackInfoChanged(token.0)
            .map_err(|e| PlatformError::call("RemovePlaybackInfoChanged", format!("{e:?}")))
    }

    fn on_media_properties_changed(&self, handler: Callback) -> PlatformResult<ListenerToken> {
        self.inner
            .MediaPropertiesChanged(&TypedEventHandler::new(move |_, _| {
                handler();
                Ok(())
            }))
            .map(ListenerToken)
            .map_err(|e| PlatformError::call("MediaPropertiesChanged", format!("{e:?}")))
    }

    fn remove_media_properties_changed(&self, token: ListenerToken) -> PlatformResult<()> {
        self.inner
            .RemoveMediaPropertiesChanged(token.0)
            .map_err(|e| PlatformError::call("RemoveMediaPropertiesChanged", format!("{e:?}")))
    }

    fn send(&self, command: TransportCommand) -> BoxFuture<'static, PlatformResult<bool>> {
        let operation = match command {
            TransportCommand::TogglePlayPause => self.inner.TryTogglePlayPauseAsync(),
            TransportCommand::SkipNext => self.inner.TrySkipNextAsync(),
            TransportCommand::SkipPrevious => self.inner.TrySkipPreviousAsync(),
        };
        async move { operation?.into_future().await }
            .map(move |result: WinResult<bool>| {
                result.map_err(|e| PlatformError::call(command.as_str(), format!("{e:?}")))
            })
            .boxed()
    }
}

/// `IRandomAccessStreamReference` is not agile, so the reference travels as
/// an [`AgileReference`] and the stream is read on its own COM thread.
struct WindowsThumbnail {
    reference: Arc<AgileReference<IRandomAccessStreamReference>>,
}

impl ThumbnailSource for WindowsThumbnail {
    fn read(&self) -> BoxFuture<'static, PlatformResult<Vec<u8>>> {
        let reference = Arc::clone(&self.reference);
        let (done_tx, done_rx) = oneshot::channel();
        let spawned = thread::Builder::new()
            .name("media-thumbnail".into())
            .spawn(move || {
                let _com = ComGuard::enter();
                let result = reference
                    .resolve()
                    .and_then(|reference| load_thumbnail_bytes(&reference))
                    .map_err(|e| PlatformError::call("OpenReadAsync", format!("{e:?}")));
                let _ = done_tx.send(result);
            });

        async move {
            spawned.map_err(|e| PlatformError::call("spawn thumbnail thread", e))?;
            done_rx
                .await
                .map_err(|_| PlatformError::call("OpenReadAsync", "thumbnail reader exited"))?
        }
        .boxed()
    }
}

fn load_thumbnail_bytes(reference: &IRandomAccessStreamReference) -> WinResult<Vec<u8>> {
    let stream = block_on(reference.OpenReadAsync()?.into_future())?;
    let input_stream = stream.GetInputStreamAt(0)?;
    let reader = DataReader::CreateDataReader(&input_stream)?;
    reader.SetInputStreamOptions(InputStreamOptions::Partial)?;

    let mut buffer = Vec::new();
    loop {
        let loaded = block_on(reader.LoadAsync(THUMBNAIL_CHUNK)?.into_future())?;
        if loaded == 0 {
            break;
        }
        let mut chunk = vec![0u8; loaded as usize];
        reader.ReadBytes(&mut chunk)?;
        buffer.extend_from_slice(&chunk);
        if loaded < THUMBNAIL_CHUNK {
            break;
        }
    }
    Ok(buffer)
}
