//! Snapshots of media session state handed to observers.

use std::{fmt, sync::Arc};

use crate::{error::PlatformResult, platform::ThumbnailSource};

pub const DISPLAY_TITLE_LIMIT: usize = 35;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PlaybackStatus {
    Closed,
    Opened,
    Changing,
    Stopped,
    Playing,
    Paused,
    Unknown,
}

impl Default for PlaybackStatus {
    fn default() -> Self {
        PlaybackStatus::Unknown
    }
}

impl PlaybackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackStatus::Closed => "Closed",
            PlaybackStatus::Opened => "Opened",
            PlaybackStatus::Changing => "Changing",
            PlaybackStatus::Stopped => "Stopped",
            PlaybackStatus::Playing => "Playing",
            PlaybackStatus::Paused => "Paused",
            PlaybackStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport buttons the source currently accepts.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PlaybackControls {
    pub play: bool,
    pub pause: bool,
    pub stop: bool,
    pub next: bool,
    pub previous: bool,
    pub toggle_play_pause: bool,
}

impl PlaybackControls {
    pub fn all() -> Self {
        Self {
            play: true,
            pause: true,
            stop: true,
            next: true,
            previous: true,
            toggle_play_pause: true,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct PlaybackInfo {
    pub status: PlaybackStatus,
    pub controls: PlaybackControls,
}

impl PlaybackInfo {
    pub fn new(status: PlaybackStatus) -> Self {
        Self {
            status,
            controls: PlaybackControls::all(),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.status == PlaybackStatus::Playing
    }
}

/// Lazily readable reference to a track's artwork.
///
/// Only the raw bytes are exposed; decoding belongs to whoever renders them.
#[derive(Clone)]
pub struct Thumbnail(Arc<dyn ThumbnailSource>);

impl Thumbnail {
    pub fn new(source: Arc<dyn ThumbnailSource>) -> Self {
        Self(source)
    }

    pub async fn read(&self) -> PlatformResult<Vec<u8>> {
        self.0.read().await
    }
}

impl fmt::Debug for Thumbnail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Thumbnail(..)")
    }
}

#[derive(Clone, Debug, Default)]
pub struct MediaProperties {
    pub title: String,
    pub artist: String,
    pub album_title: String,
    pub album_artist: String,
    pub track_number: Option<u32>,
    pub thumbnail: Option<Thumbnail>,
}

impl PartialEq for MediaProperties {
    fn eq(&self, other: &Self) -> bool {
        self.title == other.title && self.artist == other.artist && self.album_title == other.album_title
    }
}

impl MediaProperties {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            ..Default::default()
        }
    }

    /// Title cut down to `limit` characters, ellipsis included.
    pub fn display_title(&self, limit: usize) -> String {
        if self.title.chars().count() <= limit {
            return self.title.clone();
        }
        let keep = limit.saturating_sub(3);
        let mut shortened: String = self.title.chars().take(keep).collect();
        shortened.push_str("...");
        shortened
    }

    pub fn thumbnail_cache_key(&self) -> String {
        format!("{}|{}", self.title, self.artist)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransportCommand {
    TogglePlayPause,
    SkipNext,
    SkipPrevious,
}

impl TransportCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportCommand::TogglePlayPause => "toggle play/pause",
            TransportCommand::SkipNext => "skip next",
            TransportCommand::SkipPrevious => "skip previous",
        }
    }
}

/// Icon the tray shows for the tracked state. While playing the icon offers
/// the pause action and vice versa.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransportGlyph {
    NoMedia,
    Play,
    Pause,
}

impl TransportGlyph {
    pub fn for_state(has_session: bool, is_playing: bool) -> Self {
        match (has_session, is_playing) {
            (false, _) => TransportGlyph::NoMedia,
            (true, true) => TransportGlyph::Pause,
            (true, false) => TransportGlyph::Play,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_titles_are_shortened_with_ellipsis() {
        let props = MediaProperties::new("a".repeat(40), "artist");
        let shown = props.display_title(DISPLAY_TITLE_LIMIT);
        assert_eq!(shown.chars().count(), DISPLAY_TITLE_LIMIT);
        assert!(shown.ends_with("..."));
        assert_eq!(&shown[..32], "a".repeat(32));
    }

    #[test]
    fn short_titles_are_untouched() {
        let props = MediaProperties::new("Blue in Green", "Miles Davis");
        assert_eq!(props.display_title(DISPLAY_TITLE_LIMIT), "Blue in Green");
        assert_eq!(props.thumbnail_cache_key(), "Blue in Green|Miles Davis");
    }

    #[test]
    fn multibyte_titles_are_cut_on_char_boundaries() {
        let props = MediaProperties::new("ééééé", "x");
        assert_eq!(props.display_title(4), "é...");
    }

    #[test]
    fn properties_compare_by_track_identity() {
        let mut a = MediaProperties::new("Song", "Band");
        let b = MediaProperties::new("Song", "Band");
        a.track_number = Some(3);
        assert_eq!(a, b);
        a.album_title = "Other".into();
        assert_ne!(a, b);
    }

    #[test]
    fn glyph_follows_session_and_status() {
        assert_eq!(TransportGlyph::for_state(false, true), TransportGlyph::NoMedia);
        assert_eq!(TransportGlyph::for_state(true, true), TransportGlyph::Pause);
        assert_eq!(TransportGlyph::for_state(true, false), TransportGlyph::Play);
    }

    #[test]
    fn only_playing_status_counts_as_playing() {
        assert!(PlaybackInfo::new(PlaybackStatus::Playing).is_playing());
        for status in [
            PlaybackStatus::Paused,
            PlaybackStatus::Stopped,
            PlaybackStatus::Changing,
            PlaybackStatus::Closed,
            PlaybackStatus::Unknown,
        ] {
            assert!(!PlaybackInfo::new(status).is_playing());
        }
    }
}
