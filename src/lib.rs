//! Tracks the operating system's "now playing" media session and exposes
//! it to tray and flyout front ends.

pub mod config;
pub mod detector;
pub mod error;
pub mod logging;
pub mod model;
pub mod observers;
pub mod platform;
pub mod tracker;

pub use crate::{
    config::Config,
    detector::{DetectorKind, DetectorStrategy},
    error::{PlatformError, PlatformResult, TrackerError},
    model::{
        MediaProperties, PlaybackControls, PlaybackInfo, PlaybackStatus, Thumbnail,
        TransportCommand, TransportGlyph,
    },
    tracker::{MediaSessionTracker, SessionChanged, Subscription, TrackerOptions, TrackerSnapshot},
};
