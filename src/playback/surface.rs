use async_trait::async_trait;
use std::time::Duration;

/// The media element a session feeds.
#[async_trait]
pub trait PlaybackSurface: Send + Sync {
    fn position(&self) -> Duration;

    fn is_paused(&self) -> bool;

    /// Replace the source URL. Resolves once the new source is ready to play.
    async fn load_source(&self, url: &str) -> anyhow::Result<()>;

    fn seek(&self, position: Duration);

    fn play(&self);

    fn pause(&self);
}

/// Where the viewer was, captured before a source swap and restored once
/// the new source is ready so the swap goes unnoticed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Playhead {
    pub position: Duration,
    pub paused: bool,
}

impl Playhead {
    pub fn capture(surface: &dyn PlaybackSurface) -> Self {
        Self {
            position: surface.position(),
            paused: surface.is_paused(),
        }
    }

    pub fn restore(self, surface: &dyn PlaybackSurface) {
        surface.seek(self.position);
        if self.paused {
            surface.pause();
        } else {
            surface.play();
        }
    }
}
