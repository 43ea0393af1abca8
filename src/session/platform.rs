// OS media controls (MPRIS / SMTC / Now Playing) through souvlaki

use std::time::Duration;

use anyhow::anyhow;
use souvlaki::{MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, MediaPosition, PlatformConfig, SeekDirection};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Capability, MediaButton, MediaSession, Notification, SessionMetadata, SessionPlayback, SessionSignal};

const DISPLAY_NAME: &str = "Offtune";
const DBUS_NAME: &str = "offtune";
const SEEK_STEP: Duration = Duration::from_secs(10);

pub struct OsMediaSession {
    controls: MediaControls,
}

impl OsMediaSession {
    /// `None` when the platform has no usable media session.
    #[cfg(not(target_os = "windows"))]
    pub fn connect(signals: mpsc::UnboundedSender<SessionSignal>) -> Option<Self> {
        let mut controls = match MediaControls::new(PlatformConfig {
            display_name: DISPLAY_NAME,
            dbus_name: DBUS_NAME,
            hwnd: None,
        }) {
            Ok(controls) => controls,
            Err(e) => {
                warn!("Failed to create OS media controls: {:?}", e);
                return None;
            }
        };

        if let Err(e) = controls.attach(move |event| {
            if let Some(button) = map_event(event) {
                let _ = signals.send(SessionSignal::Button(button));
            }
        }) {
            warn!("Failed to attach OS media controls handler: {:?}", e);
            return None;
        }

        Some(Self { controls })
    }

    #[cfg(target_os = "windows")]
    pub fn connect(_signals: mpsc::UnboundedSender<SessionSignal>) -> Option<Self> {
        // SMTC needs a window handle and this crate has no window
        warn!("OS media controls are disabled on Windows without a window handle");
        None
    }
}

fn map_event(event: MediaControlEvent) -> Option<MediaButton> {
    match event {
        MediaControlEvent::Play => Some(MediaButton::Play),
        MediaControlEvent::Pause => Some(MediaButton::Pause),
        MediaControlEvent::Toggle => Some(MediaButton::Toggle),
        MediaControlEvent::Next => Some(MediaButton::Next),
        MediaControlEvent::Previous => Some(MediaButton::Previous),
        MediaControlEvent::Stop => Some(MediaButton::Stop),
        MediaControlEvent::SetPosition(MediaPosition(position)) => Some(MediaButton::SeekTo(position)),
        MediaControlEvent::SeekBy(direction, delta) => Some(MediaButton::SeekBy {
            forward: matches!(direction, SeekDirection::Forward),
            delta,
        }),
        MediaControlEvent::Seek(direction) => Some(MediaButton::SeekBy {
            forward: matches!(direction, SeekDirection::Forward),
            delta: SEEK_STEP,
        }),
        MediaControlEvent::SetVolume(_)
        | MediaControlEvent::OpenUri(_)
        | MediaControlEvent::Raise
        | MediaControlEvent::Quit => None,
    }
}

impl MediaSession for OsMediaSession {
    fn set_capabilities(&mut self, capabilities: &[Capability]) -> anyhow::Result<()> {
        // souvlaki advertises its fixed action set
        debug!("OS media controls ignore capability mask {:?}", capabilities);
        Ok(())
    }

    fn set_metadata(&mut self, metadata: Option<&SessionMetadata>) -> anyhow::Result<()> {
        let result = match metadata {
            Some(meta) => {
                let cover = meta
                    .artwork
                    .as_ref()
                    .map(|path| format!("file://{}", path.display()));
                self.controls.set_metadata(MediaMetadata {
                    title: Some(meta.title.as_str()),
                    artist: Some(meta.artist.as_str()),
                    album: Some(meta.album.as_str()),
                    cover_url: cover.as_deref(),
                    duration: (!meta.duration.is_zero()).then_some(meta.duration),
                })
            }
            None => self.controls.set_metadata(MediaMetadata::default()),
        };
        result.map_err(|e| anyhow!("set_metadata: {:?}", e))
    }

    fn set_playback(&mut self, playback: &SessionPlayback) -> anyhow::Result<()> {
        let progress = Some(MediaPosition(playback.position));
        let state = if playback.stopped {
            MediaPlayback::Stopped
        } else if playback.playing {
            MediaPlayback::Playing { progress }
        } else {
            MediaPlayback::Paused { progress }
        };
        self.controls
            .set_playback(state)
            .map_err(|e| anyhow!("set_playback: {:?}", e))
    }

    fn set_notification(&mut self, notification: Notification) -> anyhow::Result<()> {
        // Desktop sessions have no foreground notification; playback state
        // already decides what the OS shows
        debug!("Notification mode {:?}", notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_events_become_relative_buttons() {
        assert_eq!(
            map_event(MediaControlEvent::Seek(SeekDirection::Backward)),
            Some(MediaButton::SeekBy {
                forward: false,
                delta: SEEK_STEP
            })
        );
        assert_eq!(
            map_event(MediaControlEvent::SetPosition(MediaPosition(Duration::from_secs(42)))),
            Some(MediaButton::SeekTo(Duration::from_secs(42)))
        );
        assert_eq!(map_event(MediaControlEvent::Raise), None);
    }
}
