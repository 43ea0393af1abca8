// Tag + duration probing
// One probe instance lives for the whole scan and is reused for every file

use std::path::Path;
use std::time::Duration;

use id3::TagLike;
use tracing::debug;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedArtwork {
    pub data: Vec<u8>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbedTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<u32>,
    pub track_number: Option<u32>,
    pub duration: Option<Duration>,
    pub artwork: Option<EmbeddedArtwork>,
}

impl ProbedTags {
    /// Fill whatever is still empty from `other`.
    fn merge_missing(&mut self, other: ProbedTags) {
        self.title = self.title.take().or(other.title);
        self.artist = self.artist.take().or(other.artist);
        self.album = self.album.take().or(other.album);
        self.genre = self.genre.take().or(other.genre);
        self.year = self.year.or(other.year);
        self.track_number = self.track_number.or(other.track_number);
        self.duration = self.duration.or(other.duration);
        self.artwork = self.artwork.take().or(other.artwork);
    }
}

/// Reads tags and duration from one file. Errors are per-file
/// `DecoderFailure`s; the scanner logs them and moves on.
pub trait TagProbe: Send {
    fn probe(&mut self, path: &Path) -> Result<ProbedTags>;
}

/// Listed from container tags and file name alone; no stream reader handles them.
const TAG_ONLY_EXTENSIONS: [&str; 1] = ["wma"];

fn decoder_failure(path: &Path, reason: impl ToString) -> EngineError {
    EngineError::DecoderFailure {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Container tag readers (id3, mp4ameta) plus symphonia for duration and
/// for formats whose tags live inside the stream (flac, ogg, wav).
pub struct FileTagProbe {
    #[cfg(feature = "probe")]
    registry: &'static symphonia::core::probe::Probe,
    #[cfg(feature = "probe")]
    format_opts: symphonia::core::formats::FormatOptions,
    #[cfg(feature = "probe")]
    metadata_opts: symphonia::core::meta::MetadataOptions,
    probed_files: u64,
}

impl FileTagProbe {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "probe")]
            registry: symphonia::default::get_probe(),
            #[cfg(feature = "probe")]
            format_opts: Default::default(),
            #[cfg(feature = "probe")]
            metadata_opts: Default::default(),
            probed_files: 0,
        }
    }

    pub fn probed_files(&self) -> u64 {
        self.probed_files
    }

    fn read_id3(path: &Path, ext: &str) -> Option<ProbedTags> {
        let tag = match ext {
            "wav" => id3::Tag::read_from_wav_path(path),
            "aiff" => id3::Tag::read_from_aiff_path(path),
            _ => id3::Tag::read_from_path(path),
        }
        .ok()?;
        let artwork = tag.pictures().next().map(|pic| EmbeddedArtwork {
            data: pic.data.clone(),
            mime_type: Some(pic.mime_type.clone()),
        });
        Some(ProbedTags {
            title: tag.title().map(str::to_string),
            artist: tag.artist().map(str::to_string),
            album: tag.album().map(str::to_string),
            genre: tag.genre().map(str::to_string),
            year: tag.year().and_then(|y| u32::try_from(y).ok()),
            track_number: tag.track(),
            duration: tag.duration().map(|ms| Duration::from_millis(ms as u64)),
            artwork,
        })
    }

    fn read_mp4(path: &Path) -> Option<ProbedTags> {
        let tag = mp4ameta::Tag::read_from_path(path).ok()?;
        let artwork = tag.artwork().map(|img| EmbeddedArtwork {
            data: img.data.to_vec(),
            mime_type: Some(
                match img.fmt {
                    mp4ameta::ImgFmt::Png => "image/png",
                    mp4ameta::ImgFmt::Bmp => "image/bmp",
                    mp4ameta::ImgFmt::Jpeg => "image/jpeg",
                }
                .to_string(),
            ),
        });
        Some(ProbedTags {
            title: tag.title().map(str::to_string),
            artist: tag.artist().map(str::to_string),
            album: tag.album().map(str::to_string),
            genre: tag.genre().map(str::to_string),
            year: tag.year().and_then(|y| y.get(..4)).and_then(|y| y.parse().ok()),
            track_number: tag.track_number().map(u32::from),
            duration: tag.duration(),
            artwork,
        })
    }

    /// `Ok(None)` when no reader recognises the stream.
    #[cfg(feature = "probe")]
    fn read_stream(&mut self, path: &Path) -> Result<Option<ProbedTags>> {
        use std::fs::File;
        use symphonia::core::codecs::CODEC_TYPE_NULL;
        use symphonia::core::errors::Error as StreamError;
        use symphonia::core::io::MediaSourceStream;
        use symphonia::core::meta::{MetadataRevision, StandardTagKey};
        use symphonia::core::probe::Hint;

        fn collect(rev: &MetadataRevision, into: &mut ProbedTags) {
            for tag in rev.tags() {
                let value = tag.value.to_string();
                match tag.std_key {
                    Some(StandardTagKey::TrackTitle) => into.title = into.title.take().or(Some(value)),
                    Some(StandardTagKey::Artist) => into.artist = into.artist.take().or(Some(value)),
                    Some(StandardTagKey::Album) => into.album = into.album.take().or(Some(value)),
                    Some(StandardTagKey::Genre) => into.genre = into.genre.take().or(Some(value)),
                    Some(StandardTagKey::Date) => {
                        into.year = into.year.or_else(|| value.get(..4).and_then(|y| y.parse().ok()))
                    }
                    Some(StandardTagKey::TrackNumber) => {
                        into.track_number = into
                            .track_number
                            .or_else(|| value.split('/').next().and_then(|n| n.trim().parse().ok()))
                    }
                    _ => {}
                }
            }
            if into.artwork.is_none() {
                into.artwork = rev.visuals().first().map(|v| EmbeddedArtwork {
                    data: v.data.to_vec(),
                    mime_type: Some(v.media_type.clone()),
                });
            }
        }

        let file = File::open(path).map_err(|e| decoder_failure(path, e))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let mut probed = match self.registry.format(&hint, mss, &self.format_opts, &self.metadata_opts) {
            Ok(probed) => probed,
            Err(StreamError::Unsupported(what)) => {
                debug!("No stream reader for {}: {}", path.display(), what);
                return Ok(None);
            }
            Err(e) => return Err(decoder_failure(path, e)),
        };

        let mut tags = ProbedTags::default();
        if let Some(metadata) = probed.metadata.get() {
            if let Some(rev) = metadata.current() {
                collect(rev, &mut tags);
            }
        }
        if let Some(rev) = probed.format.metadata().current() {
            collect(rev, &mut tags);
        }

        let track = probed
            .format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| decoder_failure(path, "no decodable audio track"))?;

        if let (Some(time_base), Some(n_frames)) = (track.codec_params.time_base, track.codec_params.n_frames) {
            let time = time_base.calc_time(n_frames);
            tags.duration = Some(Duration::from_secs_f64(time.seconds as f64 + time.frac));
        }
        Ok(Some(tags))
    }

    #[cfg(not(feature = "probe"))]
    fn read_stream(&mut self, path: &Path) -> Result<Option<ProbedTags>> {
        debug!("Stream probing disabled, skipping {}", path.display());
        Ok(None)
    }
}

impl Default for FileTagProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl TagProbe for FileTagProbe {
    fn probe(&mut self, path: &Path) -> Result<ProbedTags> {
        self.probed_files += 1;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let container = match ext.as_str() {
            "mp3" | "wav" | "aiff" => Self::read_id3(path, &ext),
            "m4a" => Self::read_mp4(path),
            _ => None,
        };

        // The stream probe is what proves the file is decodable at all.
        // Without a stream reader, container tags (or the extension) vouch
        // for it instead and the duration stays unknown.
        let tag_only = TAG_ONLY_EXTENSIONS.contains(&ext.as_str());
        let stream = if tag_only { None } else { self.read_stream(path)? };
        match (stream, container) {
            (Some(stream), Some(mut tags)) => {
                tags.merge_missing(stream);
                Ok(tags)
            }
            (Some(stream), None) => Ok(stream),
            (None, Some(container)) => {
                debug!("Using container tags only for {}", path.display());
                Ok(container)
            }
            (None, None) if tag_only => Ok(ProbedTags::default()),
            (None, None) => Err(decoder_failure(path, "unsupported format")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn merge_keeps_existing_fields() {
        let mut a = ProbedTags {
            title: Some("Tagged".into()),
            ..Default::default()
        };
        a.merge_missing(ProbedTags {
            title: Some("Stream".into()),
            duration: Some(Duration::from_secs(3)),
            ..Default::default()
        });
        assert_eq!(a.title.as_deref(), Some("Tagged"));
        assert_eq!(a.duration, Some(Duration::from_secs(3)));
    }

    #[test]
    fn garbage_file_is_a_decoder_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("corrupt.mp3");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[0x13u8; 4096]).unwrap();

        let mut probe = FileTagProbe::new();
        let err = probe.probe(&path).unwrap_err();
        assert!(matches!(err, EngineError::DecoderFailure { .. }));
        assert_eq!(probe.probed_files(), 1);
    }
}
