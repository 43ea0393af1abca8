// Embedded artwork extraction into a content-addressed cache directory

use std::fs;
use std::path::{Path, PathBuf};

use xxhash_rust::xxh64::xxh64;

use super::probe::EmbeddedArtwork;
use crate::error::Result;

pub struct ArtworkCache {
    dir: PathBuf,
}

impl ArtworkCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the image once; identical art from many tracks of one album
    /// lands on the same file.
    pub fn store(&self, artwork: &EmbeddedArtwork) -> Result<PathBuf> {
        let path = self.path_for(artwork);
        if !path.exists() {
            fs::create_dir_all(&self.dir)?;
            let tmp = path.with_extension("part");
            fs::write(&tmp, &artwork.data)?;
            fs::rename(&tmp, &path)?;
        }
        Ok(path)
    }

    pub fn path_for(&self, artwork: &EmbeddedArtwork) -> PathBuf {
        let hash = xxh64(&artwork.data, 0);
        self.dir
            .join(format!("{:016x}.{}", hash, extension_for(artwork.mime_type.as_deref())))
    }
}

fn extension_for(mime: Option<&str>) -> &'static str {
    match mime.map(|m| m.to_ascii_lowercase()).as_deref() {
        Some("image/png") | Some("png") => "png",
        Some("image/bmp") => "bmp",
        Some("image/gif") => "gif",
        Some("image/webp") => "webp",
        _ => "jpg",
    }
}
