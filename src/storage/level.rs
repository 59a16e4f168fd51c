//! Single-resolution tile store.
//!
//! One directory holding one container file for one pyramid level. Images
//! are handed to the container writer and simultaneously kept in a
//! write-pending map; a lookup consults the pending map first and the
//! on-disk reader second, so the answer to "is this image available" never
//! depends on how far the background writer has gotten.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

use crate::error::{StorageError, TiffError};
use crate::storage::image::{PixelBuffer, TaggedImage};
use crate::storage::meta::{self, SummaryMeta};
use crate::storage::tiff::{TiffReader, TiffWriter};

/// Tile store for one resolution level.
pub struct LevelStorage {
    dir: PathBuf,
    summary: SummaryMeta,

    /// None when this store was opened read-only from disk
    writer: Option<Mutex<TiffWriter>>,
    reader: TiffReader,

    /// Images accepted but not yet durable; wins races against the reader
    pending: Arc<Mutex<HashMap<String, TaggedImage>>>,

    finished: AtomicBool,
}

impl LevelStorage {
    /// Create a new store, its directory, and its container file.
    pub fn create(dir: &Path, summary: &SummaryMeta) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let file = dir.join(format!("{}.tif", summary.prefix));
        let writer = TiffWriter::create(&file, summary)?;
        let reader = writer.reader()?;
        Ok(Self {
            dir: dir.to_path_buf(),
            summary: summary.clone(),
            writer: Some(Mutex::new(writer)),
            reader,
            pending: Arc::new(Mutex::new(HashMap::new())),
            finished: AtomicBool::new(false),
        })
    }

    /// Open a finished store from disk, read-only.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        let container = find_container(dir)?;
        let reader = TiffReader::open(&container)?;
        let summary = SummaryMeta::from_document(reader.summary())
            .map_err(TiffError::Metadata)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            summary,
            writer: None,
            reader,
            pending: Arc::new(Mutex::new(HashMap::new())),
            finished: AtomicBool::new(true),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn summary(&self) -> &SummaryMeta {
        &self.summary
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Accept one image for writing.
    ///
    /// The image becomes immediately visible through [`get_image`]
    /// (pending map) and durably visible once the writer thread catches
    /// up, at which point the pending entry is dropped.
    pub fn put_image(&self, img: TaggedImage) -> Result<(), StorageError> {
        if self.is_finished() {
            return Err(StorageError::Finished);
        }
        let writer = self.writer.as_ref().ok_or(StorageError::Finished)?;
        let label = meta::label_of(&img.tags)
            .ok_or(StorageError::MissingMetadata("ChannelIndex"))?;

        self.pending.lock().unwrap().insert(label.clone(), img.clone());

        let mut writer = writer.lock().unwrap();
        writer.write_image(&img)?;
        let pending = Arc::clone(&self.pending);
        writer.after_pending(move || {
            pending.lock().unwrap().remove(&label);
        })?;
        Ok(())
    }

    /// Rewrite only the pixel strip of an existing image.
    pub fn overwrite_pixels(
        &self,
        pix: &PixelBuffer,
        channel: i64,
        slice: i64,
        frame: i64,
        position: i64,
    ) -> Result<(), StorageError> {
        let writer = self.writer.as_ref().ok_or(StorageError::Finished)?;
        let label = meta::label(channel, slice, frame, position);
        writer
            .lock()
            .unwrap()
            .overwrite_pixels(&label, pix.bytes())?;
        Ok(())
    }

    /// Fetch an image if present. Pending images win over the on-disk
    /// reader; read faults degrade to `None` so a missing tile renders as
    /// background instead of failing the caller.
    pub fn get_image(
        &self,
        channel: i64,
        slice: i64,
        frame: i64,
        position: i64,
    ) -> Option<TaggedImage> {
        let label = meta::label(channel, slice, frame, position);
        if let Some(img) = self.pending.lock().unwrap().get(&label) {
            return Some(img.clone());
        }
        match self.reader.get_image(&label) {
            Ok(img) => Some(img),
            Err(TiffError::UnknownLabel(_)) => None,
            Err(e) => {
                warn!("failed reading {label} from {}: {e}", self.dir.display());
                None
            }
        }
    }

    /// Labels of all images accepted so far.
    pub fn labels(&self) -> Vec<String> {
        self.reader.labels()
    }

    /// Smallest and largest slice index present, if any images exist.
    pub fn slice_extent(&self) -> Option<(i64, i64)> {
        self.labels()
            .iter()
            .filter_map(|l| meta::parse_label(l).map(|ix| ix[1]))
            .fold(None, |acc, s| match acc {
                None => Some((s, s)),
                Some((lo, hi)) => Some((lo.min(s), hi.max(s))),
            })
    }

    /// Largest frame index present.
    pub fn max_frame(&self) -> Option<i64> {
        self.labels()
            .iter()
            .filter_map(|l| meta::parse_label(l).map(|ix| ix[2]))
            .max()
    }

    /// Finalize the container: no more images, extras written, file
    /// truncated and read-only. The writer queue is fully drained before
    /// this returns, so finalize can never race an in-flight write.
    pub fn finished(
        &self,
        display_settings: &Value,
        comments: &Value,
    ) -> Result<(), StorageError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(writer) = &self.writer {
            writer.lock().unwrap().close(display_settings, comments)?;
        }
        Ok(())
    }
}

fn find_container(dir: &Path) -> Result<PathBuf, StorageError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("tif")) {
            return Ok(path);
        }
    }
    Err(StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no container file in {}", dir.display()),
    )))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_summary() -> SummaryMeta {
        SummaryMeta {
            prefix: "level".to_string(),
            width: 8,
            height: 8,
            byte_depth: 1,
            rgb: false,
            num_channels: 1,
            channel_names: vec!["C0".to_string()],
            channel_colors: vec![0xFFFFFF],
            num_frames: 1,
            num_slices: 1,
            pixel_size_um: 1.0,
            z_step_um: 1.0,
            interval_ms: 0.0,
            overlap_x: 0,
            overlap_y: 0,
            affine: "1_0_0_1".to_string(),
            initial_positions: vec![],
        }
    }

    fn test_image(fill: u8, position: i64) -> TaggedImage {
        let pix = PixelBuffer::filled(fill as u16, 8, 8, 1, false);
        let tags =
            meta::image_tags(0, 0, 0, position, 0, 0, 0.0, 0.0, 0.0, 0, 1.0, 8, 8);
        TaggedImage::new(pix, tags)
    }

    #[test]
    fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = LevelStorage::create(dir.path(), &test_summary()).unwrap();
        store.put_image(test_image(5, 0)).unwrap();

        // Available immediately, durable or not
        let img = store.get_image(0, 0, 0, 0).unwrap();
        assert_eq!(img.pix.sample(0, 0, 0), 5);
        assert!(store.get_image(0, 0, 0, 1).is_none());
    }

    #[test]
    fn test_reopen_after_finished() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LevelStorage::create(dir.path(), &test_summary()).unwrap();
            store.put_image(test_image(9, 0)).unwrap();
            store.put_image(test_image(10, 1)).unwrap();
            store.finished(&json!({"Channels": []}), &json!({})).unwrap();
            assert!(store.is_finished());
            assert!(matches!(
                store.put_image(test_image(0, 2)),
                Err(StorageError::Finished)
            ));
        }

        let reopened = LevelStorage::open(dir.path()).unwrap();
        assert!(reopened.is_finished());
        assert_eq!(reopened.labels().len(), 2);
        let img = reopened.get_image(0, 0, 0, 1).unwrap();
        assert_eq!(img.pix.sample(3, 3, 0), 10);
        assert_eq!(reopened.summary().prefix, "level");
    }

    #[test]
    fn test_overwrite_refines_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let store = LevelStorage::create(dir.path(), &test_summary()).unwrap();
        store.put_image(test_image(1, 0)).unwrap();

        let refined = PixelBuffer::filled(200, 8, 8, 1, false);
        store.overwrite_pixels(&refined, 0, 0, 0, 0).unwrap();
        store.finished(&json!({"Channels": []}), &json!({})).unwrap();

        let img = store.get_image(0, 0, 0, 0).unwrap();
        assert_eq!(img.pix.sample(4, 4, 0), 200);
        // Metadata untouched by the overwrite
        assert_eq!(meta::position_index(&img.tags), Some(0));
    }

    #[test]
    fn test_extents() {
        let dir = tempfile::tempdir().unwrap();
        let store = LevelStorage::create(dir.path(), &test_summary()).unwrap();
        assert_eq!(store.slice_extent(), None);

        for slice in [2i64, 0, 5] {
            let pix = PixelBuffer::filled(0, 8, 8, 1, false);
            let tags = meta::image_tags(0, slice, 1, 0, 0, 0, 0.0, 0.0, 0.0, 0, 1.0, 8, 8);
            store.put_image(TaggedImage::new(pix, tags)).unwrap();
        }
        assert_eq!(store.slice_extent(), Some((0, 5)));
        assert_eq!(store.max_frame(), Some(1));
    }
}
