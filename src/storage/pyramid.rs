//! Multi-resolution pyramid storage.
//!
//! Ingests full-resolution tagged images and incrementally maintains
//! successively halved resolution levels by 2x2 box filtering, until the
//! whole grid fits in one tile per axis. Levels live in sibling
//! directories (`Full resolution`, `Downsampled_x2`, `Downsampled_x4`, …)
//! under one uniquely named acquisition directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::coords::{AffineTransform, PositionIndex, XyPosition};
use crate::error::StorageError;
use crate::storage::downsample::fold_quadrant;
use crate::storage::image::{PixelBuffer, TaggedImage};
use crate::storage::level::LevelStorage;
use crate::storage::meta::{self, SummaryMeta};

/// Directory name of the level-0 store.
pub const FULL_RES_DIR: &str = "Full resolution";

/// Directory name prefix of downsampled stores; the linear factor follows.
pub const DOWNSAMPLE_DIR_PREFIX: &str = "Downsampled_x";

/// Background pixels are assumed to sit at this percentile of the first
/// image's histogram.
const BACKGROUND_PIXEL_PERCENTILE: f64 = 0.1;

struct PyramidInner {
    /// Resolution index -> store. `None` marks a level that was forced
    /// (for deeper initial zoom) but not materialized yet; the next
    /// ingested image materializes it.
    low_res: BTreeMap<usize, Option<LevelStorage>>,

    /// Channel index -> estimated background sample value
    background: BTreeMap<i64, u16>,
}

/// The pyramid store for one acquisition.
pub struct PyramidStorage {
    dir: PathBuf,
    acq_name: String,
    summary: SummaryMeta,

    /// Stored tile dimensions with overlap trimmed; identical at every
    /// level, which is what lets overlap be cut exactly once
    tile_width: u32,
    tile_height: u32,

    full_res: LevelStorage,
    inner: Mutex<PyramidInner>,
    positions: Mutex<PositionIndex>,
    estimate_background: bool,
    finished: AtomicBool,
}

impl PyramidStorage {
    /// Create storage for a new acquisition under `root`, picking a fresh
    /// `prefix_N` directory name.
    pub fn create(
        root: &Path,
        summary: &SummaryMeta,
        positions: Vec<XyPosition>,
        estimate_background: bool,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(root)?;
        let acq_name = unique_acq_dir_name(root, &summary.prefix)?;
        let dir = root.join(&acq_name);
        fs::create_dir_all(&dir)?;

        let full_res = LevelStorage::create(&dir.join(FULL_RES_DIR), summary)?;

        let tile_width = summary.width - summary.overlap_x;
        let tile_height = summary.height - summary.overlap_y;
        let affine = AffineTransform::from_metadata_string(&summary.affine)
            .unwrap_or_else(|| AffineTransform::from_pixel_size(summary.pixel_size_um));

        Ok(Self {
            dir,
            acq_name,
            summary: summary.clone(),
            tile_width,
            tile_height,
            full_res,
            inner: Mutex::new(PyramidInner {
                low_res: BTreeMap::new(),
                background: BTreeMap::new(),
            }),
            positions: Mutex::new(PositionIndex::new(
                affine,
                tile_width,
                tile_height,
                positions,
            )),
            estimate_background,
            finished: AtomicBool::new(false),
        })
    }

    /// Open a finished acquisition directory from disk.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        let full_res = LevelStorage::open(&dir.join(FULL_RES_DIR))?;
        let summary = full_res.summary().clone();
        let tile_width = summary.width - summary.overlap_x;
        let tile_height = summary.height - summary.overlap_y;

        let mut low_res = BTreeMap::new();
        let mut level = 1usize;
        loop {
            let ds_dir = dir.join(format!("{DOWNSAMPLE_DIR_PREFIX}{}", 1u64 << level));
            if !ds_dir.exists() {
                break;
            }
            low_res.insert(level, Some(LevelStorage::open(&ds_dir)?));
            level += 1;
        }
        let max_level = low_res.len();

        // Rebuild the position arena from per-image metadata
        let mut by_index: BTreeMap<usize, XyPosition> = BTreeMap::new();
        for label in full_res.labels() {
            let Some(ix) = meta::parse_label(&label) else {
                continue;
            };
            let pos_index = ix[3] as usize;
            if by_index.contains_key(&pos_index) {
                continue;
            }
            if let Some(img) = full_res.get_image(ix[0], ix[1], ix[2], ix[3]) {
                by_index.insert(
                    pos_index,
                    XyPosition::new(
                        meta::grid_row(&img.tags).unwrap_or(0),
                        meta::grid_col(&img.tags).unwrap_or(0),
                        meta::stage_x(&img.tags).unwrap_or(0.0),
                        meta::stage_y(&img.tags).unwrap_or(0.0),
                    ),
                );
            }
        }
        let affine = AffineTransform::from_metadata_string(&summary.affine)
            .unwrap_or_else(|| AffineTransform::from_pixel_size(summary.pixel_size_um));
        let mut positions = PositionIndex::new(
            affine,
            tile_width,
            tile_height,
            by_index.into_values().collect(),
        );
        positions.ensure_levels(max_level);

        Ok(Self {
            dir: dir.to_path_buf(),
            acq_name: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            summary,
            tile_width,
            tile_height,
            full_res,
            inner: Mutex::new(PyramidInner {
                low_res,
                background: BTreeMap::new(),
            }),
            positions: Mutex::new(positions),
            estimate_background: false,
            finished: AtomicBool::new(true),
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn disk_location(&self) -> &Path {
        &self.dir
    }

    pub fn acq_name(&self) -> &str {
        &self.acq_name
    }

    pub fn summary(&self) -> &SummaryMeta {
        &self.summary
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    /// Resolution levels currently present (full resolution included).
    pub fn num_levels(&self) -> usize {
        1 + self.inner.lock().unwrap().low_res.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn num_rows(&self) -> i64 {
        self.positions.lock().unwrap().num_rows()
    }

    pub fn num_cols(&self) -> i64 {
        self.positions.lock().unwrap().num_cols()
    }

    pub fn grid_row(&self, position_index: usize, level: usize) -> i64 {
        self.positions.lock().unwrap().grid_row(position_index, level)
    }

    pub fn grid_col(&self, position_index: usize, level: usize) -> i64 {
        self.positions.lock().unwrap().grid_col(position_index, level)
    }

    /// Run a closure against the position arena.
    pub fn with_positions<T>(&self, f: impl FnOnce(&mut PositionIndex) -> T) -> T {
        f(&mut self.positions.lock().unwrap())
    }

    /// Estimated background sample value for a channel (0 when unknown).
    pub fn background_value(&self, channel: i64) -> u16 {
        self.inner
            .lock()
            .unwrap()
            .background
            .get(&channel)
            .copied()
            .unwrap_or(0)
    }

    pub fn image_labels(&self) -> Vec<String> {
        self.full_res.labels()
    }

    /// Smallest and largest slice index written so far.
    pub fn slice_extent(&self) -> Option<(i64, i64)> {
        self.full_res.slice_extent()
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Accept one full-resolution image and fold it through every
    /// resolution level the grid requires.
    pub fn put_image(&self, img: TaggedImage) -> Result<(), StorageError> {
        if self.is_finished() {
            return Err(StorageError::Finished);
        }
        let position_index = meta::position_index(&img.tags)
            .ok_or(StorageError::MissingMetadata("PositionIndex"))? as usize;

        let mut inner = self.inner.lock().unwrap();
        if self.estimate_background {
            self.estimate_background_value(&mut inner, &img);
        }
        self.full_res.put_image(img.clone())?;
        self.add_to_low_res(&mut inner, &img, 0, position_index)
    }

    /// Force resolution levels up to `level` to exist before any images
    /// arrive, so viewers can start zoomed out.
    pub fn initialize_to_level(&self, level: usize) {
        let mut inner = self.inner.lock().unwrap();
        for r in inner.low_res.len() + 1..=level {
            inner.low_res.entry(r).or_insert(None);
        }
        self.positions.lock().unwrap().ensure_levels(level);
    }

    /// Add one more resolution level and seed it from existing data.
    /// Returns false when nothing has been written yet.
    pub fn add_lower_resolution(&self) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let labels = self.full_res.labels();
        let Some(label) = labels.first() else {
            return Ok(false);
        };
        let next = inner.low_res.len() + 1;
        inner.low_res.insert(next, None);
        self.positions.lock().unwrap().ensure_levels(next);

        let ix = meta::parse_label(label)
            .ok_or(StorageError::MissingMetadata("ChannelIndex"))?;
        let img = self
            .full_res
            .get_image(ix[0], ix[1], ix[2], ix[3])
            .ok_or(StorageError::MissingLevel(0))?;
        self.add_to_low_res(&mut inner, &img, 0, ix[3] as usize)?;
        Ok(true)
    }

    /// Fold an image from `prev_level` into `prev_level + 1` and onward.
    ///
    /// Keeps going while a deeper level already exists or the tile grid at
    /// that depth still spans at least two tiles in either axis, so the
    /// coarsest auto-created level has at most one tile per direction.
    fn add_to_low_res(
        &self,
        inner: &mut PyramidInner,
        img: &TaggedImage,
        prev_level: usize,
        full_position: usize,
    ) -> Result<(), StorageError> {
        let channel = meta::channel_index(&img.tags)
            .ok_or(StorageError::MissingMetadata("ChannelIndex"))?;
        let slice = meta::slice_index(&img.tags)
            .ok_or(StorageError::MissingMetadata("SliceIndex"))?;
        let frame = meta::frame_index(&img.tags)
            .ok_or(StorageError::MissingMetadata("FrameIndex"))?;

        let mut src = img.pix.clone();
        let mut level = prev_level + 1;

        loop {
            let grid_demands_level = {
                let positions = self.positions.lock().unwrap();
                let span = 1i64 << level;
                positions.num_rows() >= span || positions.num_cols() >= span
            };
            if !inner.low_res.contains_key(&level) && !grid_demands_level {
                break;
            }

            if inner.low_res.get(&level).map_or(true, |s| s.is_none()) {
                // Materialize the level and re-fold everything already
                // present one level up; that sweep includes the image that
                // triggered this call.
                self.create_downsampled_storage(inner, level)?;
                let prev_labels = if level == 1 {
                    self.full_res.labels()
                } else {
                    self.level_store(inner, level - 1)?.labels()
                };
                for label in prev_labels {
                    let Some(ix) = meta::parse_label(&label) else {
                        continue;
                    };
                    let prev_img = if level == 1 {
                        self.full_res.get_image(ix[0], ix[1], ix[2], ix[3])
                    } else {
                        self.level_store(inner, level - 1)?
                            .get_image(ix[0], ix[1], ix[2], ix[3])
                    };
                    let Some(prev_img) = prev_img else { continue };
                    let full = if level == 1 {
                        ix[3] as usize
                    } else {
                        self.positions
                            .lock()
                            .unwrap()
                            .full_res_index(ix[3] as usize, level - 1)
                            .unwrap_or(full_position)
                    };
                    self.add_to_low_res(inner, &prev_img, level - 1, full)?;
                }
                return Ok(());
            }

            // Destination tile at this level
            let (level_position, quadrant_col, quadrant_row) = {
                let positions = self.positions.lock().unwrap();
                (
                    positions.level_index(full_position, level) as i64,
                    positions.grid_col(full_position, level - 1).rem_euclid(2) as u32,
                    positions.grid_row(full_position, level - 1).rem_euclid(2) as u32,
                )
            };
            let store = self.level_store(inner, level)?;
            let existing = store.get_image(channel, slice, frame, level_position);

            let mut dst = match &existing {
                Some(tile) => tile.pix.bytes().to_vec(),
                None => PixelBuffer::filled(
                    inner.background.get(&channel).copied().unwrap_or(0),
                    self.tile_width,
                    self.tile_height,
                    src.byte_depth(),
                    src.is_rgb(),
                )
                .bytes()
                .to_vec(),
            };

            // Level 0 tiles carry the overlap margin; it is trimmed here
            // and never reappears at deeper levels
            let (off_x, off_y) = if level == 1 {
                (self.summary.overlap_x / 2, self.summary.overlap_y / 2)
            } else {
                (0, 0)
            };
            fold_quadrant(
                &src,
                &mut dst,
                self.tile_width,
                self.tile_height,
                quadrant_col,
                quadrant_row,
                off_x,
                off_y,
            );
            let folded = PixelBuffer::new(
                Bytes::from(dst),
                self.tile_width,
                self.tile_height,
                src.byte_depth(),
                src.is_rgb(),
            );

            let store = self.level_store(inner, level)?;
            if existing.is_none() {
                let mut tags = img.tags.clone();
                meta::set_width(&mut tags, self.tile_width);
                meta::set_height(&mut tags, self.tile_height);
                meta::set_position_index(&mut tags, level_position);
                let (row, col) = {
                    let positions = self.positions.lock().unwrap();
                    (
                        positions.grid_row(full_position, level),
                        positions.grid_col(full_position, level),
                    )
                };
                meta::set_grid_row(&mut tags, row);
                meta::set_grid_col(&mut tags, col);
                meta::set_position_name(&mut tags, &format!("Grid_{row}_{col}"));
                store.put_image(TaggedImage::new(folded.clone(), tags))?;
            } else {
                store.overwrite_pixels(&folded, channel, slice, frame, level_position)?;
            }

            src = folded;
            level += 1;
        }
        Ok(())
    }

    fn level_store<'a>(
        &self,
        inner: &'a PyramidInner,
        level: usize,
    ) -> Result<&'a LevelStorage, StorageError> {
        inner
            .low_res
            .get(&level)
            .and_then(|s| s.as_ref())
            .ok_or(StorageError::MissingLevel(level))
    }

    fn create_downsampled_storage(
        &self,
        inner: &mut PyramidInner,
        level: usize,
    ) -> Result<(), StorageError> {
        let ds_dir = self
            .dir
            .join(format!("{DOWNSAMPLE_DIR_PREFIX}{}", 1u64 << level));
        let summary = self
            .summary
            .for_downsampled_level(self.tile_width, self.tile_height);
        debug!("creating resolution level {level} at {}", ds_dir.display());
        let store = LevelStorage::create(&ds_dir, &summary)?;
        inner.low_res.insert(level, Some(store));
        self.positions.lock().unwrap().ensure_levels(level);
        Ok(())
    }

    /// Background estimation from the first image seen per channel.
    fn estimate_background_value(&self, inner: &mut PyramidInner, img: &TaggedImage) {
        let Some(channel) = meta::channel_index(&img.tags) else {
            return;
        };
        if inner.background.contains_key(&channel) {
            return;
        }
        let pix = &img.pix;
        let mut samples =
            Vec::with_capacity((pix.width() * pix.height() * pix.components()) as usize);
        for y in 0..pix.height() {
            for x in 0..pix.width() {
                for c in 0..pix.components() {
                    samples.push(pix.sample(x, y, c));
                }
            }
        }
        samples.sort_unstable();
        let value = samples[(samples.len() as f64 * BACKGROUND_PIXEL_PERCENTILE) as usize];
        inner.background.insert(channel, value);
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Fetch one tile at a resolution level.
    pub fn get_image(
        &self,
        channel: i64,
        slice: i64,
        frame: i64,
        position: i64,
        level: usize,
    ) -> Option<TaggedImage> {
        if level == 0 {
            return self.full_res.get_image(channel, slice, frame, position);
        }
        let inner = self.inner.lock().unwrap();
        inner
            .low_res
            .get(&level)?
            .as_ref()?
            .get_image(channel, slice, frame, position)
    }

    /// Stitch an arbitrary region at a resolution level, loading only the
    /// tiles that intersect it. Missing tiles fill with the channel's
    /// background value.
    pub fn read_region(
        &self,
        channel: i64,
        slice: i64,
        frame: i64,
        level: usize,
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    ) -> TaggedImage {
        let byte_depth = self.summary.byte_depth;
        let rgb = self.summary.rgb;
        let background = self.background_value(channel);
        let mut region = PixelBuffer::filled(background, width, height, byte_depth, rgb)
            .bytes()
            .to_vec();
        let components = if rgb { 3u32 } else { 1 };
        let group = byte_depth as usize * components as usize;

        let tw = self.tile_width as i64;
        let th = self.tile_height as i64;
        let col_start = crate::coords::floor_div(x, tw);
        let col_end = crate::coords::floor_div(x + width as i64 - 1, tw);
        let row_start = crate::coords::floor_div(y, th);
        let row_end = crate::coords::floor_div(y + height as i64 - 1, th);

        let mut top_left_tags: Option<Value> = None;
        for col in col_start..=col_end {
            for row in row_start..=row_end {
                let position = {
                    let positions = self.positions.lock().unwrap();
                    positions.index_at_tile(level, row, col)
                };
                let Some(position) = position else { continue };
                let Some(tile) = self.get_image(channel, slice, frame, position as i64, level)
                else {
                    continue;
                };
                if top_left_tags.is_none() {
                    top_left_tags = Some(tile.tags.clone());
                }

                // Intersection of this tile with the requested region
                let x0 = x.max(col * tw);
                let x1 = (x + width as i64).min((col + 1) * tw);
                let y0 = y.max(row * th);
                let y1 = (y + height as i64).min((row + 1) * th);

                // Level 0 tiles store the overlap margin; address past it
                let (margin_x, margin_y, tile_row_pixels) = if level == 0 {
                    (
                        (self.summary.overlap_x / 2) as i64,
                        (self.summary.overlap_y / 2) as i64,
                        self.summary.width as i64,
                    )
                } else {
                    (0, 0, tw)
                };

                let tile_bytes = tile.pix.bytes();
                for line in y0..y1 {
                    let tile_y = line - row * th + margin_y;
                    let tile_x = x0 - col * tw + margin_x;
                    let src_start = ((tile_y * tile_row_pixels + tile_x) as usize) * group;
                    let src_end = src_start + ((x1 - x0) as usize) * group;
                    let dst_start =
                        (((line - y) * width as i64 + (x0 - x)) as usize) * group;
                    let dst_end = dst_start + ((x1 - x0) as usize) * group;
                    if src_end > tile_bytes.len() || dst_end > region.len() {
                        warn!("tile geometry mismatch while stitching region");
                        continue;
                    }
                    region[dst_start..dst_end]
                        .copy_from_slice(&tile_bytes[src_start..src_end]);
                }
            }
        }

        TaggedImage::new(
            PixelBuffer::new(Bytes::from(region), width, height, byte_depth, rgb),
            top_left_tags.unwrap_or(Value::Null),
        )
    }

    // -------------------------------------------------------------------------
    // Finalize
    // -------------------------------------------------------------------------

    /// Finalize every level. Writer queues are drained before any
    /// container is marked finished, so no image can be lost to the race
    /// between finalize and an in-flight write.
    pub fn finished(&self) -> Result<(), StorageError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let display = self.display_settings();
        let comments = json!({});
        self.full_res.finished(&display, &comments)?;
        let inner = self.inner.lock().unwrap();
        for store in inner.low_res.values().flatten() {
            store.finished(&display, &comments)?;
        }
        Ok(())
    }

    fn display_settings(&self) -> Value {
        let channels: Vec<Value> = (0..self.summary.num_channels as usize)
            .map(|i| {
                json!({
                    "Name": self.summary.channel_names.get(i).cloned()
                        .unwrap_or_else(|| format!("Channel {i}")),
                    "Color": self.summary.channel_colors.get(i).copied().unwrap_or(0xFFFFFF),
                    "Min": 0,
                    "Max": if self.summary.byte_depth == 1 { 255 } else { 65535 },
                    "Gamma": 1.0,
                })
            })
            .collect();
        json!({ "Channels": channels })
    }
}

/// Pick `prefix_N` with the smallest unused N, scanning existing entries.
fn unique_acq_dir_name(root: &Path, prefix: &str) -> Result<String, StorageError> {
    let mut max_index = 0u32;
    for entry in fs::read_dir(root)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if let Some(rest) = name.strip_prefix(&format!("{prefix}_")) {
            if let Ok(n) = rest.parse::<u32>() {
                max_index = max_index.max(n);
            }
        }
    }
    Ok(format!("{prefix}_{}", max_index + 1))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_summary(width: u32, height: u32, overlap: u32) -> SummaryMeta {
        SummaryMeta {
            prefix: "acq".to_string(),
            width,
            height,
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
            overlap_x: overlap,
            overlap_y: overlap,
            affine: "1_0_0_1".to_string(),
            initial_positions: vec![],
        }
    }

    fn grid_positions(rows: i64, cols: i64, tile: f64) -> Vec<XyPosition> {
        let mut positions = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                positions.push(XyPosition::new(r, c, c as f64 * tile, r as f64 * tile));
            }
        }
        positions
    }

    fn image_at(position: usize, row: i64, col: i64, fill: u16, w: u32, h: u32) -> TaggedImage {
        let pix = PixelBuffer::filled(fill, w, h, 1, false);
        let tags = meta::image_tags(
            0,
            0,
            0,
            position as i64,
            row,
            col,
            0.0,
            col as f64 * w as f64,
            row as f64 * h as f64,
            0,
            10.0,
            w,
            h,
        );
        TaggedImage::new(pix, tags)
    }

    #[test]
    fn test_directory_layout_and_unique_naming() {
        let root = tempfile::tempdir().unwrap();
        let summary = test_summary(8, 8, 0);
        let storage =
            PyramidStorage::create(root.path(), &summary, grid_positions(1, 1, 8.0), false)
                .unwrap();
        assert_eq!(storage.acq_name(), "acq_1");
        assert!(root.path().join("acq_1").join(FULL_RES_DIR).exists());

        let second =
            PyramidStorage::create(root.path(), &summary, grid_positions(1, 1, 8.0), false)
                .unwrap();
        assert_eq!(second.acq_name(), "acq_2");
    }

    #[test]
    fn test_single_tile_builds_no_levels() {
        let root = tempfile::tempdir().unwrap();
        let summary = test_summary(8, 8, 0);
        let storage =
            PyramidStorage::create(root.path(), &summary, grid_positions(1, 1, 8.0), false)
                .unwrap();
        storage.put_image(image_at(0, 0, 0, 50, 8, 8)).unwrap();

        // 1x1 grid: num rows/cols < 2, nothing to downsample
        assert_eq!(storage.num_levels(), 1);
        storage.finished().unwrap();
    }

    #[test]
    fn test_pyramid_termination_3x5_grid() {
        let root = tempfile::tempdir().unwrap();
        let summary = test_summary(8, 8, 0);
        let positions = grid_positions(3, 5, 8.0);
        let storage =
            PyramidStorage::create(root.path(), &summary, positions.clone(), false).unwrap();

        for (i, p) in positions.iter().enumerate() {
            storage
                .put_image(image_at(i, p.grid_row, p.grid_col, 40, 8, 8))
                .unwrap();
        }

        // 3x5: level 1 (5 >= 2), level 2 (5 >= 4), but not level 3 (5 < 8)
        assert_eq!(storage.num_levels(), 3);
        assert!(storage
            .disk_location()
            .join("Downsampled_x2")
            .exists());
        assert!(storage
            .disk_location()
            .join("Downsampled_x4")
            .exists());
        assert!(!storage
            .disk_location()
            .join("Downsampled_x8")
            .exists());
        storage.finished().unwrap();
    }

    #[test]
    fn test_forced_deeper_level() {
        let root = tempfile::tempdir().unwrap();
        let summary = test_summary(8, 8, 0);
        let storage =
            PyramidStorage::create(root.path(), &summary, grid_positions(2, 2, 8.0), false)
                .unwrap();
        storage.initialize_to_level(3);
        storage.put_image(image_at(0, 0, 0, 80, 8, 8)).unwrap();

        // 2x2 would stop at level 1, but level 3 was forced
        assert_eq!(storage.num_levels(), 4);
        storage.finished().unwrap();
    }

    #[test]
    fn test_downsampled_tile_averages_siblings() {
        let root = tempfile::tempdir().unwrap();
        let summary = test_summary(8, 8, 0);
        let positions = grid_positions(2, 2, 8.0);
        let storage =
            PyramidStorage::create(root.path(), &summary, positions.clone(), false).unwrap();

        let fills = [100u16, 120, 140, 160];
        for (i, p) in positions.iter().enumerate() {
            storage
                .put_image(image_at(i, p.grid_row, p.grid_col, fills[i], 8, 8))
                .unwrap();
        }
        storage.finished().unwrap();

        // Each quadrant of the level-1 tile holds its sibling's average
        let tile = storage.get_image(0, 0, 0, 0, 1).unwrap();
        assert_eq!(tile.pix.sample(0, 0, 0), 100); // top-left from (0,0)
        assert_eq!(tile.pix.sample(7, 0, 0), 120); // top-right from (0,1)
        assert_eq!(tile.pix.sample(0, 7, 0), 140); // bottom-left from (1,0)
        assert_eq!(tile.pix.sample(7, 7, 0), 160); // bottom-right from (1,1)
    }

    #[test]
    fn test_sibling_order_does_not_matter() {
        let summary = test_summary(8, 8, 0);
        let positions = grid_positions(2, 2, 8.0);
        let fills = [10u16, 20, 30, 40];

        let fold_in_order = |order: &[usize]| {
            let root = tempfile::tempdir().unwrap();
            let storage =
                PyramidStorage::create(root.path(), &summary, positions.clone(), false)
                    .unwrap();
            for &i in order {
                let p = &positions[i];
                storage
                    .put_image(image_at(i, p.grid_row, p.grid_col, fills[i], 8, 8))
                    .unwrap();
            }
            storage.finished().unwrap();
            storage
                .get_image(0, 0, 0, 0, 1)
                .unwrap()
                .pix
                .bytes()
                .to_vec()
        };

        let reference = fold_in_order(&[0, 1, 2, 3]);
        assert_eq!(fold_in_order(&[3, 1, 0, 2]), reference);
        assert_eq!(fold_in_order(&[2, 3, 0, 1]), reference);
    }

    #[test]
    fn test_overlap_trimmed_once() {
        let root = tempfile::tempdir().unwrap();
        // 12x12 stored tiles with 4 pixels of overlap: logical tiles 8x8
        let summary = test_summary(12, 12, 4);
        let storage =
            PyramidStorage::create(root.path(), &summary, grid_positions(2, 1, 8.0), false)
                .unwrap();
        assert_eq!(storage.tile_width(), 8);

        storage.put_image(image_at(0, 0, 0, 60, 12, 12)).unwrap();
        storage.put_image(image_at(1, 1, 0, 90, 12, 12)).unwrap();
        storage.finished().unwrap();

        let tile = storage.get_image(0, 0, 0, 0, 1).unwrap();
        assert_eq!(tile.pix.width(), 8);
        assert_eq!(tile.pix.sample(0, 0, 0), 60);
        assert_eq!(tile.pix.sample(0, 7, 0), 90);
    }

    #[test]
    fn test_background_estimation_fills_gaps() {
        let root = tempfile::tempdir().unwrap();
        let summary = test_summary(8, 8, 0);
        // 2x2 grid but only one tile ever arrives
        let storage =
            PyramidStorage::create(root.path(), &summary, grid_positions(2, 2, 8.0), true)
                .unwrap();
        storage.put_image(image_at(3, 1, 1, 200, 8, 8)).unwrap();
        storage.finished().unwrap();

        assert_eq!(storage.background_value(0), 200);
        let tile = storage.get_image(0, 0, 0, 0, 1).unwrap();
        // Quadrant (1,1) holds data; the others are background fill
        assert_eq!(tile.pix.sample(7, 7, 0), 200);
        assert_eq!(tile.pix.sample(0, 0, 0), 200);
    }

    #[test]
    fn test_read_region_stitches_and_fills() {
        let root = tempfile::tempdir().unwrap();
        let summary = test_summary(8, 8, 0);
        let positions = grid_positions(1, 2, 8.0);
        let storage =
            PyramidStorage::create(root.path(), &summary, positions.clone(), false).unwrap();
        storage.put_image(image_at(0, 0, 0, 11, 8, 8)).unwrap();
        storage.put_image(image_at(1, 0, 1, 22, 8, 8)).unwrap();
        storage.finished().unwrap();

        // Span the seam between the two tiles
        let region = storage.read_region(0, 0, 0, 0, 4, 0, 8, 4);
        assert_eq!(region.pix.sample(0, 0, 0), 11);
        assert_eq!(region.pix.sample(7, 0, 0), 22);

        // Outside any tile: background (0)
        let empty = storage.read_region(0, 0, 0, 0, 100, 100, 4, 4);
        assert_eq!(empty.pix.sample(0, 0, 0), 0);
    }

    #[test]
    fn test_reopen_from_disk() {
        let root = tempfile::tempdir().unwrap();
        let summary = test_summary(8, 8, 0);
        let positions = grid_positions(2, 2, 8.0);
        let dir;
        {
            let storage =
                PyramidStorage::create(root.path(), &summary, positions.clone(), false)
                    .unwrap();
            for (i, p) in positions.iter().enumerate() {
                storage
                    .put_image(image_at(i, p.grid_row, p.grid_col, 70, 8, 8))
                    .unwrap();
            }
            storage.finished().unwrap();
            dir = storage.disk_location().to_path_buf();
        }

        let reopened = PyramidStorage::open(&dir).unwrap();
        assert!(reopened.is_finished());
        assert_eq!(reopened.num_levels(), 2);
        assert_eq!(reopened.num_rows(), 2);
        assert_eq!(reopened.num_cols(), 2);
        let tile = reopened.get_image(0, 0, 0, 0, 0).unwrap();
        assert_eq!(tile.pix.sample(0, 0, 0), 70);
        let ds = reopened.get_image(0, 0, 0, 0, 1).unwrap();
        assert_eq!(ds.pix.sample(3, 3, 0), 70);
    }

    #[test]
    fn test_refused_after_finished() {
        let root = tempfile::tempdir().unwrap();
        let summary = test_summary(8, 8, 0);
        let storage =
            PyramidStorage::create(root.path(), &summary, grid_positions(1, 1, 8.0), false)
                .unwrap();
        storage.finished().unwrap();
        assert!(matches!(
            storage.put_image(image_at(0, 0, 0, 1, 8, 8)),
            Err(StorageError::Finished)
        ));
    }
}
