//! Metadata document schema and accessors.
//!
//! Summary and per-image metadata travel as JSON documents. The container
//! stores them as length-prefixed UTF-8 text, so the schema is a set of
//! well-known keys rather than a rigid struct; this module centralizes the
//! key names and typed access.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// =============================================================================
// Labels
// =============================================================================

/// Image label for index keys: `channel_slice_frame_position`.
pub fn label(channel: i64, slice: i64, frame: i64, position: i64) -> String {
    format!("{channel}_{slice}_{frame}_{position}")
}

/// Parse a `c_s_f_p` label back into its four indices.
pub fn parse_label(label: &str) -> Option<[i64; 4]> {
    let mut parts = label.split('_');
    let out = [
        parts.next()?.parse().ok()?,
        parts.next()?.parse().ok()?,
        parts.next()?.parse().ok()?,
        parts.next()?.parse().ok()?,
    ];
    parts.next().is_none().then_some(out)
}

/// Label of an image's metadata document.
pub fn label_of(tags: &Value) -> Option<String> {
    Some(label(
        channel_index(tags)?,
        slice_index(tags)?,
        frame_index(tags)?,
        position_index(tags)?,
    ))
}

// =============================================================================
// Summary metadata
// =============================================================================

/// Summary metadata written once per container.
///
/// `width`/`height` are the stored tile dimensions for the level the
/// container belongs to: full resolution includes the tile overlap, lower
/// resolutions do not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryMeta {
    #[serde(rename = "Prefix")]
    pub prefix: String,

    #[serde(rename = "Width")]
    pub width: u32,

    #[serde(rename = "Height")]
    pub height: u32,

    #[serde(rename = "ByteDepth")]
    pub byte_depth: u8,

    #[serde(rename = "RGB")]
    pub rgb: bool,

    #[serde(rename = "NumChannels")]
    pub num_channels: u32,

    #[serde(rename = "ChNames")]
    pub channel_names: Vec<String>,

    /// Packed 0xRRGGBB display colors, one per channel
    #[serde(rename = "ChColors")]
    pub channel_colors: Vec<u32>,

    /// Initial estimate only; the true count is discovered while running
    #[serde(rename = "NumFrames")]
    pub num_frames: u32,

    /// Initial estimate only
    #[serde(rename = "NumSlices")]
    pub num_slices: u32,

    #[serde(rename = "PixelSizeUm")]
    pub pixel_size_um: f64,

    #[serde(rename = "ZStepUm")]
    pub z_step_um: f64,

    #[serde(rename = "IntervalMs")]
    pub interval_ms: f64,

    #[serde(rename = "PixelOverlapX")]
    pub overlap_x: u32,

    #[serde(rename = "PixelOverlapY")]
    pub overlap_y: u32,

    #[serde(rename = "AffineTransform")]
    pub affine: String,

    /// Initial position list: one document per position with grid row/col
    /// and stage coordinates
    #[serde(rename = "InitialPositionList")]
    pub initial_positions: Vec<Value>,
}

impl SummaryMeta {
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_document(doc: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(doc.clone())
    }

    /// Copy for a downsampled level: same acquisition, overlap-free tiles.
    pub fn for_downsampled_level(&self, tile_width: u32, tile_height: u32) -> Self {
        let mut smd = self.clone();
        smd.width = tile_width;
        smd.height = tile_height;
        smd.overlap_x = 0;
        smd.overlap_y = 0;
        smd
    }
}

/// Initial-position-list entry document.
pub fn position_document(grid_row: i64, grid_col: i64, stage_x: f64, stage_y: f64) -> Value {
    json!({
        "GridRowIndex": grid_row,
        "GridColumnIndex": grid_col,
        "StageXUm": stage_x,
        "StageYUm": stage_y,
    })
}

// =============================================================================
// Per-image tag access
// =============================================================================

fn get_i64(tags: &Value, key: &str) -> Option<i64> {
    tags.get(key)?.as_i64()
}

fn get_f64(tags: &Value, key: &str) -> Option<f64> {
    tags.get(key)?.as_f64()
}

pub fn channel_index(tags: &Value) -> Option<i64> {
    get_i64(tags, "ChannelIndex")
}

pub fn slice_index(tags: &Value) -> Option<i64> {
    get_i64(tags, "SliceIndex")
}

pub fn frame_index(tags: &Value) -> Option<i64> {
    get_i64(tags, "FrameIndex")
}

pub fn position_index(tags: &Value) -> Option<i64> {
    get_i64(tags, "PositionIndex")
}

pub fn grid_row(tags: &Value) -> Option<i64> {
    get_i64(tags, "GridRowIndex")
}

pub fn grid_col(tags: &Value) -> Option<i64> {
    get_i64(tags, "GridColumnIndex")
}

pub fn stage_x(tags: &Value) -> Option<f64> {
    get_f64(tags, "XPositionUm")
}

pub fn stage_y(tags: &Value) -> Option<f64> {
    get_f64(tags, "YPositionUm")
}

pub fn set_width(tags: &mut Value, width: u32) {
    tags["Width"] = json!(width);
}

pub fn set_height(tags: &mut Value, height: u32) {
    tags["Height"] = json!(height);
}

pub fn set_position_index(tags: &mut Value, index: i64) {
    tags["PositionIndex"] = json!(index);
}

pub fn set_position_name(tags: &mut Value, name: &str) {
    tags["PositionName"] = json!(name);
}

pub fn set_grid_row(tags: &mut Value, row: i64) {
    tags["GridRowIndex"] = json!(row);
}

pub fn set_grid_col(tags: &mut Value, col: i64) {
    tags["GridColumnIndex"] = json!(col);
}

/// Build the per-image document attached by the engine at capture time.
#[allow(clippy::too_many_arguments)]
pub fn image_tags(
    channel_index: i64,
    slice_index: i64,
    frame_index: i64,
    position_index: i64,
    grid_row: i64,
    grid_col: i64,
    z_um: f64,
    stage_x: f64,
    stage_y: f64,
    elapsed_ms: i64,
    exposure_ms: f64,
    width: u32,
    height: u32,
) -> Value {
    json!({
        "ChannelIndex": channel_index,
        "SliceIndex": slice_index,
        "FrameIndex": frame_index,
        "PositionIndex": position_index,
        "PositionName": format!("Grid_{grid_row}_{grid_col}"),
        "GridRowIndex": grid_row,
        "GridColumnIndex": grid_col,
        "ZPositionUm": z_um,
        "XPositionUm": stage_x,
        "YPositionUm": stage_y,
        "ElapsedTimeMs": elapsed_ms,
        "Exposure": exposure_ms,
        "Time": chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        "Width": width,
        "Height": height,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_round_trip() {
        assert_eq!(label(1, 2, 3, 4), "1_2_3_4");
        assert_eq!(parse_label("1_2_3_4"), Some([1, 2, 3, 4]));
        assert_eq!(parse_label("0_-3_0_12"), Some([0, -3, 0, 12]));
        assert_eq!(parse_label("1_2_3"), None);
        assert_eq!(parse_label("1_2_3_x"), None);
        assert_eq!(parse_label("1_2_3_4_5"), None);
    }

    #[test]
    fn test_image_tags_label() {
        let tags = image_tags(1, 2, 3, 4, 0, 0, 5.0, 0.0, 0.0, 100, 10.0, 64, 64);
        assert_eq!(label_of(&tags).unwrap(), "1_2_3_4");
        assert_eq!(tags["PositionName"], "Grid_0_0");
    }

    #[test]
    fn test_summary_document_round_trip() {
        let summary = SummaryMeta {
            prefix: "acq".to_string(),
            width: 512,
            height: 512,
            byte_depth: 1,
            rgb: false,
            num_channels: 2,
            channel_names: vec!["DAPI".to_string(), "GFP".to_string()],
            channel_colors: vec![0x0000FF, 0x00FF00],
            num_frames: 3,
            num_slices: 5,
            pixel_size_um: 0.5,
            z_step_um: 1.0,
            interval_ms: 1000.0,
            overlap_x: 32,
            overlap_y: 32,
            affine: "0.5_0_0_0.5".to_string(),
            initial_positions: vec![position_document(0, 0, 0.0, 0.0)],
        };

        let doc = summary.to_document();
        let parsed = SummaryMeta::from_document(&doc).unwrap();
        assert_eq!(parsed.width, 512);
        assert_eq!(parsed.channel_names, summary.channel_names);
        assert_eq!(parsed.overlap_x, 32);
    }

    #[test]
    fn test_downsampled_summary_drops_overlap() {
        let mut summary = SummaryMeta {
            prefix: "acq".to_string(),
            width: 512,
            height: 512,
            byte_depth: 1,
            rgb: false,
            num_channels: 1,
            channel_names: vec!["C0".to_string()],
            channel_colors: vec![0xFFFFFF],
            num_frames: 1,
            num_slices: 1,
            pixel_size_um: 0.5,
            z_step_um: 1.0,
            interval_ms: 0.0,
            overlap_x: 12,
            overlap_y: 12,
            affine: "1_0_0_1".to_string(),
            initial_positions: vec![],
        };
        summary.overlap_x = 12;
        let ds = summary.for_downsampled_level(500, 500);
        assert_eq!(ds.width, 500);
        assert_eq!(ds.overlap_x, 0);
        assert_eq!(ds.prefix, "acq");
    }
}
