//! Container writer.
//!
//! Appends image directories and pixel strips to a container file while
//! keeping an in-place-updatable index map near the start of the file, so
//! a crashed run still leaves every completed image reachable. The file is
//! finalized in two steps: [`TiffWriter::finish`] terminates the directory
//! chain and patches the true index count; [`TiffWriter::close`] appends
//! the nonessential extras (description, display settings, comments) and
//! truncates, after which the file is read-only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::warn;

use crate::error::TiffError;
use crate::storage::image::TaggedImage;
use crate::storage::meta::{self, SummaryMeta};

use super::log::WriteLog;
use super::tags::{
    ByteOrder, FieldType, Tag, BYTE_ORDER_LITTLE_ENDIAN, COMMENTS_MARKER,
    COMMENTS_OFFSET_MARKER, DISPLAY_SETTINGS_BYTES_PER_CHANNEL, DISPLAY_SETTINGS_MARKER,
    DISPLAY_SETTINGS_OFFSET_MARKER, ENTRIES_PER_IFD, FIRST_IFD_EXTRA_ENTRIES,
    INDEX_ENTRY_SIZE, INDEX_MAP_MARKER, INDEX_MAP_OFFSET_MARKER, PRELUDE_SIZE,
    SUMMARY_MD_MARKER, VERSION_TIFF,
};
use super::{IndexEntry, SharedIndex, TiffReader};

/// Classic-TIFF offsets are 32-bit; writes may not cross this ceiling.
const MAX_CONTAINER_BYTES: u64 = u32::MAX as u64;

/// Bounds on the pre-sized index-map region, in entries.
const MIN_INDEX_ENTRIES: u32 = 256;
const MAX_INDEX_ENTRIES: u32 = 65_536;

// =============================================================================
// TiffWriter
// =============================================================================

/// Writer half of a container file.
pub struct TiffWriter {
    log: WriteLog,
    index: SharedIndex,
    path: PathBuf,

    summary: SummaryMeta,
    bytes_per_image: u64,

    /// Resolution rationals derived from the pixel size
    res_numerator: u32,
    res_denominator: u32,

    /// Next free slot in the on-disk index-map region
    index_entry_pos: u64,

    /// Offset of the max-entries word, patched to the true count at finish
    index_count_pos: u64,
    index_capacity: u32,
    entries_written: u32,

    /// Location of the next-directory offset in the last written directory
    next_ifd_offset_pos: Option<u64>,

    first_ifd: bool,

    /// First-directory tag positions patched at close
    description_tag_pos: u64,
    ij_counts_tag_pos: u64,
    ij_data_tag_pos: u64,

    finished: bool,
    closed: bool,
}

impl TiffWriter {
    /// Create a container at `path` and write its prelude, summary
    /// metadata, and zeroed index-map region.
    pub fn create(path: &Path, summary: &SummaryMeta) -> Result<Self, TiffError> {
        let mut log = WriteLog::create(path)?;

        let summary_doc = summary.to_document();
        let md_bytes = serde_json::to_vec(&summary_doc)?;
        let md_len = md_bytes.len() as u32;

        let index_capacity = index_capacity_for(summary);
        let index_region_len = 8 + index_capacity as u64 * INDEX_ENTRY_SIZE as u64;
        let index_map_offset = PRELUDE_SIZE as u64 + md_len as u64;
        let mut first_ifd_offset = index_map_offset + index_region_len;
        if first_ifd_offset % 2 == 1 {
            first_ifd_offset += 1;
        }

        let mut prelude = Vec::with_capacity(PRELUDE_SIZE);
        prelude.extend_from_slice(&BYTE_ORDER_LITTLE_ENDIAN.to_le_bytes());
        prelude.extend_from_slice(&VERSION_TIFF.to_le_bytes());
        prelude.extend_from_slice(&(first_ifd_offset as u32).to_le_bytes());
        prelude.extend_from_slice(&INDEX_MAP_OFFSET_MARKER.to_le_bytes());
        prelude.extend_from_slice(&(index_map_offset as u32).to_le_bytes());
        prelude.extend_from_slice(&DISPLAY_SETTINGS_OFFSET_MARKER.to_le_bytes());
        prelude.extend_from_slice(&0u32.to_le_bytes());
        prelude.extend_from_slice(&COMMENTS_OFFSET_MARKER.to_le_bytes());
        prelude.extend_from_slice(&0u32.to_le_bytes());
        prelude.extend_from_slice(&SUMMARY_MD_MARKER.to_le_bytes());
        prelude.extend_from_slice(&md_len.to_le_bytes());

        let mut index_region = Vec::with_capacity(index_region_len as usize);
        index_region.extend_from_slice(&INDEX_MAP_MARKER.to_le_bytes());
        index_region.extend_from_slice(&index_capacity.to_le_bytes());
        index_region.resize(index_region_len as usize, 0);

        log.append(Bytes::from(prelude))?;
        log.append(Bytes::from(md_bytes))?;
        log.append(Bytes::from(index_region))?;
        log.pad_to_word()?;

        let components: u64 = if summary.rgb { 3 } else { 1 };
        let bytes_per_image = summary.width as u64
            * summary.height as u64
            * summary.byte_depth as u64
            * components;
        let (res_numerator, res_denominator) = resolution_rationals(summary.pixel_size_um);

        Ok(Self {
            log,
            index: Arc::new(Mutex::new(HashMap::new())),
            path: path.to_path_buf(),
            summary: summary.clone(),
            bytes_per_image,
            res_numerator,
            res_denominator,
            index_entry_pos: index_map_offset + 8,
            index_count_pos: index_map_offset + 4,
            index_capacity,
            entries_written: 0,
            next_ifd_offset_pos: None,
            first_ifd: true,
            description_tag_pos: 0,
            ij_counts_tag_pos: 0,
            ij_data_tag_pos: 0,
            finished: false,
            closed: false,
        })
    }

    /// The live index map, for sharing with a reader.
    pub fn index(&self) -> SharedIndex {
        Arc::clone(&self.index)
    }

    /// Open a reader over this container sharing the live index map.
    pub fn reader(&self) -> Result<TiffReader, TiffError> {
        TiffReader::attach(
            &self.path,
            Arc::clone(&self.index),
            self.summary.to_document(),
            ByteOrder::LittleEndian,
        )
    }

    /// Whether another image of the container's geometry fits under the
    /// offset ceiling.
    pub fn has_space_to_write(&self) -> bool {
        // Directory + rationals + a generous metadata allowance
        let per_image = self.bytes_per_image + 1024;
        self.log.position() + per_image
            + (self.summary.num_channels as u64
                * DISPLAY_SETTINGS_BYTES_PER_CHANNEL as u64)
            < MAX_CONTAINER_BYTES
    }

    /// Append one image: directory entries, pixel strip, resolution
    /// rationals, and the per-image metadata document, then record the
    /// directory offset in the index map.
    pub fn write_image(&mut self, img: &TaggedImage) -> Result<(), TiffError> {
        if self.finished {
            return Err(TiffError::Finished);
        }
        let pix_len = img.pix.bytes().len() as u64;
        if pix_len != self.bytes_per_image {
            return Err(TiffError::StripLengthMismatch {
                expected: self.bytes_per_image,
                actual: pix_len,
            });
        }

        let md_bytes = serde_json::to_vec(&img.tags)?;
        let label = meta::label_of(&img.tags).ok_or(TiffError::MissingTag("ChannelIndex"))?;

        let num_entries = if self.first_ifd {
            ENTRIES_PER_IFD + FIRST_IFD_EXTRA_ENTRIES
        } else {
            ENTRIES_PER_IFD
        };
        let rgb = self.summary.rgb;
        let ifd_size = 2 + num_entries as u64 * 12 + 4;
        let bits_extra = if rgb { 6u64 } else { 0 };

        let ifd_offset = self.log.position();
        let strip_offset = ifd_offset + ifd_size + bits_extra;
        let res_offset = strip_offset + pix_len;
        let md_offset = res_offset + 16;
        let mut next_ifd = md_offset + md_bytes.len() as u64;
        if next_ifd % 2 == 1 {
            next_ifd += 1;
        }

        if next_ifd >= MAX_CONTAINER_BYTES {
            return Err(TiffError::ContainerFull {
                requested: (next_ifd - ifd_offset) as usize,
            });
        }

        // Build the directory. Entries must be in ascending tag order.
        let mut ifd = IfdBuilder::new(num_entries, ifd_offset);
        ifd.entry(Tag::ImageWidth, FieldType::Long, 1, self.summary.width);
        ifd.entry(Tag::ImageLength, FieldType::Long, 1, self.summary.height);
        if rgb {
            // Three shorts do not fit inline; they sit right after the IFD
            ifd.entry(
                Tag::BitsPerSample,
                FieldType::Short,
                3,
                (ifd_offset + ifd_size) as u32,
            );
        } else {
            ifd.entry(
                Tag::BitsPerSample,
                FieldType::Short,
                1,
                img.pix.bits_per_sample() as u32,
            );
        }
        ifd.entry(Tag::Compression, FieldType::Short, 1, 1);
        ifd.entry(
            Tag::PhotometricInterpretation,
            FieldType::Short,
            1,
            if rgb { 2 } else { 1 },
        );
        if self.first_ifd {
            self.description_tag_pos = ifd.next_entry_pos();
            ifd.entry(Tag::ImageDescription, FieldType::Ascii, 0, 0);
        }
        ifd.entry(Tag::StripOffsets, FieldType::Long, 1, strip_offset as u32);
        ifd.entry(
            Tag::SamplesPerPixel,
            FieldType::Short,
            1,
            img.pix.components(),
        );
        ifd.entry(Tag::RowsPerStrip, FieldType::Short, 1, self.summary.height);
        ifd.entry(Tag::StripByteCounts, FieldType::Long, 1, pix_len as u32);
        ifd.entry(Tag::XResolution, FieldType::Rational, 1, res_offset as u32);
        ifd.entry(
            Tag::YResolution,
            FieldType::Rational,
            1,
            (res_offset + 8) as u32,
        );
        // Resolution unit 3 = centimeter
        ifd.entry(Tag::ResolutionUnit, FieldType::Short, 1, 3);
        if self.first_ifd {
            self.ij_counts_tag_pos = ifd.next_entry_pos();
            ifd.entry(Tag::IjMetadataByteCounts, FieldType::Long, 0, 0);
            self.ij_data_tag_pos = ifd.next_entry_pos();
            ifd.entry(Tag::IjMetadata, FieldType::Byte, 0, 0);
        }
        ifd.entry(
            Tag::AppMetadata,
            FieldType::Ascii,
            md_bytes.len() as u32,
            md_offset as u32,
        );
        let next_ifd_offset_pos = ifd.finish(next_ifd as u32);
        let mut ifd_buf = ifd.into_bytes();
        if rgb {
            let bits = img.pix.bits_per_sample();
            for _ in 0..3 {
                ifd_buf.extend_from_slice(&bits.to_le_bytes());
            }
        }

        let mut rationals = Vec::with_capacity(16);
        rationals.extend_from_slice(&self.res_numerator.to_le_bytes());
        rationals.extend_from_slice(&self.res_denominator.to_le_bytes());
        rationals.extend_from_slice(&self.res_numerator.to_le_bytes());
        rationals.extend_from_slice(&self.res_denominator.to_le_bytes());

        self.log.append(Bytes::from(ifd_buf))?;
        self.log.append(img.pix.bytes().clone())?;
        self.log.append(Bytes::from(rationals))?;
        self.log.append(Bytes::from(md_bytes))?;
        self.log.pad_to_word()?;

        self.next_ifd_offset_pos = Some(next_ifd_offset_pos);
        self.first_ifd = false;

        self.record_index_entry(&label, ifd_offset, strip_offset, pix_len)?;
        Ok(())
    }

    /// Rewrite only the pixel strip of an already-written label. The
    /// directory and metadata bytes are untouched.
    pub fn overwrite_pixels(
        &mut self,
        label: &str,
        pix: &Bytes,
    ) -> Result<(), TiffError> {
        if self.closed {
            return Err(TiffError::Finished);
        }
        let entry = {
            let index = self.index.lock().unwrap();
            *index
                .get(label)
                .ok_or_else(|| TiffError::UnknownLabel(label.to_string()))?
        };
        if pix.len() as u64 != entry.strip_len {
            return Err(TiffError::StripLengthMismatch {
                expected: entry.strip_len,
                actual: pix.len() as u64,
            });
        }
        self.log.patch(entry.strip_offset, pix.clone())
    }

    /// Run a callback on the writer thread once all writes enqueued so far
    /// have been issued.
    pub fn after_pending(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<(), TiffError> {
        self.log.after_pending(callback)
    }

    /// Terminate the directory chain and patch the true index count.
    ///
    /// After this no more images may be written; the extras written by
    /// [`close`](Self::close) are still pending.
    pub fn finish(&mut self) -> Result<(), TiffError> {
        if self.finished {
            return Ok(());
        }
        if let Some(pos) = self.next_ifd_offset_pos {
            self.log.patch(pos, Bytes::from(0u32.to_le_bytes().to_vec()))?;
        }
        self.log.patch(
            self.index_count_pos,
            Bytes::from(self.entries_written.to_le_bytes().to_vec()),
        )?;
        self.log.drain()?;
        self.finished = true;
        Ok(())
    }

    /// Append finalize-time extras and truncate the file.
    ///
    /// Writes the free-text description, the display-range/LUT block for
    /// the first directory, the display-settings document, and the
    /// comments document, then truncates to the actual length. The file is
    /// read-only afterwards.
    pub fn close(
        &mut self,
        display_settings: &serde_json::Value,
        comments: &serde_json::Value,
    ) -> Result<(), TiffError> {
        if self.closed {
            return Ok(());
        }
        self.finish()?;

        if self.description_tag_pos != 0 {
            self.write_ij_metadata(display_settings)?;
            self.write_description()?;
        }
        self.write_offset_block(
            DISPLAY_SETTINGS_MARKER,
            20,
            display_settings,
            Some(self.summary.num_channels as usize * DISPLAY_SETTINGS_BYTES_PER_CHANNEL),
        )?;
        self.write_offset_block(COMMENTS_MARKER, 28, comments, None)?;

        // Extra word of slack so nothing lands past the end
        self.log.truncate(self.log.position() + 8)?;
        self.log.drain()?;
        self.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Labels currently reachable through the index map.
    pub fn labels(&self) -> Vec<String> {
        self.index.lock().unwrap().keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn record_index_entry(
        &mut self,
        label: &str,
        ifd_offset: u64,
        strip_offset: u64,
        strip_len: u64,
    ) -> Result<(), TiffError> {
        // Last write wins; a relabeled offset supersedes the old directory
        self.index.lock().unwrap().insert(
            label.to_string(),
            IndexEntry {
                ifd_offset,
                strip_offset,
                strip_len,
            },
        );

        if self.entries_written >= self.index_capacity {
            // The image stays reachable through the live map; only the
            // on-disk map is out of slots
            warn!("index map region full ({} entries); label {label} not indexed on disk",
                self.index_capacity);
            return Ok(());
        }
        let indices =
            meta::parse_label(label).ok_or(TiffError::MissingTag("ChannelIndex"))?;
        let mut entry = Vec::with_capacity(INDEX_ENTRY_SIZE);
        for v in indices {
            entry.extend_from_slice(&(v as i32).to_le_bytes());
        }
        entry.extend_from_slice(&(ifd_offset as u32).to_le_bytes());
        self.log.patch(self.index_entry_pos, Bytes::from(entry))?;
        self.index_entry_pos += INDEX_ENTRY_SIZE as u64;
        self.entries_written += 1;
        Ok(())
    }

    fn write_description(&mut self) -> Result<(), TiffError> {
        let mut text = String::new();
        if self.summary.num_channels > 1 {
            text.push_str(&format!("channels={}\n", self.summary.num_channels));
        }
        if self.summary.num_slices > 1 {
            text.push_str(&format!("slices={}\n", self.summary.num_slices));
        }
        if self.summary.num_frames > 1 {
            text.push_str(&format!("frames={}\n", self.summary.num_frames));
        }
        text.push_str("unit=um\n");
        if self.summary.num_slices > 1 {
            text.push_str(&format!("spacing={}\n", self.summary.z_step_um));
        }
        text.push('\0');

        let bytes = Bytes::from(text.into_bytes());
        let offset = self.log.position();
        let len = bytes.len() as u32;
        self.log.append(bytes)?;
        self.log.pad_to_word()?;

        let mut patch = Vec::with_capacity(8);
        patch.extend_from_slice(&len.to_le_bytes());
        patch.extend_from_slice(&(offset as u32).to_le_bytes());
        self.log.patch(self.description_tag_pos + 4, Bytes::from(patch))
    }

    /// Display-range and LUT block referenced from the first directory.
    fn write_ij_metadata(
        &mut self,
        display_settings: &serde_json::Value,
    ) -> Result<(), TiffError> {
        let nc = self.summary.num_channels as usize;
        let channels = display_settings
            .get("Channels")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();

        // Byte-counts block: header size, display-ranges size, one LUT
        // size per channel
        let mut counts = Vec::new();
        counts.extend_from_slice(&((4 + 2 * 8) as u32).to_le_bytes());
        counts.extend_from_slice(&((nc * 16) as u32).to_le_bytes());
        for _ in 0..nc {
            counts.extend_from_slice(&768u32.to_le_bytes());
        }

        // Data block: magic, type/count table, ranges, LUTs
        let mut data = Vec::new();
        data.extend_from_slice(&0x494a_494au32.to_le_bytes());
        data.extend_from_slice(&0x7261_6e67u32.to_le_bytes()); // display ranges
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&0x6c75_7473u32.to_le_bytes()); // luts
        data.extend_from_slice(&(nc as u32).to_le_bytes());
        for i in 0..nc {
            let (min, max) = channel_range(channels.get(i));
            data.extend_from_slice(&min.to_le_bytes());
            data.extend_from_slice(&max.to_le_bytes());
        }
        for i in 0..nc {
            let (color, gamma) = channel_lut_params(channels.get(i));
            data.extend_from_slice(&make_lut(color, gamma));
        }

        let counts_offset = self.log.position();
        let num_entries = (2 + nc) as u32;
        let counts_len = counts.len();
        self.log.append(Bytes::from(counts))?;
        let data_offset = self.log.position();
        let data_len = data.len();
        self.log.append(Bytes::from(data))?;
        self.log.pad_to_word()?;
        debug_assert_eq!(counts_len, 4 * (2 + nc));

        let mut patch = Vec::with_capacity(8);
        patch.extend_from_slice(&num_entries.to_le_bytes());
        patch.extend_from_slice(&(counts_offset as u32).to_le_bytes());
        self.log.patch(self.ij_counts_tag_pos + 4, Bytes::from(patch))?;

        let mut patch = Vec::with_capacity(8);
        patch.extend_from_slice(&(data_len as u32).to_le_bytes());
        patch.extend_from_slice(&(data_offset as u32).to_le_bytes());
        self.log.patch(self.ij_data_tag_pos + 4, Bytes::from(patch))
    }

    /// Append a `[marker, length, document]` block and patch its offset
    /// into the prelude at `prelude_pos`.
    fn write_offset_block(
        &mut self,
        marker: u32,
        prelude_pos: u64,
        doc: &serde_json::Value,
        reserve: Option<usize>,
    ) -> Result<(), TiffError> {
        let body = serde_json::to_vec(doc)?;
        let block_offset = self.log.position();

        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(&marker.to_le_bytes());
        let declared = reserve.unwrap_or(body.len()).max(body.len());
        header.extend_from_slice(&(declared as u32).to_le_bytes());
        self.log.append(Bytes::from(header))?;
        self.log.append(Bytes::from(body))?;
        if let Some(reserved) = reserve {
            let written = self.log.position() - block_offset - 8;
            if (written as usize) < reserved {
                self.log
                    .append(Bytes::from(vec![0u8; reserved - written as usize]))?;
            }
        }
        self.log.pad_to_word()?;

        self.log.patch(
            prelude_pos,
            Bytes::from((block_offset as u32).to_le_bytes().to_vec()),
        )
    }
}

// =============================================================================
// IfdBuilder
// =============================================================================

/// Incrementally builds one image directory.
struct IfdBuilder {
    buf: Vec<u8>,
    base_offset: u64,
}

impl IfdBuilder {
    fn new(num_entries: u16, base_offset: u64) -> Self {
        let mut buf = Vec::with_capacity(2 + num_entries as usize * 12 + 4);
        buf.extend_from_slice(&num_entries.to_le_bytes());
        Self { buf, base_offset }
    }

    /// File offset where the next entry will start.
    fn next_entry_pos(&self) -> u64 {
        self.base_offset + self.buf.len() as u64
    }

    fn entry(&mut self, tag: Tag, field_type: FieldType, count: u32, value: u32) {
        self.buf.extend_from_slice(&tag.as_u16().to_le_bytes());
        self.buf
            .extend_from_slice(&field_type.as_u16().to_le_bytes());
        self.buf.extend_from_slice(&count.to_le_bytes());
        if field_type == FieldType::Short && count == 1 {
            // Left-justified in the 4-byte value field
            self.buf.extend_from_slice(&(value as u16).to_le_bytes());
            self.buf.extend_from_slice(&0u16.to_le_bytes());
        } else {
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Write the next-directory offset; returns its file position so the
    /// chain can be null-terminated later.
    fn finish(&mut self, next_ifd_offset: u32) -> u64 {
        let pos = self.base_offset + self.buf.len() as u64;
        self.buf.extend_from_slice(&next_ifd_offset.to_le_bytes());
        pos
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn index_capacity_for(summary: &SummaryMeta) -> u32 {
    let positions = summary.initial_positions.len().max(1) as u64;
    let estimate = summary.num_frames as u64
        * summary.num_slices.max(1) as u64
        * summary.num_channels.max(1) as u64
        * positions
        * 2;
    estimate.clamp(MIN_INDEX_ENTRIES as u64, MAX_INDEX_ENTRIES as u64) as u32
}

/// Pixels-per-centimeter rationals for the resolution tags.
fn resolution_rationals(pixel_size_um: f64) -> (u32, u32) {
    let cm_per_pixel = 1e-4 * if pixel_size_um > 0.0 { pixel_size_um } else { 1.0 };
    if cm_per_pixel >= 1.0 {
        (1, cm_per_pixel as u32)
    } else {
        ((1.0 / cm_per_pixel) as u32, 1)
    }
}

fn channel_range(channel: Option<&serde_json::Value>) -> (f64, f64) {
    let min = channel
        .and_then(|c| c.get("Min"))
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    let max = channel
        .and_then(|c| c.get("Max"))
        .and_then(|v| v.as_f64())
        .unwrap_or(255.0);
    (min, max)
}

fn channel_lut_params(channel: Option<&serde_json::Value>) -> (u32, f64) {
    let color = channel
        .and_then(|c| c.get("Color"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0xFFFFFF) as u32;
    let gamma = channel
        .and_then(|c| c.get("Gamma"))
        .and_then(|v| v.as_f64())
        .unwrap_or(1.0);
    (color, gamma)
}

/// 256-entry RGB lookup table for a channel color with gamma.
fn make_lut(color: u32, gamma: f64) -> Vec<u8> {
    let r = ((color >> 16) & 0xFF) as f64;
    let g = ((color >> 8) & 0xFF) as f64;
    let b = (color & 0xFF) as f64;

    let mut lut = vec![0u8; 768];
    for x in 0..256usize {
        let xn = x as f64 / 255.0;
        let yn = xn.powf(gamma);
        lut[x] = (yn * r) as u8;
        lut[256 + x] = (yn * g) as u8;
        lut[512 + x] = (yn * b) as u8;
    }
    lut
}

// =============================================================================
// Tests
// =============================================================================
