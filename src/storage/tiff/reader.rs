//! Container reader.
//!
//! Two ways in: [`TiffReader::attach`] shares a live writer's index map so
//! already-flushed images can be read while the file is still growing, and
//! [`TiffReader::open`] rebuilds the index from a finished (or crashed)
//! container on disk. Multi-byte values honor the byte order recorded in
//! the magic; it never changes within a file.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;

use crate::error::TiffError;
use crate::storage::image::{PixelBuffer, TaggedImage};
use crate::storage::meta;

use super::log::read_exact_at;
use super::tags::{
    ByteOrder, Tag, BYTE_ORDER_BIG_ENDIAN, BYTE_ORDER_LITTLE_ENDIAN, INDEX_ENTRY_SIZE,
    INDEX_MAP_MARKER, INDEX_MAP_OFFSET_MARKER, PRELUDE_SIZE, SUMMARY_MD_MARKER, VERSION_TIFF,
};
use super::{IndexEntry, SharedIndex};

/// Reader half of a container file.
pub struct TiffReader {
    file: Mutex<File>,
    byte_order: ByteOrder,
    index: SharedIndex,
    summary: Value,
}

impl TiffReader {
    /// Attach to a container that is still being written, sharing the
    /// writer's live index map.
    pub fn attach(
        path: &Path,
        index: SharedIndex,
        summary: Value,
        byte_order: ByteOrder,
    ) -> Result<Self, TiffError> {
        let file = File::open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            byte_order,
            index,
            summary,
        })
    }

    /// Open a container from disk, parsing the prelude, summary metadata,
    /// and index-map region.
    ///
    /// Zeroed index entries terminate the scan, so a container that was
    /// never finished still yields every completed image.
    pub fn open(path: &Path) -> Result<Self, TiffError> {
        let mut file = File::open(path)?;

        let prelude = read_exact_at(&mut file, 0, PRELUDE_SIZE)?;
        let magic = u16::from_le_bytes([prelude[0], prelude[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            other => return Err(TiffError::InvalidMagic(other)),
        };
        let version = byte_order.read_u16(&prelude[2..4]);
        if version != VERSION_TIFF {
            return Err(TiffError::InvalidVersion(version));
        }

        check_marker(byte_order, &prelude[8..12], INDEX_MAP_OFFSET_MARKER)?;
        let index_offset = byte_order.read_u32(&prelude[12..16]) as u64;
        check_marker(byte_order, &prelude[32..36], SUMMARY_MD_MARKER)?;
        let md_len = byte_order.read_u32(&prelude[36..40]) as usize;

        let md_bytes = read_exact_at(&mut file, PRELUDE_SIZE as u64, md_len)?;
        let summary: Value = serde_json::from_slice(&md_bytes)?;

        let index_header = read_exact_at(&mut file, index_offset, 8)?;
        check_marker(byte_order, &index_header[0..4], INDEX_MAP_MARKER)?;
        let entry_count = byte_order.read_u32(&index_header[4..8]) as usize;

        let mut index = HashMap::new();
        let entries = read_exact_at(
            &mut file,
            index_offset + 8,
            entry_count * INDEX_ENTRY_SIZE,
        )?;
        for chunk in entries.chunks_exact(INDEX_ENTRY_SIZE) {
            let ifd_offset = byte_order.read_u32(&chunk[16..20]) as u64;
            if ifd_offset == 0 {
                break;
            }
            let mut indices = [0i64; 4];
            for (i, value) in indices.iter_mut().enumerate() {
                *value = byte_order.read_u32(&chunk[i * 4..i * 4 + 4]) as i32 as i64;
            }
            index.insert(
                meta::label(indices[0], indices[1], indices[2], indices[3]),
                IndexEntry {
                    ifd_offset,
                    strip_offset: 0,
                    strip_len: 0,
                },
            );
        }

        Ok(Self {
            file: Mutex::new(file),
            byte_order,
            index: Arc::new(Mutex::new(index)),
            summary,
        })
    }

    /// Summary metadata document of this container.
    pub fn summary(&self) -> &Value {
        &self.summary
    }

    /// Whether the index knows the given label.
    pub fn has(&self, label: &str) -> bool {
        self.index.lock().unwrap().contains_key(label)
    }

    /// All labels currently in the index.
    pub fn labels(&self) -> Vec<String> {
        self.index.lock().unwrap().keys().cloned().collect()
    }

    /// Read one image by label, following its directory to the pixel
    /// strip and metadata document.
    pub fn get_image(&self, label: &str) -> Result<TaggedImage, TiffError> {
        let entry = {
            let index = self.index.lock().unwrap();
            *index
                .get(label)
                .ok_or_else(|| TiffError::UnknownLabel(label.to_string()))?
        };
        let mut file = self.file.lock().unwrap();
        let dir = self.parse_ifd(&mut file, entry.ifd_offset)?;

        let strip = read_exact_at(&mut file, dir.strip_offset, dir.strip_len as usize)?;
        let md_bytes = read_exact_at(&mut file, dir.md_offset, dir.md_len as usize)?;
        drop(file);

        let tags: Value = serde_json::from_slice(&md_bytes)?;
        let byte_depth = (dir.bits_per_sample / 8).max(1) as u8;
        let samples_per_pixel = dir.samples_per_pixel.max(1);
        let rgb = samples_per_pixel == 3;

        let expected = dir.width as u64
            * dir.height as u64
            * byte_depth as u64
            * samples_per_pixel as u64;
        if expected != dir.strip_len {
            return Err(TiffError::StripLengthMismatch {
                expected,
                actual: dir.strip_len,
            });
        }

        // Samples are stored in the file's byte order; buffers are
        // little-endian in memory
        let strip = if byte_depth == 2 && self.byte_order == ByteOrder::BigEndian {
            let mut swapped = strip;
            for pair in swapped.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
            swapped
        } else {
            strip
        };

        Ok(TaggedImage::new(
            PixelBuffer::new(Bytes::from(strip), dir.width, dir.height, byte_depth, rgb),
            tags,
        ))
    }

    fn parse_ifd(&self, file: &mut File, offset: u64) -> Result<ParsedIfd, TiffError> {
        let bo = self.byte_order;
        let count_bytes = read_exact_at(file, offset, 2)?;
        let entry_count = bo.read_u16(&count_bytes) as usize;
        let entries = read_exact_at(file, offset + 2, entry_count * 12)?;

        let mut dir = ParsedIfd::default();
        for chunk in entries.chunks_exact(12) {
            let tag = bo.read_u16(&chunk[0..2]);
            let field_type = bo.read_u16(&chunk[2..4]);
            let count = bo.read_u32(&chunk[4..8]);
            // Single shorts are left-justified in the value field
            let value = if field_type == 3 && count == 1 {
                bo.read_u16(&chunk[8..10]) as u32
            } else {
                bo.read_u32(&chunk[8..12])
            };

            match tag {
                t if t == Tag::ImageWidth.as_u16() => dir.width = value,
                t if t == Tag::ImageLength.as_u16() => dir.height = value,
                t if t == Tag::BitsPerSample.as_u16() => {
                    // For RGB the three shorts sit at an offset; they are
                    // always equal, so the first one suffices
                    dir.bits_per_sample = if count == 1 {
                        value as u16
                    } else {
                        let bits = read_exact_at(file, value as u64, 2)?;
                        bo.read_u16(&bits)
                    };
                }
                t if t == Tag::SamplesPerPixel.as_u16() => dir.samples_per_pixel = value as u16,
                t if t == Tag::StripOffsets.as_u16() => dir.strip_offset = value as u64,
                t if t == Tag::StripByteCounts.as_u16() => dir.strip_len = value as u64,
                t if t == Tag::AppMetadata.as_u16() => {
                    dir.md_offset = value as u64;
                    dir.md_len = count as u64;
                }
                _ => {}
            }
        }

        if dir.width == 0 || dir.height == 0 {
            return Err(TiffError::MissingTag("ImageWidth"));
        }
        if dir.strip_offset == 0 {
            return Err(TiffError::MissingTag("StripOffsets"));
        }
        if dir.md_offset == 0 {
            return Err(TiffError::MissingTag("AppMetadata"));
        }
        Ok(dir)
    }
}

#[derive(Debug, Default)]
struct ParsedIfd {
    width: u32,
    height: u32,
    bits_per_sample: u16,
    samples_per_pixel: u16,
    strip_offset: u64,
    strip_len: u64,
    md_offset: u64,
    md_len: u64,
}

fn check_marker(bo: ByteOrder, bytes: &[u8], expected: u32) -> Result<(), TiffError> {
    let actual = bo.read_u32(bytes);
    if actual != expected {
        return Err(TiffError::BadHeaderMarker { expected, actual });
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
