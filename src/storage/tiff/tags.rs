//! Container tag and layout vocabulary.
//!
//! The container is a classic-TIFF skeleton with application-specific
//! structures layered on top: an in-place-updatable index map after the
//! summary metadata, and offset headers in the file prelude pointing at
//! display settings and comments appended at finalize time.
//!
//! # Prelude layout (40 bytes)
//!
//! ```text
//! Bytes  0-1:  Byte order (0x4949 "II" little-endian, 0x4D4D "MM" big-endian)
//! Bytes  2-3:  Version (42)
//! Bytes  4-7:  Offset of first image directory
//! Bytes  8-15: Index-map offset marker + offset
//! Bytes 16-23: Display-settings offset marker + offset (patched at finalize)
//! Bytes 24-31: Comments offset marker + offset (patched at finalize)
//! Bytes 32-39: Summary-metadata marker + byte length (document follows)
//! ```

// =============================================================================
// Byte order
// =============================================================================

/// Magic bytes indicating little-endian byte order ("II" for Intel)
pub const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;

/// Magic bytes indicating big-endian byte order ("MM" for Motorola)
pub const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;

/// Classic TIFF version number
pub const VERSION_TIFF: u16 = 42;

/// Byte order (endianness) of a container file.
///
/// New containers are always written little-endian; the reader honors
/// whichever order the magic records, and it never changes within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// Read a u16 from a byte slice using this byte order.
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            ByteOrder::LittleEndian => u16::from_le_bytes([bytes[0], bytes[1]]),
            ByteOrder::BigEndian => u16::from_be_bytes([bytes[0], bytes[1]]),
        }
    }

    /// Read a u32 from a byte slice using this byte order.
    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        match self {
            ByteOrder::LittleEndian => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            ByteOrder::BigEndian => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

// =============================================================================
// Prelude markers
// =============================================================================

/// Size of the file prelude in bytes.
pub const PRELUDE_SIZE: usize = 40;

/// Marker preceding the index-map offset in the prelude.
pub const INDEX_MAP_OFFSET_MARKER: u32 = 54_773_648;

/// Marker at the start of the index-map region itself.
pub const INDEX_MAP_MARKER: u32 = 3_453_623;

/// Marker preceding the display-settings offset in the prelude.
pub const DISPLAY_SETTINGS_OFFSET_MARKER: u32 = 483_765_892;

/// Marker at the start of the display-settings block.
pub const DISPLAY_SETTINGS_MARKER: u32 = 347_834_724;

/// Marker preceding the comments offset in the prelude.
pub const COMMENTS_OFFSET_MARKER: u32 = 99_384_722;

/// Marker at the start of the comments block.
pub const COMMENTS_MARKER: u32 = 84_720_485;

/// Marker preceding the summary-metadata length in the prelude.
pub const SUMMARY_MD_MARKER: u32 = 2_355_492;

/// Size of one index-map entry: channel, slice, frame, position, offset.
pub const INDEX_ENTRY_SIZE: usize = 20;

// =============================================================================
// Directory tags
// =============================================================================

/// Entries per image directory (without first-directory extras).
pub const ENTRIES_PER_IFD: u16 = 13;

/// Extra entries in the first directory only: the free-text description
/// and the display/LUT block tag pair, patched at finalize.
pub const FIRST_IFD_EXTRA_ENTRIES: u16 = 3;

/// Tag IDs written into every image directory.
///
/// Only the tags this container uses are defined. The three trailing tags
/// are application-specific: the ImageJ metadata pair carries the display
/// ranges and LUTs written at finalize, and `AppMetadata` holds the
/// per-image JSON document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Tag {
    ImageWidth = 256,
    ImageLength = 257,
    BitsPerSample = 258,
    Compression = 259,
    PhotometricInterpretation = 262,
    ImageDescription = 270,
    StripOffsets = 273,
    SamplesPerPixel = 277,
    RowsPerStrip = 278,
    StripByteCounts = 279,
    XResolution = 282,
    YResolution = 283,
    ResolutionUnit = 296,
    IjMetadataByteCounts = 50838,
    IjMetadata = 50839,
    AppMetadata = 51123,
}

impl Tag {
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Field types used by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FieldType {
    Byte = 1,
    Ascii = 2,
    Short = 3,
    Long = 4,
    Rational = 5,
}

impl FieldType {
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Bytes reserved per channel for display settings at finalize.
pub const DISPLAY_SETTINGS_BYTES_PER_CHANNEL: usize = 256;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_order_reads() {
        let bytes = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(ByteOrder::LittleEndian.read_u16(&bytes), 0x0201);
        assert_eq!(ByteOrder::BigEndian.read_u16(&bytes), 0x0102);
        assert_eq!(ByteOrder::LittleEndian.read_u32(&bytes), 0x04030201);
        assert_eq!(ByteOrder::BigEndian.read_u32(&bytes), 0x01020304);
    }

    #[test]
    fn test_tag_values() {
        assert_eq!(Tag::ImageWidth.as_u16(), 256);
        assert_eq!(Tag::StripOffsets.as_u16(), 273);
        assert_eq!(Tag::StripByteCounts.as_u16(), 279);
        assert_eq!(Tag::AppMetadata.as_u16(), 51123);
    }

    #[test]
    fn test_prelude_accounting() {
        // 5 marker/value pairs after the 8-byte TIFF header
        assert_eq!(PRELUDE_SIZE, 8 + 4 * 8);
    }
}
