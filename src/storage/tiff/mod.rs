//! Binary tile container codec.
//!
//! Writer and reader halves over a TIFF-skeleton file with a label-indexed
//! map of image directories. The two halves share one live index map: the
//! writer inserts entries as directories are appended, and the reader can
//! resolve any already-written label while the file is still growing.
//!
//! All disk writes for one file go through a single background writer
//! thread ([`log::WriteLog`]); the pyramid layer above never does byte
//! arithmetic of its own.

mod log;
mod reader;
mod tags;
mod writer;

pub use log::WriteLog;
pub use reader::TiffReader;
pub use tags::{
    ByteOrder, FieldType, Tag, BYTE_ORDER_BIG_ENDIAN, BYTE_ORDER_LITTLE_ENDIAN,
    ENTRIES_PER_IFD, INDEX_ENTRY_SIZE, PRELUDE_SIZE, VERSION_TIFF,
};
pub use writer::TiffWriter;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Location of one image inside a container file.
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    /// Byte offset of the image's directory structure
    pub ifd_offset: u64,

    /// Byte offset of the pixel strip
    pub strip_offset: u64,

    /// Byte length of the pixel strip
    pub strip_len: u64,
}

/// Label-to-location map shared between a writer and its reader.
///
/// Keys are `channel_slice_frame_position` labels. Last write wins:
/// overwriting a label with a new offset is how refined downsample tiles
/// replace their predecessors.
pub type SharedIndex = Arc<Mutex<HashMap<String, IndexEntry>>>;
