//! Multi-resolution pyramidal tile storage.
//!
//! Full-resolution tagged images land in a level-0 container and are
//! incrementally box-filtered into halved-resolution levels until the
//! whole grid fits one tile per axis. Each level is a [`LevelStorage`]
//! over one binary container ([`tiff`]); [`PyramidStorage`] ties the
//! levels together with the position arena.

mod downsample;
mod image;
mod level;
pub mod meta;
mod pyramid;
pub mod tiff;

pub use downsample::fold_quadrant;
pub use image::{write_sample, PixelBuffer, TaggedImage};
pub use level::LevelStorage;
pub use meta::SummaryMeta;
pub use pyramid::{PyramidStorage, DOWNSAMPLE_DIR_PREFIX, FULL_RES_DIR};
