//! Stage coordinates and position indexing.
//!
//! An acquisition covers a grid of XY stage positions (tiles). This module
//! tracks every position in a single growable arena and answers, for any
//! pyramid resolution level, which tile a position falls into and which
//! stable per-level index that tile carries.

mod position;
mod surface;

pub use position::{
    floor_div, AffineTransform, PositionIndex, XyPosition, DOWNSAMPLE_FACTOR,
};
pub use surface::{PlanarSurface, Surface};
