//! Image decoding module
//!
//! This module provides:
//! - Decoding and metadata collection (processor)
//! - Primary-IFD EXIF tag collection (exif_tags)

pub mod exif_tags;
pub mod processor;

pub use exif_tags::read_exif_tags;
pub use processor::{format_name, ImageProcessor};
