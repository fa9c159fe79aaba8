//! Media processing for the upload pipeline.
//!
//! Decodes image resources and extracts the flat metadata map that the
//! document writer persists.

pub mod extractor;
pub mod image;

pub use extractor::MetadataExtractor;
pub use image::ImageProcessor;
