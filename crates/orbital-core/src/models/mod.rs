pub mod image;
pub mod pipeline;
pub mod task;

pub use image::*;
pub use pipeline::*;
pub use task::*;
