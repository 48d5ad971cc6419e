//! Bundled delegate processors.

pub mod document;
pub mod image;
pub mod media;

pub use document::DocumentProcessor;
pub use self::image::ImageProcessor;
pub use media::{FfmpegProcessor, MediaKind};
