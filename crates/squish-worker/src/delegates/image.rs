//! Image re-encoding.
//!
//! Settings:
//! - `format`: `jpeg` (default, alias `jpg`) or `png`
//! - `quality`: JPEG quality 1-100, default 80
//! - `maxWidth` / `maxHeight`: optional downscale bounds, aspect preserved

use std::fs::File;
use std::io::BufWriter;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat};
use tracing::debug;

use squish_models::JobSettings;

use crate::processor::{ProcessContext, ProcessOutput, ProcessRequest, Processor, ProcessorError};

const DEFAULT_QUALITY: u8 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ImageSettings {
    format: ImageFormat,
    quality: u8,
    max_width: Option<u32>,
    max_height: Option<u32>,
}

impl ImageSettings {
    fn parse(settings: &JobSettings) -> Result<Self, ProcessorError> {
        let format = match settings.get_str("format").map(str::to_ascii_lowercase).as_deref() {
            None | Some("jpeg") | Some("jpg") => ImageFormat::Jpeg,
            Some("png") => ImageFormat::Png,
            Some(other) => {
                return Err(ProcessorError::invalid_settings(format!(
                    "unsupported image format '{other}'"
                )))
            }
        };

        let quality = match settings.get("quality") {
            None => DEFAULT_QUALITY,
            Some(value) => match value.as_u64() {
                Some(q @ 1..=100) => q as u8,
                _ => {
                    return Err(ProcessorError::invalid_settings(
                        "quality must be an integer between 1 and 100",
                    ))
                }
            },
        };

        let bound = |key: &str| -> Result<Option<u32>, ProcessorError> {
            match settings.get(key) {
                None => Ok(None),
                Some(value) => value
                    .as_u64()
                    .filter(|v| *v > 0 && *v <= u32::MAX as u64)
                    .map(|v| Some(v as u32))
                    .ok_or_else(|| {
                        ProcessorError::invalid_settings(format!("{key} must be a positive integer"))
                    }),
            }
        };

        Ok(Self {
            format,
            quality,
            max_width: bound("maxWidth")?,
            max_height: bound("maxHeight")?,
        })
    }
}

/// Re-encodes images with the `image` crate on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct ImageProcessor;

impl ImageProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Processor for ImageProcessor {
    fn name(&self) -> &'static str {
        "image"
    }

    fn output_extension(&self, settings: &JobSettings) -> Result<String, ProcessorError> {
        Ok(ImageSettings::parse(settings)?.format.extension().to_string())
    }

    async fn process(
        &self,
        request: ProcessRequest,
        ctx: ProcessContext,
    ) -> Result<ProcessOutput, ProcessorError> {
        let settings = ImageSettings::parse(&request.settings)?;
        let input = request.input.clone().into_path_buf();
        let output = request.output.clone().into_path_buf();

        let blocking_ctx = ctx.clone();
        tokio::task::spawn_blocking(move || encode(&input, &output, settings, &blocking_ctx))
            .await
            .map_err(|e| ProcessorError::failed(format!("image task failed: {e}")))??;

        let output_size = tokio::fs::metadata(request.output.as_path()).await?.len();
        ctx.progress.report(100);
        debug!(
            format = settings.format.extension(),
            quality = settings.quality,
            output_size,
            "Image re-encoded"
        );
        Ok(ProcessOutput { output_size })
    }
}

fn encode(
    input: &std::path::Path,
    output: &std::path::Path,
    settings: ImageSettings,
    ctx: &ProcessContext,
) -> Result<(), ProcessorError> {
    let mut img = image::open(input)?;
    ctx.progress.report(30);
    if ctx.is_cancelled() {
        return Err(ProcessorError::Cancelled);
    }

    let max_w = settings.max_width.unwrap_or(u32::MAX);
    let max_h = settings.max_height.unwrap_or(u32::MAX);
    if img.width() > max_w || img.height() > max_h {
        img = img.resize(max_w.min(img.width()), max_h.min(img.height()), FilterType::Lanczos3);
    }
    ctx.progress.report(60);
    if ctx.is_cancelled() {
        return Err(ProcessorError::Cancelled);
    }

    let mut writer = BufWriter::new(File::create(output)?);
    match settings.format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_to(&mut writer, ImageOutputFormat::Jpeg(settings.quality))?;
        }
        ImageFormat::Png => img.write_to(&mut writer, ImageOutputFormat::Png)?,
    }
    writer
        .into_inner()
        .map_err(|e| ProcessorError::Io(e.into_error()))?
        .sync_all()?;
    ctx.progress.report(95);
    Ok(())
}
