//! Document compression with gzip.
//!
//! Settings: `level` (1-9, default 6). The output is the gzip stream of the
//! source, written as `{stem}.gz`.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use squish_models::JobSettings;

use crate::processor::{ProcessContext, ProcessOutput, ProcessRequest, Processor, ProcessorError};

const DEFAULT_LEVEL: u32 = 6;
const CHUNK_SIZE: usize = 64 * 1024;

fn level(settings: &JobSettings) -> Result<u32, ProcessorError> {
    match settings.get("level") {
        None => Ok(DEFAULT_LEVEL),
        Some(value) => value
            .as_u64()
            .filter(|l| (1..=9).contains(l))
            .map(|l| l as u32)
            .ok_or_else(|| ProcessorError::invalid_settings("level must be an integer between 1 and 9")),
    }
}

/// Gzip delegate running on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct DocumentProcessor;

impl DocumentProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Processor for DocumentProcessor {
    fn name(&self) -> &'static str {
        "document"
    }

    fn output_extension(&self, settings: &JobSettings) -> Result<String, ProcessorError> {
        level(settings)?;
        Ok("gz".to_string())
    }

    async fn process(
        &self,
        request: ProcessRequest,
        ctx: ProcessContext,
    ) -> Result<ProcessOutput, ProcessorError> {
        let level = level(&request.settings)?;
        let input = request.input.clone().into_path_buf();
        let output = request.output.clone().into_path_buf();

        let blocking_ctx = ctx.clone();
        let output_size = tokio::task::spawn_blocking(move || compress(&input, &output, level, &blocking_ctx))
            .await
            .map_err(|e| ProcessorError::failed(format!("compression task failed: {e}")))??;

        ctx.progress.report(100);
        debug!(level, output_size, "Document compressed");
        Ok(ProcessOutput { output_size })
    }
}

fn compress(input: &Path, output: &Path, level: u32, ctx: &ProcessContext) -> Result<u64, ProcessorError> {
    let mut source = File::open(input)?;
    let total = source.metadata()?.len();
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(output)?), Compression::new(level));

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut done = 0u64;
    loop {
        if ctx.is_cancelled() {
            return Err(ProcessorError::Cancelled);
        }
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
        done += n as u64;
        // 100 is reported once the stream is finished
        if total > 0 {
            let percent = (done.min(total) as f64 / total as f64 * 100.0) as u8;
            ctx.progress.report(percent.min(99));
        }
    }

    let mut writer = encoder.finish()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| ProcessorError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}
