//! File type to processor mapping.

use std::collections::HashMap;
use std::sync::Arc;

use squish_models::FileType;

use crate::delegates::{DocumentProcessor, FfmpegProcessor, ImageProcessor};
use crate::processor::Processor;

/// Registered delegate processors, one per file type.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<FileType, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled image, media and document delegates.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(FileType::Image, Arc::new(ImageProcessor::new()));
        registry.register(FileType::Video, Arc::new(FfmpegProcessor::video()));
        registry.register(FileType::Audio, Arc::new(FfmpegProcessor::audio()));
        registry.register(FileType::Document, Arc::new(DocumentProcessor::new()));
        registry
    }

    /// Register a processor, returning the one it replaces.
    pub fn register(
        &mut self,
        file_type: FileType,
        processor: Arc<dyn Processor>,
    ) -> Option<Arc<dyn Processor>> {
        self.processors.insert(file_type, processor)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, file_type: FileType, processor: Arc<dyn Processor>) -> Self {
        self.register(file_type, processor);
        self
    }

    pub fn get(&self, file_type: FileType) -> Option<Arc<dyn Processor>> {
        self.processors.get(&file_type).cloned()
    }

    pub fn file_types(&self) -> Vec<FileType> {
        FileType::ALL
            .into_iter()
            .filter(|t| self.processors.contains_key(t))
            .collect()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for file_type in self.file_types() {
            if let Some(processor) = self.processors.get(&file_type) {
                map.entry(&file_type.as_str(), &processor.name());
            }
        }
        map.finish()
    }
}
