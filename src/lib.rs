pub mod config;
pub mod extractor;
pub mod models;
pub mod processing;
pub mod utils;
pub mod validation;

pub use config::Config;
pub use extractor::DocumentExtractor;
pub use models::{Document, DocumentType, ExtractionResult, Response};
pub use utils::{ExtractError, Result};
