pub mod contrast;
pub mod extractors;
pub mod field_correction;
pub mod image;
pub mod ocr;
pub mod remote;
pub mod tesseract;

pub use extractors::FieldParser;
pub use self::image::{ImageProcessor, NormalizedImage};
pub use ocr::{BackendKind, OcrBackend, RecognitionRequest, Recognizer, Region};
