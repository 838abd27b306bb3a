pub mod format;
pub mod mrz;

pub use format::{FormatValidator, ResultAssembler};
pub use mrz::MrzValidator;
