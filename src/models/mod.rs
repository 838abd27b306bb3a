pub mod data;
pub mod rules;

pub use data::*;
pub use rules::{
    clean_token, CompiledField, CompiledTemplate, Fallback, FieldDefinition, FieldTemplate,
    MrzSource, Normalization, TemplateSet,
};
