pub mod manifest;
pub mod result_document;
