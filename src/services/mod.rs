pub mod cache;
pub mod hub;
pub mod image_prep;
pub mod ocr;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod providers;
