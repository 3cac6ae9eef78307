//! Generator client for the sift pipeline.

pub mod generator;

pub use generator::OpenAiGenerator;
