//! indexcheck library exports

pub mod bundle;
pub mod catalog;
pub mod config;
pub mod container;
pub mod error;
pub mod export;
pub mod image;
pub mod index;
pub mod manifest;
pub mod pipeline;
pub mod tags;
pub mod verify;

pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineFailure, PipelineReport, RunContext, Stage};
