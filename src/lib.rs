//! Boardroom: durable, resumable generation jobs and movement tracking.

pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod movements;
pub mod pipelines;
pub mod store;
