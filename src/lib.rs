#![forbid(unsafe_code)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod extractor;
pub mod formats;
pub mod orchestrator;
pub mod packaging;
pub mod progress;
pub mod server;
pub mod sessions;
pub mod workdir;

#[cfg(test)]
mod testing;
