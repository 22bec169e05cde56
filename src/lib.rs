//! FilTube: video sharing backed by Filecoin warm storage
//!
//! Uploads go through [`upload::UploadOrchestrator`], which checks payments, sets up
//! a storage service and transfers the file. Published videos live in the
//! [`catalog`], served over HTTP by [`api`].

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod telemetry;
pub mod tip;
pub mod upload;

pub use error::{Error, Result};
