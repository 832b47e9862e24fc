//! tus Uploadr Library
//!
//! Resumable, chunked file uploads over the tus 1.0.0 protocol.
//!
//! # Features
//!
//! - **Resumable**: pause, resume and cancel a session at any moment
//! - **Chunked**: one byte range in flight at a time, with streamed progress
//! - **Retrying**: transient failures are retried after a fixed delay sequence
//! - **Fenced**: late responses never resurrect a paused or cancelled session
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tus_uploadr::{config::Config, upload::LocalFile, UploadController};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let controller = UploadController::from_config(&config)?;
//!     controller.start(Arc::new(LocalFile::open("movie.mp4", None).await?));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod tus;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use session::{SessionState, Snapshot, UploadController};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
