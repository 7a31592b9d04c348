//! Resilient HLS segmented-download engine.
//!
//! Give the [`DownloadOrchestrator`] a playlist URL and an output path; it
//! resolves the stream, downloads segments concurrently through a guarded
//! request path (per-host pooling, adaptive timeouts, circuit breakers and a
//! central retry coordinator), decrypts and validates each segment, persists
//! progress so an interrupted task resumes where it stopped, and merges the
//! segments into a single file in playlist order.

pub mod config;
pub mod crypto;
pub mod error;
pub mod merger;
pub mod metrics;
pub mod model;
pub mod net;
pub mod orchestrator;
pub mod playlist;
pub mod proxy;
pub mod recovery;
pub mod resilience;
pub mod resources;
pub mod scheduler;
pub mod validator;

pub use config::EngineConfig;
pub use error::{DownloadError, ErrorCategory, FailureReport, Result, Severity};
pub use model::{DownloadTask, Priority, Stream, TaskId, TaskStatus};
pub use orchestrator::{
    DownloadOrchestrator, EngineEvent, EngineServices, EventListener, ProgressUpdate,
    TaskRequest,
};
pub use playlist::VariantSelectionPolicy;
