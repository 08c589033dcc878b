pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod filtergraph;
pub mod glyphs;
pub mod job;
pub mod layout;
pub mod overlay;
pub mod pipeline;
pub mod probe;
pub mod scheduler;
pub mod service;
pub mod speech;
pub mod store;
pub mod text;

pub use config::NarratorConfig;
pub use error::{PipelineError, StoreError, SubmitError};
pub use executor::{FfmpegExecutor, TranscodeExecutor};
pub use job::{Job, JobStatus, VideoType};
pub use pipeline::{MediaAssemblyPipeline, Stage};
pub use probe::{MediaInfo, MediaProbe};
pub use scheduler::{JobRunner, Scheduler, SchedulerHandle};
pub use service::{JobService, StatusSummary, SubmitRequest};
pub use store::{FileJobStore, JobStore};
