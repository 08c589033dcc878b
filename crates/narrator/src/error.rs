use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobStatus;
use crate::pipeline::Stage;

/// Reasons a submission is rejected before a job exists
#[derive(Debug, Error, PartialEq)]
pub enum SubmitError {
    #[error("text is empty after cleaning")]
    EmptyText,

    #[error("text is {len} characters, limit is {max}")]
    TextTooLong { len: usize, max: usize },

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("unsupported voice: {0}")]
    UnsupportedVoice(String),

    #[error("unknown video quality: {0}")]
    UnknownVideoQuality(String),

    #[error("unknown video type: {0}")]
    UnknownVideoType(String),

    #[error("invalid speech rate: {0}")]
    InvalidSpeechRate(String),
}

/// Reasons a pipeline run stops before producing the final artifact
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("canceled after {stage}")]
    Canceled { stage: Stage },

    #[error("text is empty after cleaning")]
    EmptyText,

    #[error("transcription produced no words")]
    NoTranscription,

    #[error("no background clips of at least {min_secs}s in {dir}")]
    NoBackgroundCandidates { dir: PathBuf, min_secs: f64 },

    #[error("{stage}: transcoder exited with {exit_code:?}; stderr saved to {}", stderr_log.display())]
    Tool {
        stage: Stage,
        exit_code: Option<i32>,
        stderr_log: PathBuf,
    },

    #[error("{stage}: {source:#}")]
    Io {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Wrap any error raised while working on `stage`
    pub fn io(stage: Stage, err: anyhow::Error) -> Self {
        PipelineError::Io { stage, source: err }
    }

    /// Stage the pipeline was working toward when it stopped, or the last one reached when canceled
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Canceled { stage }
            | PipelineError::Tool { stage, .. }
            | PipelineError::Io { stage, .. } => *stage,
            PipelineError::EmptyText => Stage::TextReceived,
            PipelineError::NoTranscription => Stage::Transcribed,
            PipelineError::NoBackgroundCandidates { .. } => Stage::BackgroundAssembled,
        }
    }
}

/// Misuse of the job store or service
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {0} is processing; cancel it first")]
    Busy(String),

    #[error("job {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {0} has no finished artifact")]
    NotReady(String),

    #[error("job store I/O failed: {0:#}")]
    Io(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use std::error::Error as _;

    fn failing_read() -> anyhow::Result<String> {
        std::fs::read_to_string("/nonexistent/narrator/chunk.pcm").context("Failed to read chunk samples")
    }

    #[test]
    fn test_pipeline_io_keeps_source_chain() {
        let err = PipelineError::io(Stage::NarrationSynthesized, failing_read().unwrap_err());
        assert_eq!(err.stage(), Stage::NarrationSynthesized);

        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "Failed to read chunk samples");
        let root = source.source().unwrap();
        assert!(root.downcast_ref::<std::io::Error>().is_some());

        let message = err.to_string();
        assert!(message.starts_with("narration_synthesized: Failed to read chunk samples: "));
    }

    #[test]
    fn test_store_io_keeps_source_chain() {
        let err: StoreError = failing_read().unwrap_err().into();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(err.source().unwrap().to_string(), "Failed to read chunk samples");
        assert!(err.to_string().starts_with("job store I/O failed: Failed to read chunk samples: "));
    }
}
