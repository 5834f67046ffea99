//! Error taxonomy of the controller

use std::time::Duration;
use thiserror::Error;

use crate::pipeline::state::PipelineState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("no stages to build")]
    Empty,
    #[error("stage name '{name}' is used more than once")]
    DuplicateName { name: String },
    #[error("link refers to unknown stage '{name}'")]
    UnknownStage { name: String },
    #[error("stage '{name}' is part of a cycle")]
    Cycle { name: String },
    #[error("stage '{name}' is not reachable from the first stage")]
    Unreachable { name: String },
    #[error("failed to create stage '{name}': {reason}")]
    StageCreationFailed { name: String, reason: String },
    #[error("failed to link '{from}' to '{to}': {reason}")]
    LinkFailed {
        from: String,
        to: String,
        reason: String,
    },
    #[error("device '{device}' is already open by another pipeline")]
    DeviceBusy { device: String },
    #[error("cannot build while {current}, tear down first")]
    NotIdle { current: PipelineState },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal transition from {current} to {requested}")]
    IllegalFrom {
        current: PipelineState,
        requested: PipelineState,
    },
    #[error("no pipeline built")]
    NotBuilt,
    #[error("a surface must be attached before playing a display pipeline")]
    SurfaceRequired,
    #[error("stage '{stage}' refused the transition: {reason}")]
    StageRefused { stage: String, reason: String },
    #[error("transition to {requested} did not settle within {waited:?}")]
    Timeout {
        requested: PipelineState,
        waited: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("no pipeline built")]
    NoGraph,
    #[error("pipeline is faulted")]
    Faulted,
    #[error("pipeline has no display sink")]
    NoSink,
    #[error("pipeline has {count} display sinks, expected exactly one")]
    AmbiguousSink { count: usize },
    #[error("stage '{stage}' rejected the surface: {reason}")]
    Rejected { stage: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchError {
    #[error("no pipeline has been built yet")]
    NoPipeline,
    #[error("pipeline has no capture source with a device")]
    NoCaptureSource,
    #[error("rebuild failed: {cause}")]
    RebuildFailed { cause: BuildError },
    #[error("could not reattach the surface: {0}")]
    Reattach(BindError),
    #[error("could not resume: {0}")]
    Resume(TransitionError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = TransitionError::IllegalFrom {
            current: PipelineState::Idle,
            requested: PipelineState::Playing,
        };
        assert_eq!(err.to_string(), "illegal transition from Idle to Playing");

        let err = SwitchError::RebuildFailed {
            cause: BuildError::DeviceBusy {
                device: "/dev/video1".to_string(),
            },
        };
        assert!(err.to_string().contains("/dev/video1"));
    }
}
