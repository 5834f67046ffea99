//! Media runtime seam
//!
//! The controller never touches media data. It creates, links, state-changes,
//! binds and releases stages through the traits in this module, and receives
//! the runtime's asynchronous messages through a [`BusHandle`].
//!
//! # Architecture
//!
//! - [`MediaRuntime`]: stage factory and linker, shared between controllers
//! - [`Stage`]: one instantiated processing unit, owned by a graph
//! - [`BusHandle`]: per-graph sender that stage worker threads post into
//! - [`soft`]: bundled in-process runtime driving worker threads
//! - [`gst`]: GStreamer-backed runtime (`gstreamer` feature)

pub mod bus;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod soft;
pub mod types;

use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::pipeline::descriptor::{StageDescriptor, StageKind};
use crate::pipeline::overlay::SurfaceHandle;

pub use bus::{BusHandle, BusMessage, Envelope};
#[cfg(feature = "gstreamer")]
pub use gst::GstRuntime;
pub use soft::SoftRuntime;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lifecycle state of a single stage, as the runtime sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageState {
    /// Created, no resources beyond the handle itself
    Null,
    /// Resources allocated, not processing
    Ready,
    /// Workers running, data flow held
    Paused,
    /// Data flowing
    Playing,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageState::Null => "null",
            StageState::Ready => "ready",
            StageState::Paused => "paused",
            StageState::Playing => "playing",
        };
        write!(f, "{}", name)
    }
}

/// Media capabilities offered or accepted by a stage pad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Caps {
    Any,
    RawVideo,
    EncodedVideo,
    Packetized,
}

impl Caps {
    /// Whether data offered as `offered` can flow into a pad accepting `self`
    pub fn accepts(&self, offered: Caps) -> bool {
        matches!((self, offered), (Caps::Any, _) | (_, Caps::Any)) || *self == offered
    }
}

impl std::fmt::Display for Caps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Caps::Any => "ANY",
            Caps::RawVideo => "video/x-raw",
            Caps::EncodedVideo => "video/x-h264",
            Caps::Packetized => "application/x-rtp",
        };
        write!(f, "{}", name)
    }
}

/// Errors reported by a runtime while creating, linking or driving stages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("invalid value for property '{key}': {reason}")]
    InvalidProperty { key: String, reason: String },

    #[error("unsupported stage: {0}")]
    Unsupported(String),

    #[error("device '{0}' is already in use")]
    DeviceBusy(String),

    #[error("device '{0}' not found")]
    DeviceMissing(String),

    #[error("pads are incompatible: {upstream} cannot feed {downstream}")]
    IncompatiblePads { upstream: String, downstream: String },

    #[error("stage refused state '{state}': {reason}")]
    StateRefused { state: StageState, reason: String },

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        StageError::Io(err.to_string())
    }
}

/// One instantiated processing unit
///
/// Implementations run their data processing on runtime-owned worker threads;
/// every method here is called from the controller thread and must return
/// without waiting for those workers.
pub trait Stage: Send {
    /// Name of the stage, unique within its graph
    fn name(&self) -> &str;

    /// Kind the stage was created from
    fn kind(&self) -> StageKind;

    /// Whether this stage renders video into a window
    fn is_display_sink(&self) -> bool;

    /// Request a state change. May complete asynchronously; poll
    /// [`Stage::current_state`] to observe settling.
    fn set_state(&mut self, target: StageState) -> Result<(), StageError>;

    /// State the stage has actually reached
    fn current_state(&self) -> StageState;

    /// Bind or clear the window the stage renders into
    fn set_window_handle(&mut self, handle: Option<SurfaceHandle>) -> Result<(), StageError>;

    /// Stop workers and give back every device/network resource. Idempotent.
    fn release(&mut self);
}

/// Factory and linker for stages
pub trait MediaRuntime {
    type Stage: Stage;

    /// Instantiate a stage, validating its properties
    fn create_stage(
        &self,
        descriptor: &StageDescriptor,
        bus: BusHandle,
    ) -> Result<Self::Stage, StageError>;

    /// Connect the output of `upstream` to the input of `downstream`
    fn link(&self, upstream: &mut Self::Stage, downstream: &mut Self::Stage)
    -> Result<(), StageError>;

    /// Capture devices currently present
    fn devices(&self) -> Vec<String>;
}
