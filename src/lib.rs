pub mod assets;
pub mod config;
pub mod pipeline;
pub mod runtime;

pub use config::{ControllerConfig, PipelineProfile};
pub use pipeline::{PipelineController, PipelineState};
pub use runtime::SoftRuntime;
#[cfg(feature = "gstreamer")]
pub use runtime::GstRuntime;
