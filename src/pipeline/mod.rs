//! Media pipeline controller
//!
//! This module turns declarative stage lists into running graphs and keeps
//! them in a consistent state, separating concerns between:
//! - Building: validating, instantiating and linking stages into a [`Graph`]
//! - Control: the [`PipelineState`] machine and its rollback rules
//! - Events: classifying runtime messages and dispatching them to handlers
//! - Presentation: binding the display sink to a shell-owned surface
//! - Devices: swapping the capture device as one operation
//!
//! # Architecture
//!
//! A [`PipelineController`] owns at most one graph. The presentation shell
//! drives it from a single thread and pumps its events; the runtime's stage
//! workers only ever talk back through the bus.

pub mod controller;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod events;
pub mod graph;
pub mod health;
pub mod overlay;
pub mod state;

pub use controller::PipelineController;
pub use descriptor::{PropertyValue, StageDescriptor, StageKind, Topology};
pub use device::DeviceSelector;
pub use error::{BindError, BuildError, ConfigError, SwitchError, TransitionError};
pub use events::{ControlRequest, ControlRequests, EosAction, EventHandler, HandlerId, RuntimeEvent, Severity};
pub use graph::Graph;
pub use health::{HealthSummary, PipelineHealth};
pub use overlay::SurfaceHandle;
pub use state::PipelineState;
