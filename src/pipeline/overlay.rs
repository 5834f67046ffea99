//! Binding of the display sink to a shell-owned surface

use log::{debug, warn};
use std::num::NonZeroU64;

use crate::pipeline::error::BindError;
use crate::pipeline::graph::Graph;
use crate::runtime::Stage;

/// Opaque platform window identifier supplied by the presentation shell
///
/// Native windows report a zero id until they are realized, so zero is not a
/// handle: a `SurfaceHandle` only exists for a realized surface. The
/// controller never owns the window behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(NonZeroU64);

impl SurfaceHandle {
    /// Wrap a raw window id, or `None` if the surface is not realized yet
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(SurfaceHandle)
    }

    pub fn raw(&self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for SurfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    surface: SurfaceHandle,
    stage: usize,
}

/// Tracks the single active surface binding of a graph
#[derive(Debug, Default)]
pub struct OverlayBinder {
    binding: Option<Binding>,
}

impl OverlayBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Surface currently bound, if any
    pub fn surface(&self) -> Option<SurfaceHandle> {
        self.binding.map(|b| b.surface)
    }

    pub fn is_attached(&self) -> bool {
        self.binding.is_some()
    }

    /// Bind `surface` to the graph's only display sink, replacing any
    /// previous binding.
    pub fn attach<S: Stage>(
        &mut self,
        graph: &mut Graph<S>,
        surface: SurfaceHandle,
    ) -> Result<(), BindError> {
        let sinks = graph.display_sinks();
        let stage = match sinks.as_slice() {
            [] => return Err(BindError::NoSink),
            [only] => *only,
            many => return Err(BindError::AmbiguousSink { count: many.len() }),
        };

        self.detach(graph);

        let sink = graph.stage_mut(stage);
        sink.set_window_handle(Some(surface))
            .map_err(|e| BindError::Rejected {
                stage: sink.name().to_string(),
                reason: e.to_string(),
            })?;

        debug!("surface {} bound to {}", surface, sink.name());
        self.binding = Some(Binding { surface, stage });
        Ok(())
    }

    /// Clear the binding. Detaching an unbound graph does nothing.
    pub fn detach<S: Stage>(&mut self, graph: &mut Graph<S>) {
        let Some(binding) = self.binding.take() else {
            return;
        };
        let sink = graph.stage_mut(binding.stage);
        if let Err(e) = sink.set_window_handle(None) {
            warn!("{}: failed to clear surface {}: {}", sink.name(), binding.surface, e);
        } else {
            debug!("surface {} unbound from {}", binding.surface, sink.name());
        }
    }

    /// Drop the binding without touching stages, once the graph is gone
    pub fn forget(&mut self) {
        self.binding = None;
    }
}
