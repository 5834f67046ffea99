//! GStreamer runtime
//!
//! Maps stage descriptors onto real GStreamer elements. Every graph built by
//! a controller lives in its own `gst::Pipeline`: stages are added to it as
//! they are created, their error, warning and end-of-stream messages are
//! forwarded from the pipeline bus into the controller's [`BusHandle`], and
//! the pipeline itself follows once every stage reached the same state so
//! clock and base time get distributed.

mod stage;

use gstreamer as gst;
use gstreamer::prelude::*;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use crate::pipeline::descriptor::{StageDescriptor, StageKind};
use crate::runtime::{BusHandle, MediaRuntime, StageError, lock};

pub use stage::GstStage;

/// Pipeline holding the stages of one graph
pub(crate) struct GraphBin {
    pipeline: gst::Pipeline,
    bus: BusHandle,
    requested: Mutex<HashMap<String, gst::State>>,
    sources: Arc<Mutex<Vec<String>>>,
}

impl GraphBin {
    fn new(bus: BusHandle) -> Arc<Self> {
        let pipeline = gst::Pipeline::with_name(&format!("camcast-{}", bus.generation()));
        let sources = Arc::new(Mutex::new(Vec::new()));

        if let Some(gst_bus) = pipeline.bus() {
            let forward = bus.clone();
            let names = Arc::clone(&sources);
            gst_bus.set_sync_handler(move |_, message| {
                forward_message(&forward, &names, message);
                gst::BusSyncReply::Drop
            });
        }

        Arc::new(Self {
            pipeline,
            bus,
            requested: Mutex::new(HashMap::new()),
            sources,
        })
    }

    fn add(&self, descriptor: &StageDescriptor, element: &gst::Element) -> Result<(), StageError> {
        self.pipeline
            .add(element)
            .map_err(|e| StageError::Unsupported(format!("{}: {}", descriptor.name, e)))?;
        if descriptor.kind == StageKind::Source {
            lock(&self.sources).push(descriptor.name.clone());
        }
        lock(&self.requested).insert(descriptor.name.clone(), gst::State::Null);
        Ok(())
    }

    /// Record the state a stage was commanded to and move the pipeline along
    /// once every stage agrees
    fn follow(&self, stage: &str, state: gst::State) {
        let mut requested = lock(&self.requested);
        requested.insert(stage.to_string(), state);
        if !requested.values().all(|s| *s == state) || self.pipeline.current_state() == state {
            return;
        }
        if let Err(e) = self.pipeline.set_state(state) {
            warn!("{}: pipeline refused {:?}: {}", self.pipeline.name(), state, e);
        }
    }

    fn remove(&self, stage: &str, element: &gst::Element) {
        lock(&self.requested).remove(stage);
        lock(&self.sources).retain(|name| name != stage);
        if let Err(e) = self.pipeline.remove(element) {
            debug!("{}: could not remove {}: {}", self.pipeline.name(), stage, e);
        }
    }
}

impl Drop for GraphBin {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
        if let Some(gst_bus) = self.pipeline.bus() {
            gst_bus.unset_sync_handler();
        }
        debug!("pipeline {} disposed", self.pipeline.name());
    }
}

fn forward_message(bus: &BusHandle, sources: &Mutex<Vec<String>>, message: &gst::Message) {
    let origin = message
        .src()
        .map(|src| src.name().to_string())
        .unwrap_or_default();

    match message.view() {
        gst::MessageView::Error(err) => {
            bus.error(&origin, err.error().to_string(), err.debug().map(|d| d.to_string()));
        }
        gst::MessageView::Warning(warning) => {
            bus.warning(
                &origin,
                warning.error().to_string(),
                warning.debug().map(|d| d.to_string()),
            );
        }
        gst::MessageView::Eos(..) => {
            // the pipeline posts EOS once every sink drained; report it
            // against the source that ran dry
            let source = lock(sources).first().cloned().unwrap_or(origin);
            bus.eos(&source);
        }
        _ => {}
    }
}

pub(crate) struct Inner {
    graphs: Mutex<Vec<(BusHandle, Weak<GraphBin>)>>,
    leased: Mutex<HashSet<String>>,
}

impl Inner {
    fn acquire(&self, device: &str) -> Result<(), StageError> {
        if !lock(&self.leased).insert(device.to_string()) {
            return Err(StageError::DeviceBusy(device.to_string()));
        }
        debug!("device {} leased", device);
        Ok(())
    }

    fn release(&self, device: &str) {
        if lock(&self.leased).remove(device) {
            debug!("device {} released", device);
        }
    }

    /// Pipeline of the graph `bus` was issued for, created on first use
    fn graph(&self, bus: &BusHandle) -> Arc<GraphBin> {
        let mut graphs = lock(&self.graphs);
        graphs.retain(|(_, weak)| weak.strong_count() > 0);
        if let Some(bin) = graphs
            .iter()
            .filter(|(handle, _)| handle.same_bus(bus))
            .find_map(|(_, weak)| weak.upgrade())
        {
            return bin;
        }
        let bin = GraphBin::new(bus.clone());
        graphs.push((bus.clone(), Arc::downgrade(&bin)));
        bin
    }
}

/// [`MediaRuntime`] backed by GStreamer elements
///
/// Clones share the lease table, so controllers holding clones of one
/// runtime never open the same capture device twice.
#[derive(Clone)]
pub struct GstRuntime {
    inner: Arc<Inner>,
}

impl GstRuntime {
    /// Initialize GStreamer and create a runtime
    pub fn new() -> Result<Self, gst::glib::Error> {
        gst::init()?;
        info!("GStreamer {} initialized", gst::version_string());
        Ok(Self {
            inner: Arc::new(Inner {
                graphs: Mutex::new(Vec::new()),
                leased: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Whether some live stage currently holds `device`
    pub fn is_leased(&self, device: &str) -> bool {
        lock(&self.inner.leased).contains(device)
    }
}

impl MediaRuntime for GstRuntime {
    type Stage = GstStage;

    fn create_stage(&self, descriptor: &StageDescriptor, bus: BusHandle) -> Result<GstStage, StageError> {
        let bin = self.inner.graph(&bus);
        let stage = GstStage::create(descriptor, bin, Arc::clone(&self.inner))?;
        debug!("created stage {} ({})", descriptor.name, descriptor.kind);
        Ok(stage)
    }

    fn link(&self, upstream: &mut GstStage, downstream: &mut GstStage) -> Result<(), StageError> {
        upstream.link_to(downstream)
    }

    fn devices(&self) -> Vec<String> {
        let monitor = gst::DeviceMonitor::new();
        if monitor.add_filter(Some("Video/Source"), None).is_none() {
            warn!("no provider lists video sources");
        }
        monitor
            .devices()
            .iter()
            .map(|device| {
                device
                    .properties()
                    .and_then(|props| {
                        props
                            .get::<String>("device.path")
                            .or_else(|_| props.get::<String>("api.v4l2.path"))
                            .ok()
                    })
                    .unwrap_or_else(|| device.display_name().to_string())
            })
            .collect()
    }
}
