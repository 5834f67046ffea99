//! GStreamer-backed stages

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_video as gst_video;
use gstreamer_video::prelude::*;
use log::debug;
use std::sync::Arc;

use super::{GraphBin, Inner};
use crate::pipeline::descriptor::{PropertyValue, StageDescriptor, StageKind};
use crate::pipeline::overlay::SurfaceHandle;
use crate::runtime::{Stage, StageError, StageState};

#[cfg(target_os = "linux")]
const CAPTURE_FACTORY: &str = "v4l2src";
#[cfg(target_os = "windows")]
const CAPTURE_FACTORY: &str = "mfvideosrc";
#[cfg(target_os = "macos")]
const CAPTURE_FACTORY: &str = "avfvideosrc";
#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
const CAPTURE_FACTORY: &str = "autovideosrc";

#[cfg(target_os = "linux")]
const DISPLAY_FACTORY: &str = "xvimagesink";
#[cfg(target_os = "windows")]
const DISPLAY_FACTORY: &str = "d3d11videosink";
#[cfg(not(any(target_os = "windows", target_os = "linux")))]
const DISPLAY_FACTORY: &str = "glimagesink";

/// Keys the runtime interprets itself instead of handing to the element
const RESERVED: &[&str] = &["factory", "role", "width", "height", "framerate"];

/// Keys the controller reads that elements may or may not have
const HINTS: &[&str] = &["is-live"];

fn invalid(key: &str, reason: impl Into<String>) -> StageError {
    StageError::InvalidProperty {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn factory_name(descriptor: &StageDescriptor) -> Result<&str, StageError> {
    if let Some(factory) = descriptor.property("factory") {
        return factory
            .as_str()
            .ok_or_else(|| invalid("factory", format!("expected string, got {}", factory)));
    }
    let name = match descriptor.kind {
        StageKind::Source if descriptor.device().is_some() => CAPTURE_FACTORY,
        StageKind::Source if descriptor.property("location").is_some() => "filesrc",
        StageKind::Source => "videotestsrc",
        StageKind::Convert => "videoconvert",
        StageKind::Scale => "videoscale",
        StageKind::Filter => "tee",
        StageKind::Encode => "x264enc",
        StageKind::Mux => "rtph264pay",
        StageKind::Sink => match descriptor.property("role").and_then(PropertyValue::as_str) {
            Some("display") => DISPLAY_FACTORY,
            Some("network") => "tcpserversink",
            Some("null") | None => "fakesink",
            Some(other) => return Err(invalid("role", format!("unknown sink role '{}'", other))),
        },
    };
    Ok(name)
}

fn dimension(descriptor: &StageDescriptor, key: &str) -> Result<Option<i32>, StageError> {
    let value = match descriptor.property(key) {
        None => return Ok(None),
        Some(PropertyValue::Int(v)) => *v,
        Some(PropertyValue::Float(v)) if v.fract() == 0.0 => *v as i64,
        Some(other) => return Err(invalid(key, format!("expected integer, got {}", other))),
    };
    i32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .map(Some)
        .ok_or_else(|| invalid(key, format!("{} is not a positive size", value)))
}

/// Raw video caps pinned by the descriptor's size and rate, if it sets any
fn raw_caps(descriptor: &StageDescriptor) -> Result<Option<gst::Caps>, StageError> {
    if !matches!(descriptor.kind, StageKind::Source | StageKind::Scale) {
        return Ok(None);
    }
    let width = dimension(descriptor, "width")?;
    let height = dimension(descriptor, "height")?;
    let framerate = dimension(descriptor, "framerate")?;
    if width.is_none() && height.is_none() && framerate.is_none() {
        return Ok(None);
    }

    let mut caps = gst::Caps::builder("video/x-raw");
    if let Some(width) = width {
        caps = caps.field("width", width);
    }
    if let Some(height) = height {
        caps = caps.field("height", height);
    }
    if let Some(framerate) = framerate {
        caps = caps.field("framerate", gst::Fraction::new(framerate, 1));
    }
    Ok(Some(caps.build()))
}

fn apply_properties(
    element: &gst::Element,
    factory: &str,
    descriptor: &StageDescriptor,
) -> Result<(), StageError> {
    for (key, value) in &descriptor.properties {
        if RESERVED.contains(&key.as_str()) {
            continue;
        }
        let Some(pspec) = element.find_property(key) else {
            if HINTS.contains(&key.as_str()) {
                continue;
            }
            return Err(invalid(key, format!("{} has no such property", factory)));
        };
        let text = match value {
            PropertyValue::Str(s) => s.clone(),
            other => other.to_string(),
        };
        let parsed = glib::Value::deserialize(text.as_str(), pspec.value_type()).map_err(|_| {
            invalid(key, format!("'{}' is not a valid {}", text, pspec.value_type().name()))
        })?;
        element.set_property_from_value(key, &parsed);
    }

    // a live pipeline never prerolls, so sinks must not wait for it
    if descriptor.kind == StageKind::Sink
        && descriptor.property("async").is_none()
        && element.find_property("async").is_some()
    {
        element.set_property("async", false);
    }
    Ok(())
}

fn make(factory: &str, name: &str) -> Result<gst::Element, StageError> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|e| StageError::Unsupported(format!("{} ({}): {}", name, factory, e)))
}

/// Put `element ! capsfilter` in a bin exposing the element's sink pad and
/// the filter's src pad
fn with_caps(name: &str, element: gst::Element, caps: gst::Caps) -> Result<gst::Element, StageError> {
    let failed = |e: glib::BoolError| StageError::Unsupported(format!("{}: {}", name, e));
    let bin = gst::Bin::builder().name(name).build();
    let filter = gst::ElementFactory::make("capsfilter")
        .name(format!("{}-caps", name))
        .property("caps", caps)
        .build()
        .map_err(failed)?;

    bin.add_many([&element, &filter]).map_err(failed)?;
    element
        .link(&filter)
        .map_err(|e| StageError::Unsupported(format!("{}: {}", name, e)))?;

    for target in [element.static_pad("sink"), filter.static_pad("src")].into_iter().flatten() {
        let ghost = gst::GhostPad::with_target(&target).map_err(failed)?;
        bin.add_pad(&ghost).map_err(failed)?;
    }
    Ok(bin.upcast())
}

fn to_gst(state: StageState) -> gst::State {
    match state {
        StageState::Null => gst::State::Null,
        StageState::Ready => gst::State::Ready,
        StageState::Paused => gst::State::Paused,
        StageState::Playing => gst::State::Playing,
    }
}

fn from_gst(state: gst::State) -> StageState {
    match state {
        gst::State::Ready => StageState::Ready,
        gst::State::Paused => StageState::Paused,
        gst::State::Playing => StageState::Playing,
        _ => StageState::Null,
    }
}

/// Stage of the [`super::GstRuntime`]
pub struct GstStage {
    name: String,
    kind: StageKind,
    display: bool,
    element: gst::Element,
    bin: Arc<GraphBin>,
    device: Option<String>,
    lease: Option<String>,
    /// Fans out to several branches, each of which needs its own queue
    fans_out: bool,
    branches: Vec<gst::Element>,
    runtime: Arc<Inner>,
    released: bool,
}

impl GstStage {
    pub(super) fn create(
        descriptor: &StageDescriptor,
        bin: Arc<GraphBin>,
        runtime: Arc<Inner>,
    ) -> Result<Self, StageError> {
        let factory = factory_name(descriptor)?;
        let element = match raw_caps(descriptor)? {
            Some(caps) => {
                let inner = make(factory, &format!("{}-inner", descriptor.name))?;
                apply_properties(&inner, factory, descriptor)?;
                with_caps(&descriptor.name, inner, caps)?
            }
            None => {
                let element = make(factory, &descriptor.name)?;
                apply_properties(&element, factory, descriptor)?;
                element
            }
        };

        let display = descriptor.is_display_sink();
        if display && element.dynamic_cast_ref::<gst_video::VideoOverlay>().is_none() {
            return Err(StageError::Unsupported(format!(
                "{} ({}) cannot render into a window",
                descriptor.name, factory
            )));
        }

        let device = descriptor.device().map(str::to_string);
        if let Some(device) = &device {
            runtime.acquire(device)?;
        }
        let mut stage = Self {
            name: descriptor.name.clone(),
            kind: descriptor.kind,
            display,
            element,
            bin,
            lease: device.clone(),
            device,
            fans_out: factory == "tee",
            branches: Vec::new(),
            runtime,
            released: false,
        };
        if let Err(e) = stage.bin.add(descriptor, &stage.element) {
            stage.release();
            return Err(e);
        }
        Ok(stage)
    }

    pub(super) fn bin(&self) -> &Arc<GraphBin> {
        &self.bin
    }

    pub(super) fn link_to(&mut self, downstream: &mut GstStage) -> Result<(), StageError> {
        let incompatible = |e: glib::BoolError| {
            debug!("link {} -> {} refused: {}", self.name, downstream.name, e);
            StageError::IncompatiblePads {
                upstream: self.name.clone(),
                downstream: downstream.name.clone(),
            }
        };
        if !self.fans_out {
            return self.element.link(&downstream.element).map_err(incompatible);
        }

        let queue = make("queue", &format!("{}-{}-queue", self.name, downstream.name))?;
        self.bin
            .pipeline
            .add(&queue)
            .map_err(|e| StageError::Unsupported(format!("{}: {}", self.name, e)))?;
        if let Err(e) = gst::Element::link_many([&self.element, &queue, &downstream.element]) {
            let _ = self.bin.pipeline.remove(&queue);
            return Err(incompatible(e));
        }
        let _ = queue.sync_state_with_parent();
        self.branches.push(queue);
        Ok(())
    }
}

impl Stage for GstStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    fn is_display_sink(&self) -> bool {
        self.display
    }

    fn set_state(&mut self, target: StageState) -> Result<(), StageError> {
        if self.released {
            return Err(StageError::StateRefused {
                state: target,
                reason: "stage already released".to_string(),
            });
        }
        if target > StageState::Null
            && self.lease.is_none()
            && let Some(device) = &self.device
        {
            self.runtime.acquire(device)?;
            self.lease = Some(device.clone());
        }

        let state = to_gst(target);
        let result = self.element.set_state(state);
        if target == StageState::Null {
            if let Some(device) = self.lease.take() {
                self.runtime.release(&device);
            }
        }
        let success = result.map_err(|e| StageError::StateRefused {
            state: target,
            reason: e.to_string(),
        })?;
        debug!("{}: -> {} ({:?})", self.name, target, success);
        self.bin.follow(&self.name, state);
        Ok(())
    }

    fn current_state(&self) -> StageState {
        let (_, current, _) = self.element.state(gst::ClockTime::ZERO);
        from_gst(current)
    }

    fn set_window_handle(&mut self, handle: Option<SurfaceHandle>) -> Result<(), StageError> {
        let overlay = self
            .element
            .dynamic_cast_ref::<gst_video::VideoOverlay>()
            .ok_or_else(|| StageError::Unsupported(format!("{} does not render into a window", self.name)))?;
        let raw = handle.map(|h| h.raw() as usize).unwrap_or(0);
        // SAFETY: the shell keeps the window alive until it detaches it, and
        // 0 clears the binding
        unsafe { overlay.set_window_handle(raw) };
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        let _ = self.element.set_state(gst::State::Null);
        for queue in self.branches.drain(..) {
            let _ = queue.set_state(gst::State::Null);
            let _ = self.bin.pipeline.remove(&queue);
        }
        self.bin.remove(&self.name, &self.element);
        if let Some(device) = self.lease.take() {
            self.runtime.release(&device);
        }
        self.released = true;
        debug!("released stage {}", self.name);
    }
}

impl Drop for GstStage {
    fn drop(&mut self) {
        self.release();
    }
}
