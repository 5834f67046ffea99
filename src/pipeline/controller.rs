//! Pipeline controller
//!
//! Owns one graph at a time and drives it through [`PipelineState`]s on
//! behalf of a presentation shell. All methods run on the shell's thread;
//! runtime messages only reach handlers when the shell pumps the controller
//! with [`PipelineController::dispatch_pending`] or
//! [`PipelineController::next_event`].

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::config::{ControllerConfig, PipelineProfile};
use crate::pipeline::descriptor::{StageDescriptor, Topology};
use crate::pipeline::error::{BindError, BuildError, SwitchError, TransitionError};
use crate::pipeline::events::{
    ControlRequest, Dispatcher, EosAction, EventHandler, HandlerId, RuntimeEvent, Severity,
};
use crate::pipeline::graph::Graph;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::overlay::{OverlayBinder, SurfaceHandle};
use crate::pipeline::state::PipelineState;
use crate::runtime::{BusHandle, BusMessage, Envelope, MediaRuntime, StageState};

/// Descriptors of the last graph built, kept for device switches
#[derive(Debug, Clone)]
struct Recipe {
    descriptors: Vec<StageDescriptor>,
    topology: Topology,
}

pub struct PipelineController<R: MediaRuntime> {
    runtime: R,
    config: ControllerConfig,
    state: PipelineState,
    graph: Option<Graph<R::Stage>>,
    recipe: Option<Recipe>,
    overlay: OverlayBinder,
    dispatcher: Dispatcher,
    /// Bumped whenever a graph is built or released; older events are dropped
    generation: u64,
    bus_tx: mpsc::UnboundedSender<Envelope>,
    bus_rx: mpsc::UnboundedReceiver<Envelope>,
    health: Arc<PipelineHealth>,
}

impl<R: MediaRuntime> PipelineController<R> {
    pub fn new(runtime: R, config: ControllerConfig) -> Self {
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        Self {
            runtime,
            config,
            state: PipelineState::Idle,
            graph: None,
            recipe: None,
            overlay: OverlayBinder::new(),
            dispatcher: Dispatcher::new(),
            generation: 0,
            bus_tx,
            bus_rx,
            health: Arc::new(PipelineHealth::new()),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    pub fn has_graph(&self) -> bool {
        self.graph.is_some()
    }

    pub fn graph(&self) -> Option<&Graph<R::Stage>> {
        self.graph.as_ref()
    }

    /// Surface currently bound to the display sink
    pub fn surface(&self) -> Option<SurfaceHandle> {
        self.overlay.surface()
    }

    /// Capture device of the first device source of the current recipe
    pub fn device(&self) -> Option<&str> {
        self.recipe
            .as_ref()?
            .descriptors
            .iter()
            .find_map(StageDescriptor::device)
    }

    /// Build a new graph. Only allowed while Idle; a previously built idle
    /// graph is released first.
    pub fn build(
        &mut self,
        descriptors: Vec<StageDescriptor>,
        topology: Topology,
    ) -> Result<(), BuildError> {
        if self.state != PipelineState::Idle {
            return Err(BuildError::NotIdle {
                current: self.state,
            });
        }
        self.release_graph();

        let bus = BusHandle::new(self.bus_tx.clone(), self.generation);
        match Graph::build(&self.runtime, &descriptors, &topology, bus) {
            Ok(graph) => {
                info!("pipeline built ({} stages, generation {})", graph.len(), self.generation);
                self.graph = Some(graph);
                self.recipe = Some(Recipe {
                    descriptors,
                    topology,
                });
                self.health.record_build(true);
                Ok(())
            }
            Err(e) => {
                warn!("pipeline build failed: {}", e);
                self.health.record_build(false);
                Err(e)
            }
        }
    }

    pub fn build_profile(&mut self, profile: &PipelineProfile) -> Result<(), BuildError> {
        info!("building profile '{}'", profile.name);
        self.build(profile.stages.clone(), profile.topology())
    }

    /// Request a state change
    ///
    /// Blocks until every stage settled, or until the configured timeout,
    /// after which stages are rolled back to where they were.
    pub fn request_transition(&mut self, target: PipelineState) -> Result<(), TransitionError> {
        let current = self.state;
        if !current.can_transition_to(&target) {
            return Err(TransitionError::IllegalFrom {
                current,
                requested: target,
            });
        }
        if current == target {
            return Ok(());
        }
        if target == PipelineState::Idle {
            self.teardown();
            return Ok(());
        }

        let Some(graph) = self.graph.as_ref() else {
            return Err(TransitionError::NotBuilt);
        };
        if target == PipelineState::Playing
            && self.config.require_surface_for_display
            && !graph.display_sinks().is_empty()
            && !self.overlay.is_attached()
        {
            return Err(TransitionError::SurfaceRequired);
        }

        if let Err(e) = self.drive(current, target) {
            warn!("transition {} -> {} failed: {}", current, target, e);
            self.health.record_transition(false);
            return Err(e);
        }

        if matches!(current, PipelineState::Paused | PipelineState::Playing)
            && target == PipelineState::Ready
        {
            self.detach();
        }
        self.state = target;
        self.health.record_transition(true);
        info!("pipeline {} -> {}", current, target);

        BusHandle::new(self.bus_tx.clone(), self.generation).post(BusMessage::StateChanged {
            from: current,
            to: target,
        });
        Ok(())
    }

    /// Command every stage from `from` to `to` and wait for them to settle,
    /// rolling back on refusal or timeout
    fn drive(&mut self, from: PipelineState, to: PipelineState) -> Result<(), TransitionError> {
        let timeout = self.config.transition_timeout();
        let poll = self.config.poll_interval();
        let Some(graph) = self.graph.as_mut() else {
            return Err(TransitionError::NotBuilt);
        };

        let previous = from.stage_state();
        let target = to.stage_state();
        let raising = target > previous;

        if let Err((stage, e)) = graph.command(target, raising) {
            graph.force(previous, !raising);
            return Err(TransitionError::StageRefused {
                stage,
                reason: e.to_string(),
            });
        }

        let started = Instant::now();
        while let Some(stage) = graph.unsettled(target) {
            if started.elapsed() >= timeout {
                debug!("{} still not {} after {:?}", stage, target, timeout);
                graph.force(previous, !raising);
                return Err(TransitionError::Timeout {
                    requested: to,
                    waited: timeout,
                });
            }
            std::thread::sleep(poll);
        }
        Ok(())
    }

    /// Stop and release the graph, returning to Idle. Always succeeds.
    pub fn teardown(&mut self) {
        if let Some(graph) = self.graph.as_mut() {
            self.overlay.detach(graph);
            graph.force(StageState::Null, false);
        }
        let was = self.state;
        self.release_graph();
        self.state = PipelineState::Idle;
        if was != PipelineState::Idle {
            info!("pipeline {} -> {} (teardown)", was, PipelineState::Idle);
        }
    }

    fn release_graph(&mut self) {
        self.overlay.forget();
        if let Some(mut graph) = self.graph.take() {
            graph.release();
        }
        self.generation += 1;
    }

    /// Stop every stage and refuse everything but teardown
    fn enter_faulted(&mut self) {
        if let Some(graph) = self.graph.as_mut() {
            self.overlay.detach(graph);
            graph.force(StageState::Null, false);
        }
        self.overlay.forget();
        error!("pipeline {} -> {}", self.state, PipelineState::Faulted);
        self.state = PipelineState::Faulted;
    }

    /// Normal end of a finite stream: stop back to Ready
    fn complete_stream(&mut self) {
        let current = self.state;
        if !matches!(current, PipelineState::Paused | PipelineState::Playing) {
            return;
        }
        match self.drive(current, PipelineState::Ready) {
            Ok(()) => {
                self.detach();
                self.state = PipelineState::Ready;
                info!("pipeline {} -> {} (end of stream)", current, PipelineState::Ready);
            }
            Err(e) => {
                warn!("could not stop after end of stream: {}", e);
                self.enter_faulted();
            }
        }
    }

    /// Bind the display sink to a realized surface
    pub fn attach(&mut self, surface: SurfaceHandle) -> Result<(), BindError> {
        if self.state == PipelineState::Faulted {
            return Err(BindError::Faulted);
        }
        let Some(graph) = self.graph.as_mut() else {
            return Err(BindError::NoGraph);
        };
        self.overlay.attach(graph, surface)?;
        info!("surface {} attached", surface);
        Ok(())
    }

    /// Unbind the surface. Does nothing when none is bound.
    pub fn detach(&mut self) {
        match self.graph.as_mut() {
            Some(graph) => self.overlay.detach(graph),
            None => self.overlay.forget(),
        }
    }

    /// Replace the capture device and rebuild, resuming the previous state
    pub fn switch_device(&mut self, device: &str) -> Result<(), SwitchError> {
        let Some(recipe) = self.recipe.clone() else {
            return Err(SwitchError::NoPipeline);
        };
        let Some(source) = recipe.descriptors.iter().position(|d| d.device().is_some()) else {
            return Err(SwitchError::NoCaptureSource);
        };

        let resume = match self.state {
            PipelineState::Faulted => PipelineState::Idle,
            state => state,
        };
        let surface = self.overlay.surface();
        info!(
            "switching capture device {} -> {} (resuming {})",
            self.device().unwrap_or("?"),
            device,
            resume
        );

        self.teardown();

        // the recipe only changes once the new device actually opened
        let mut descriptors = recipe.descriptors;
        descriptors[source] = descriptors[source].clone().with("device", device);
        self.build(descriptors, recipe.topology)
            .map_err(|cause| SwitchError::RebuildFailed { cause })?;
        self.health.record_device_switch();

        if let Some(surface) = surface {
            self.attach(surface).map_err(SwitchError::Reattach)?;
        }
        for step in PipelineState::path_from_idle(resume) {
            self.request_transition(*step).map_err(SwitchError::Resume)?;
        }
        Ok(())
    }

    pub fn register(&mut self, handler: impl EventHandler + 'static) -> HandlerId {
        self.dispatcher.register(handler)
    }

    pub fn unregister(&mut self, id: HandlerId) -> bool {
        self.dispatcher.unregister(id)
    }

    /// Dispatch every message already on the bus. Returns the number of
    /// events delivered to handlers.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(envelope) = self.bus_rx.try_recv() {
            if self.process(envelope).is_some() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Wait for the next event, dispatch it, and return it
    pub async fn next_event(&mut self) -> Option<RuntimeEvent> {
        loop {
            let envelope = self.bus_rx.recv().await?;
            if let Some(event) = self.process(envelope) {
                return Some(event);
            }
        }
    }

    fn process(&mut self, envelope: Envelope) -> Option<RuntimeEvent> {
        if envelope.generation != self.generation {
            debug!(
                "dropping {:?} from generation {} (current {})",
                envelope.message, envelope.generation, self.generation
            );
            self.health.record_discard();
            return None;
        }
        if self.state == PipelineState::Faulted {
            debug!("dropping {:?} while faulted", envelope.message);
            self.health.record_discard();
            return None;
        }

        let event = RuntimeEvent::from(envelope.message);
        match &event {
            RuntimeEvent::Error {
                severity: Severity::Fatal,
                ..
            } => {
                error!("{}", event);
                self.health.record_fatal_error();
                self.enter_faulted();
            }
            RuntimeEvent::Error { .. } => {
                warn!("{}", event);
                self.health.record_recoverable_error();
            }
            RuntimeEvent::EndOfStream { stage } => {
                self.health.record_end_of_stream();
                let live = self
                    .graph
                    .as_ref()
                    .and_then(|g| g.descriptor(stage))
                    .is_some_and(StageDescriptor::is_live_source);
                let action = if live {
                    self.config.events.live_eos
                } else {
                    self.config.events.finite_eos
                };
                info!("{} ({} source, {:?})", event, if live { "live" } else { "finite" }, action);
                match action {
                    EosAction::Fault => self.enter_faulted(),
                    EosAction::Complete => self.complete_stream(),
                    EosAction::Ignore => {}
                }
            }
            RuntimeEvent::StateChanged { .. } => {}
        }

        let requests = self.dispatcher.dispatch(&event);
        self.health.record_dispatch();
        for request in requests {
            self.apply(request);
        }
        Some(event)
    }

    fn apply(&mut self, request: ControlRequest) {
        debug!("applying {:?}", request);
        let result = match &request {
            ControlRequest::Transition(target) => {
                self.request_transition(*target).map_err(|e| e.to_string())
            }
            ControlRequest::Teardown => {
                self.teardown();
                Ok(())
            }
            ControlRequest::SwitchDevice(device) => {
                self.switch_device(device).map_err(|e| e.to_string())
            }
        };
        if let Err(e) = result {
            warn!("handler request {:?} failed: {}", request, e);
        }
    }
}

impl<R: MediaRuntime> Drop for PipelineController<R> {
    fn drop(&mut self) {
        if self.graph.is_some() {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::device::DeviceSelector;
    use crate::pipeline::events::ControlRequests;
    use crate::runtime::SoftRuntime;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    type Controller = PipelineController<SoftRuntime>;

    fn controller(runtime: &SoftRuntime) -> Controller {
        PipelineController::new(runtime.clone(), ControllerConfig::default())
    }

    fn surface(raw: u64) -> SurfaceHandle {
        SurfaceHandle::from_raw(raw).unwrap()
    }

    fn webcam(device: &str) -> Vec<StageDescriptor> {
        vec![
            StageDescriptor::device_source("source", device),
            StageDescriptor::display_sink("sink"),
        ]
    }

    fn streamer(port: u16) -> Vec<StageDescriptor> {
        vec![
            StageDescriptor::test_source("src").with("framerate", 200),
            StageDescriptor::encode("enc"),
            StageDescriptor::mux("pay"),
            StageDescriptor::network_sink("net", "127.0.0.1", port),
        ]
    }

    /// A port nothing listens on right now
    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .unwrap()
    }

    fn port_is_free(port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Records every event delivered to handlers
    fn recorder(controller: &mut Controller) -> Rc<RefCell<Vec<RuntimeEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        controller.register(move |event: &RuntimeEvent, _: &mut ControlRequests| {
            sink.borrow_mut().push(event.clone())
        });
        events
    }

    /// Pump the controller until `cond` holds or a few seconds pass
    fn pump_until(controller: &mut Controller, mut cond: impl FnMut(&Controller) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            controller.dispatch_pending();
            if cond(controller) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_legal_sequence() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();

        controller.request_transition(PipelineState::Ready).unwrap();
        controller.attach(surface(1)).unwrap();
        for target in [
            PipelineState::Playing,
            PipelineState::Paused,
            PipelineState::Playing,
            PipelineState::Idle,
        ] {
            controller.request_transition(target).unwrap();
            assert_eq!(controller.state(), target);
        }
        assert!(!controller.has_graph());
        assert!(!runtime.is_leased("/dev/video0"));
        assert_eq!(runtime.live_stages(), 0);
    }

    #[test]
    fn test_idle_to_playing_is_illegal() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();

        assert_eq!(
            controller.request_transition(PipelineState::Playing),
            Err(TransitionError::IllegalFrom {
                current: PipelineState::Idle,
                requested: PipelineState::Playing
            })
        );
        assert!(matches!(
            controller.request_transition(PipelineState::Faulted),
            Err(TransitionError::IllegalFrom { .. })
        ));
    }

    #[test]
    fn test_transition_preconditions() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        assert_eq!(
            controller.request_transition(PipelineState::Ready),
            Err(TransitionError::NotBuilt)
        );

        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        assert_eq!(
            controller.request_transition(PipelineState::Playing),
            Err(TransitionError::SurfaceRequired)
        );
        assert_eq!(
            controller.build(webcam("/dev/video1"), Topology::Linear),
            Err(BuildError::NotIdle {
                current: PipelineState::Ready
            })
        );
    }

    #[test]
    fn test_network_only_needs_no_surface() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        controller
            .build(
                vec![
                    StageDescriptor::test_source("src"),
                    StageDescriptor::encode("enc"),
                    StageDescriptor::mux("pay"),
                    StageDescriptor::network_sink("net", "127.0.0.1", 0),
                ],
                Topology::Linear,
            )
            .unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();
        assert_eq!(controller.state(), PipelineState::Playing);
    }

    #[test]
    fn test_attach_twice_keeps_second() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        assert_eq!(controller.attach(surface(1)), Err(BindError::NoGraph));

        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.attach(surface(1)).unwrap();
        assert_eq!(controller.surface(), Some(surface(1)));
        controller.attach(surface(2)).unwrap();
        assert_eq!(controller.surface(), Some(surface(2)));
        controller.detach();
        controller.detach();
        assert_eq!(controller.surface(), None);
    }

    #[test]
    fn test_stop_and_pause_binding() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.attach(surface(7)).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();

        controller.request_transition(PipelineState::Paused).unwrap();
        assert_eq!(controller.surface(), Some(surface(7)));
        controller.request_transition(PipelineState::Playing).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        assert_eq!(controller.surface(), None);
    }

    #[test]
    fn test_stop_through_pause_detaches() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.attach(surface(7)).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();

        controller.request_transition(PipelineState::Paused).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        assert_eq!(controller.surface(), None);
    }

    #[test]
    fn test_finite_stream_end_while_paused_detaches() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        controller
            .build(
                vec![
                    StageDescriptor::test_source("src"),
                    StageDescriptor::display_sink("sink"),
                ],
                Topology::Linear,
            )
            .unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.attach(surface(5)).unwrap();
        controller.request_transition(PipelineState::Paused).unwrap();

        runtime.inject_eos("src");
        controller.dispatch_pending();
        assert_eq!(controller.state(), PipelineState::Ready);
        assert_eq!(controller.surface(), None);
    }

    #[test]
    fn test_network_sink_restarts_on_same_port() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        let port = free_port();
        controller.build(streamer(port), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();

        for _ in 0..10 {
            controller.request_transition(PipelineState::Playing).unwrap();
            assert!(!port_is_free(port));
            controller.request_transition(PipelineState::Ready).unwrap();
            assert!(port_is_free(port));
        }
    }

    #[test]
    fn test_teardown_releases_port() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        let port = free_port();
        controller.build(streamer(port), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();

        controller.teardown();
        assert!(port_is_free(port));
    }

    #[test]
    fn test_fault_releases_port() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        let port = free_port();
        controller.build(streamer(port), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();

        runtime.inject_error("net", "Could not write to resource.", None);
        assert!(pump_until(&mut controller, |c| c.state() == PipelineState::Faulted));
        assert!(port_is_free(port));
    }

    #[test]
    fn test_fatal_error_scenario() {
        let runtime = SoftRuntime::with_devices(["devA"]).unwrap();
        let mut controller = controller(&runtime);
        let events = recorder(&mut controller);

        controller.build(webcam("devA"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.attach(surface(1)).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();
        controller.dispatch_pending();
        events.borrow_mut().clear();

        assert_eq!(runtime.inject_error("source", "Could not read from resource.", None), 1);
        assert!(pump_until(&mut controller, |c| c.state() == PipelineState::Faulted));
        assert_eq!(controller.surface(), None);
        assert!(!runtime.is_leased("devA"));

        runtime.inject_error("source", "again", None);
        runtime.inject_eos("source");
        runtime.inject_warning("sink", "late");
        controller.dispatch_pending();
        assert_eq!(controller.state(), PipelineState::Faulted);

        let seen = events.borrow().clone();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], RuntimeEvent::Error { stage, severity: Severity::Fatal, .. } if stage == "source"));

        // Faulted only leaves through teardown
        assert!(matches!(
            controller.request_transition(PipelineState::Ready),
            Err(TransitionError::IllegalFrom { .. })
        ));
        assert_eq!(controller.attach(surface(1)), Err(BindError::Faulted));
        controller.request_transition(PipelineState::Idle).unwrap();
        controller.dispatch_pending();
        assert_eq!(events.borrow().len(), 1);

        controller.build(webcam("devA"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.dispatch_pending();
        assert_eq!(events.borrow().len(), 2);
    }

    #[test]
    fn test_unplugged_device_faults() {
        let runtime = SoftRuntime::with_devices(["/dev/video0"]).unwrap();
        let mut controller = controller(&runtime);
        let events = recorder(&mut controller);
        controller
            .build(
                vec![
                    StageDescriptor::device_source("cam", "/dev/video0").with("framerate", 200),
                    StageDescriptor::null_sink("out"),
                ],
                Topology::Linear,
            )
            .unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();

        runtime.unplug("/dev/video0");
        assert!(pump_until(&mut controller, |c| c.state() == PipelineState::Faulted));
        assert!(events.borrow().iter().any(RuntimeEvent::is_fatal));
    }

    #[test]
    fn test_warning_is_recoverable() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        let events = recorder(&mut controller);
        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();

        runtime.inject_warning("sink", "buffer underrun");
        controller.dispatch_pending();
        assert_eq!(controller.state(), PipelineState::Ready);
        assert!(events.borrow().iter().any(|e| matches!(
            e,
            RuntimeEvent::Error { severity: Severity::Recoverable, .. }
        )));
        assert_eq!(controller.health().summary().recoverable_errors, 1);
    }

    #[test]
    fn test_end_of_stream_policy() {
        let runtime = SoftRuntime::new().unwrap();

        // Finite source completes back to Ready
        let mut controller = controller(&runtime);
        controller
            .build(
                vec![
                    StageDescriptor::test_source("src")
                        .with("num-buffers", 3)
                        .with("framerate", 200),
                    StageDescriptor::null_sink("out"),
                ],
                Topology::Linear,
            )
            .unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();
        assert!(pump_until(&mut controller, |c| c.state() == PipelineState::Ready));
        assert!(controller.has_graph());

        // Live source faults by default
        let mut controller = PipelineController::new(runtime.clone(), ControllerConfig::default());
        controller.build(webcam("/dev/video1"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        runtime.inject_eos("source");
        controller.dispatch_pending();
        assert_eq!(controller.state(), PipelineState::Faulted);
        controller.teardown();

        // ... unless configured otherwise
        let mut config = ControllerConfig::default();
        config.events.live_eos = EosAction::Ignore;
        let mut controller = PipelineController::new(runtime.clone(), config);
        controller.build(webcam("/dev/video1"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        runtime.inject_eos("source");
        assert_eq!(controller.dispatch_pending(), 2);
        assert_eq!(controller.state(), PipelineState::Ready);
    }

    #[test]
    fn test_state_changed_events() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        let events = recorder(&mut controller);
        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.attach(surface(3)).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();
        assert_eq!(events.borrow().len(), 0);

        assert_eq!(controller.dispatch_pending(), 2);
        assert_eq!(
            *events.borrow(),
            vec![
                RuntimeEvent::StateChanged {
                    from: PipelineState::Idle,
                    to: PipelineState::Ready
                },
                RuntimeEvent::StateChanged {
                    from: PipelineState::Ready,
                    to: PipelineState::Playing
                },
            ]
        );
    }

    #[test]
    fn test_stale_events_dropped_after_rebuild() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        let events = recorder(&mut controller);
        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        runtime.inject_warning("sink", "old graph");

        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        assert_eq!(controller.dispatch_pending(), 0);
        assert!(events.borrow().is_empty());
        assert_eq!(controller.health().summary().events_discarded, 1);
    }

    #[test]
    fn test_handler_requests_applied_after_dispatch() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        controller.register(move |event: &RuntimeEvent, requests: &mut ControlRequests| {
            if event.is_fatal() {
                o.borrow_mut().push("home view");
                requests.teardown();
            }
        });
        let o = Rc::clone(&order);
        controller.register(move |event: &RuntimeEvent, _: &mut ControlRequests| {
            if event.is_fatal() {
                o.borrow_mut().push("second handler");
            }
        });

        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.dispatch_pending();

        runtime.inject_error("source", "boom", Some("injected"));
        assert_eq!(controller.dispatch_pending(), 1);
        assert_eq!(*order.borrow(), vec!["home view", "second handler"]);
        assert_eq!(controller.state(), PipelineState::Idle);
        assert!(!controller.has_graph());
    }

    #[test]
    fn test_slow_stage_times_out_and_rolls_back() {
        let runtime = SoftRuntime::new().unwrap();
        let config = ControllerConfig {
            transition_timeout_ms: 50,
            ..ControllerConfig::default()
        };
        let mut controller = PipelineController::new(runtime.clone(), config);
        controller
            .build(
                vec![
                    StageDescriptor::test_source("src"),
                    StageDescriptor::null_sink("out").with("state-delay-ms", 5000),
                ],
                Topology::Linear,
            )
            .unwrap();

        assert_eq!(
            controller.request_transition(PipelineState::Ready),
            Err(TransitionError::Timeout {
                requested: PipelineState::Ready,
                waited: Duration::from_millis(50)
            })
        );
        assert_eq!(controller.state(), PipelineState::Idle);
        assert_eq!(controller.health().summary().transition_failures, 1);
    }

    #[test]
    fn test_refusing_stage_rolls_back() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        controller
            .build(
                vec![
                    StageDescriptor::test_source("src"),
                    StageDescriptor::null_sink("out").with("fail-state", "playing"),
                ],
                Topology::Linear,
            )
            .unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        let err = controller.request_transition(PipelineState::Playing).unwrap_err();
        assert!(matches!(err, TransitionError::StageRefused { ref stage, .. } if stage == "out"));
        assert_eq!(controller.state(), PipelineState::Ready);
        assert_eq!(controller.graph().and_then(|g| g.unsettled(StageState::Ready)), None);
    }

    #[test]
    fn test_device_exclusive_across_controllers() {
        let runtime = SoftRuntime::new().unwrap();
        let mut first = controller(&runtime);
        let mut second = controller(&runtime);

        first.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        assert_eq!(
            second.build(webcam("/dev/video0"), Topology::Linear),
            Err(BuildError::DeviceBusy {
                device: "/dev/video0".into()
            })
        );
        assert!(second.build(webcam("/dev/video1"), Topology::Linear).is_ok());
    }

    #[test]
    fn test_switch_device_resumes_playing() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        let events = recorder(&mut controller);
        assert_eq!(controller.switch_device("/dev/video1"), Err(SwitchError::NoPipeline));

        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.attach(surface(9)).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();

        controller.switch_device("/dev/video1").unwrap();
        assert_eq!(controller.state(), PipelineState::Playing);
        assert_eq!(controller.surface(), Some(surface(9)));
        assert_eq!(controller.device(), Some("/dev/video1"));
        assert!(!runtime.is_leased("/dev/video0"));
        assert!(runtime.is_leased("/dev/video1"));

        // Handlers survive the switch
        controller.dispatch_pending();
        assert!(!events.borrow().is_empty());
        assert_eq!(controller.health().summary().device_switches, 1);
    }

    #[test]
    fn test_switch_device_resumes_paused() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.request_transition(PipelineState::Paused).unwrap();

        controller.switch_device("/dev/video1").unwrap();
        assert_eq!(controller.state(), PipelineState::Paused);
    }

    #[test]
    fn test_failed_switch_leaves_idle() {
        let runtime = SoftRuntime::with_devices(["/dev/video0"]).unwrap();
        let mut controller = controller(&runtime);
        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.attach(surface(1)).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();

        let err = controller.switch_device("/dev/video5").unwrap_err();
        assert!(matches!(
            err,
            SwitchError::RebuildFailed {
                cause: BuildError::StageCreationFailed { .. }
            }
        ));
        assert_eq!(controller.state(), PipelineState::Idle);
        assert!(!controller.has_graph());
        assert_eq!(runtime.live_stages(), 0);
        assert_eq!(controller.device(), Some("/dev/video0"));
        assert_eq!(controller.selected_device().unwrap(), Some("/dev/video0".to_string()));

        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.attach(surface(1)).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();
        assert_eq!(controller.state(), PipelineState::Playing);
    }

    #[test]
    fn test_switch_keeps_stream_port() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        let port = free_port();
        let profile = PipelineProfile::webcam_display_and_stream("/dev/video0", "127.0.0.1", port);
        controller.build_profile(&profile).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.attach(surface(2)).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();

        for device in ["/dev/video1", "/dev/video0", "/dev/video1"] {
            controller.switch_device(device).unwrap();
            assert_eq!(controller.state(), PipelineState::Playing);
            assert_eq!(controller.device(), Some(device));
        }
        assert_eq!(controller.health().summary().device_switches, 3);
    }

    #[test]
    fn test_switch_without_capture_source() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        controller
            .build(
                vec![
                    StageDescriptor::test_source("src"),
                    StageDescriptor::null_sink("out"),
                ],
                Topology::Linear,
            )
            .unwrap();
        assert_eq!(
            controller.switch_device("/dev/video1"),
            Err(SwitchError::NoCaptureSource)
        );
    }

    #[test]
    fn test_switch_from_faulted_ends_idle_with_graph() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        runtime.inject_error("source", "lost", None);
        controller.dispatch_pending();
        assert_eq!(controller.state(), PipelineState::Faulted);

        controller.switch_device("/dev/video1").unwrap();
        assert_eq!(controller.state(), PipelineState::Idle);
        assert!(controller.has_graph());
    }

    #[test]
    fn test_profile_build() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        let profile = PipelineProfile::webcam_display_and_stream("/dev/video0", "127.0.0.1", 0);
        controller.build_profile(&profile).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();
        controller.attach(surface(4)).unwrap();
        controller.request_transition(PipelineState::Playing).unwrap();
        assert_eq!(controller.graph().map(Graph::len), Some(7));
    }

    #[tokio::test]
    async fn test_next_event() {
        let runtime = SoftRuntime::new().unwrap();
        let mut controller = controller(&runtime);
        controller.build(webcam("/dev/video0"), Topology::Linear).unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), controller.next_event())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(RuntimeEvent::StateChanged {
                from: PipelineState::Idle,
                to: PipelineState::Ready
            })
        );
    }
}
