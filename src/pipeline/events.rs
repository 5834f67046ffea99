//! Event bus dispatcher
//!
//! Runtime messages reach the controller through the bus; the controller
//! turns each into a [`RuntimeEvent`] and hands it here. Handlers run in
//! registration order and may queue [`ControlRequest`]s, which the
//! controller applies once every handler has seen the event.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::pipeline::state::PipelineState;
use crate::runtime::BusMessage;

/// Whether an error stops the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Device lost, link broken: the pipeline is forced to Faulted
    Fatal,
    /// Reported as a warning by the stage: forwarded without a transition
    Recoverable,
}

/// Event delivered to registered handlers
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Error {
        stage: String,
        message: String,
        debug: Option<String>,
        severity: Severity,
    },
    EndOfStream {
        stage: String,
    },
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
}

impl RuntimeEvent {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeEvent::Error {
                severity: Severity::Fatal,
                ..
            }
        )
    }
}

impl From<BusMessage> for RuntimeEvent {
    fn from(message: BusMessage) -> Self {
        match message {
            BusMessage::Error {
                stage,
                message,
                debug,
            } => RuntimeEvent::Error {
                stage,
                message,
                debug,
                severity: Severity::Fatal,
            },
            BusMessage::Warning {
                stage,
                message,
                debug,
            } => RuntimeEvent::Error {
                stage,
                message,
                debug,
                severity: Severity::Recoverable,
            },
            BusMessage::Eos { stage } => RuntimeEvent::EndOfStream { stage },
            BusMessage::StateChanged { from, to } => RuntimeEvent::StateChanged { from, to },
        }
    }
}

impl std::fmt::Display for RuntimeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeEvent::Error {
                stage,
                message,
                debug,
                severity,
            } => {
                let level = match severity {
                    Severity::Fatal => "error",
                    Severity::Recoverable => "warning",
                };
                write!(f, "{} from {}: {}", level, stage, message)?;
                if let Some(debug) = debug {
                    write!(f, " ({})", debug)?;
                }
                Ok(())
            }
            RuntimeEvent::EndOfStream { stage } => write!(f, "end of stream from {}", stage),
            RuntimeEvent::StateChanged { from, to } => write!(f, "state changed {} -> {}", from, to),
        }
    }
}

/// What end-of-stream does to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EosAction {
    /// Treat like a fatal error
    Fault,
    /// Normal completion: stop back to Ready
    Complete,
    /// Forward to handlers only
    Ignore,
}

/// Action a handler asks the controller to take after dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Transition(PipelineState),
    Teardown,
    SwitchDevice(String),
}

/// Requests queued by handlers during one dispatch
#[derive(Debug, Default)]
pub struct ControlRequests {
    queue: Vec<ControlRequest>,
}

impl ControlRequests {
    pub fn transition(&mut self, target: PipelineState) {
        self.queue.push(ControlRequest::Transition(target));
    }

    pub fn teardown(&mut self) {
        self.queue.push(ControlRequest::Teardown);
    }

    pub fn switch_device(&mut self, device: impl Into<String>) {
        self.queue.push(ControlRequest::SwitchDevice(device.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn into_vec(self) -> Vec<ControlRequest> {
        self.queue
    }
}

/// Receiver of runtime events. Must return promptly.
pub trait EventHandler {
    fn handle(&mut self, event: &RuntimeEvent, requests: &mut ControlRequests);
}

impl<F> EventHandler for F
where
    F: FnMut(&RuntimeEvent, &mut ControlRequests),
{
    fn handle(&mut self, event: &RuntimeEvent, requests: &mut ControlRequests) {
        self(event, requests)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Ordered set of handlers
#[derive(Default)]
pub struct Dispatcher {
    handlers: Vec<(HandlerId, Box<dyn EventHandler>)>,
    next_id: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl EventHandler + 'static) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers.push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unregister(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(h, _)| *h != id);
        self.handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler once, in registration order
    pub fn dispatch(&mut self, event: &RuntimeEvent) -> Vec<ControlRequest> {
        let mut requests = ControlRequests::default();
        for (_, handler) in self.handlers.iter_mut() {
            handler.handle(event, &mut requests);
        }
        debug!("dispatched '{}' to {} handler(s)", event, self.handlers.len());
        requests.into_vec()
    }
}
