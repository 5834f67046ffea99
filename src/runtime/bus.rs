//! Message bus between stage workers and the controller thread
//!
//! Stage workers post from arbitrary threads; the controller owns the single
//! receiving end and drains it on its own thread, so handlers never run
//! concurrently with a transition request.

use log::debug;
use tokio::sync::mpsc;

use crate::pipeline::state::PipelineState;

/// Message posted on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// Error-level condition reported by a stage
    Error {
        stage: String,
        message: String,
        debug: Option<String>,
    },

    /// Warning-level condition reported by a stage
    Warning {
        stage: String,
        message: String,
        debug: Option<String>,
    },

    /// A stage ran out of data
    Eos { stage: String },

    /// The pipeline as a whole completed a requested transition
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
}

/// Bus message stamped with the graph generation that produced it
#[derive(Debug, Clone)]
pub struct Envelope {
    pub generation: u64,
    pub message: BusMessage,
}

/// Sending end of the bus, bound to one graph generation
#[derive(Debug, Clone)]
pub struct BusHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    generation: u64,
}

impl BusHandle {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// Generation of the graph this handle was issued for
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether both handles feed the same controller for the same graph
    pub fn same_bus(&self, other: &BusHandle) -> bool {
        self.generation == other.generation && self.tx.same_channel(&other.tx)
    }

    /// Post a message. Returns false once the controller is gone.
    pub fn post(&self, message: BusMessage) -> bool {
        let envelope = Envelope {
            generation: self.generation,
            message,
        };
        match self.tx.send(envelope) {
            Ok(()) => true,
            Err(_) => {
                debug!("bus closed, dropping message (generation {})", self.generation);
                false
            }
        }
    }

    pub fn error(&self, stage: &str, message: impl Into<String>, debug: Option<String>) -> bool {
        self.post(BusMessage::Error {
            stage: stage.to_string(),
            message: message.into(),
            debug,
        })
    }

    pub fn warning(&self, stage: &str, message: impl Into<String>, debug: Option<String>) -> bool {
        self.post(BusMessage::Warning {
            stage: stage.to_string(),
            message: message.into(),
            debug,
        })
    }

    pub fn eos(&self, stage: &str) -> bool {
        self.post(BusMessage::Eos {
            stage: stage.to_string(),
        })
    }
}
