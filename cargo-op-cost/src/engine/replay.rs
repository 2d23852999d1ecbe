//! Recorded event traces: capture them with [`Recorder`], feed them back
//! with [`Replay`]. Traces are plain JSON, so events from engines this crate
//! cannot run can still be costed.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cost::{Context, OpType};
use crate::engine::{HookId, Hooks, HostEngine, OperationEvent, OperationObserver};
use crate::error::{Error, Result};
use crate::ir::graph::TensorDesc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub op_type: OpType,
    pub inputs: Vec<TensorDesc>,
    #[serde(default)]
    pub outputs: Vec<TensorDesc>,
    #[serde(default)]
    pub context: Context,
}

impl RecordedEvent {
    pub fn new(op_type: impl Into<OpType>, inputs: Vec<TensorDesc>, outputs: Vec<TensorDesc>) -> Self {
        Self {
            op_type: op_type.into(),
            inputs,
            outputs,
            context: Context::new(),
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn as_event(&self) -> OperationEvent<'_> {
        OperationEvent {
            op_type: &self.op_type,
            inputs: &self.inputs,
            outputs: &self.outputs,
            context: &self.context,
        }
    }
}

impl From<&OperationEvent<'_>> for RecordedEvent {
    fn from(ev: &OperationEvent<'_>) -> Self {
        Self {
            op_type: ev.op_type.clone(),
            inputs: ev.inputs.to_vec(),
            outputs: ev.outputs.to_vec(),
            context: ev.context.clone(),
        }
    }
}

/// Observer that keeps a copy of every event it sees.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&*self.events.lock())
            .map_err(|e| Error::Graph(format!("cannot serialize trace: {e}")))
    }
}

impl OperationObserver for Recorder {
    fn on_operation(&self, event: &OperationEvent<'_>) -> Result<()> {
        self.events.lock().push(RecordedEvent::from(event));
        Ok(())
    }
}

/// Engine that re-emits a fixed list of events.
pub struct Replay {
    events: Vec<RecordedEvent>,
    hooks: Hooks,
}

impl HostEngine for Replay {
    fn subscribe(&mut self, observer: Arc<dyn OperationObserver>) -> HookId {
        self.hooks.subscribe(observer)
    }

    fn unsubscribe(&mut self, id: HookId) -> bool {
        self.hooks.unsubscribe(id)
    }
}

impl Replay {
    pub fn new(events: Vec<RecordedEvent>) -> Self {
        Self {
            events,
            hooks: Hooks::new(),
        }
    }

    pub fn from_json(text: &str) -> Result<Replay> {
        let events =
            serde_json::from_str(text).map_err(|e| Error::Graph(format!("bad trace JSON: {e}")))?;
        Ok(Self::new(events))
    }

    pub fn load(path: &Path) -> Result<Replay> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// Emit every event in order. Stops at the first observer error.
    pub fn run(&mut self) -> Result<()> {
        for ev in &self.events {
            self.hooks.dispatch(&ev.as_event())?;
        }
        Ok(())
    }

    /// Emit a single extra event, as an engine executing one more op would.
    pub fn emit(&mut self, event: &RecordedEvent) -> Result<()> {
        self.hooks.dispatch(&event.as_event())
    }
}
