//! Host-engine boundary.
//!
//! An engine runs operations and, for every op it executes, delivers one
//! [`OperationEvent`] to each subscribed [`OperationObserver`], in execution
//! order. Observers may fail an event; the engine then stops the run and
//! returns that error.
//!
//! - `executor`: runs f32 models for real
//! - `replay`: re-emits a recorded trace
//! - `kernels`: naive NHWC kernels used by the executor

pub mod executor;
pub mod kernels;
pub mod replay;

use std::sync::Arc;

use crate::cost::{Context, OpType};
use crate::error::Result;
use crate::ir::graph::TensorDesc;

pub use executor::Executor;
pub use replay::{RecordedEvent, Recorder, Replay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(pub u64);

/// One executed operation, as seen by observers.
#[derive(Debug, Clone, Copy)]
pub struct OperationEvent<'a> {
    pub op_type: &'a OpType,
    pub inputs: &'a [TensorDesc],
    pub outputs: &'a [TensorDesc],
    pub context: &'a Context,
}

pub trait OperationObserver: Send + Sync {
    fn on_operation(&self, event: &OperationEvent<'_>) -> Result<()>;
}

pub trait HostEngine {
    fn subscribe(&mut self, observer: Arc<dyn OperationObserver>) -> HookId;

    /// Returns `false` if `id` was not subscribed.
    fn unsubscribe(&mut self, id: HookId) -> bool;
}

/// Subscription list shared by engine implementations.
#[derive(Default)]
pub struct Hooks {
    next_id: u64,
    entries: Vec<(HookId, Arc<dyn OperationObserver>)>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Arc<dyn OperationObserver>) -> HookId {
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, observer));
        id
    }

    pub fn unsubscribe(&mut self, id: HookId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(hid, _)| *hid != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver to every observer in subscription order; the first error wins.
    pub fn dispatch(&self, event: &OperationEvent<'_>) -> Result<()> {
        for (_, observer) in &self.entries {
            observer.on_operation(event)?;
        }
        Ok(())
    }
}
