//! Per-invocation cost rows in execution order, with running totals.
//!
//! Rows are only ever appended, so `totals()` is maintained incrementally
//! and always equals the sum over `entries()`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cost::{Cost, OpType};
use crate::error::{Error, Result};
use crate::ir::graph::TensorDesc;

/// One report row. Memory figures are bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCostEntry {
    /// `"<op type>-<occurrence>"`, unique within a session
    pub label: String,
    pub op_type: OpType,
    /// 1-based count of this op type within the session
    pub occurrence: u32,
    pub flops: u64,
    pub mread: u64,
    pub mwrite: u64,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
}

impl LayerCostEntry {
    pub fn label_for(op_type: &OpType, occurrence: u32) -> String {
        format!("{op_type}-{occurrence}")
    }

    pub fn cost(&self) -> Cost {
        Cost::new(self.flops, self.mread, self.mwrite)
    }
}

/// Per-op-type aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeSummary {
    pub op_type: OpType,
    pub count: u32,
    pub flops: u64,
    pub mread: u64,
    pub mwrite: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CostReport {
    #[serde(rename = "layers")]
    entries: Vec<LayerCostEntry>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    #[serde(rename = "total")]
    totals: Cost,
}

impl CostReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows in execution order.
    pub fn entries(&self) -> &[LayerCostEntry] {
        &self.entries
    }

    pub fn entry(&self, label: &str) -> Result<&LayerCostEntry> {
        self.index
            .get(label)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| Error::NotFound(label.to_string()))
    }

    pub fn totals(&self) -> Cost {
        self.totals
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Totals per op type, in order of first appearance.
    pub fn summary(&self) -> Vec<TypeSummary> {
        let mut order: Vec<TypeSummary> = Vec::new();
        let mut slot: HashMap<&OpType, usize> = HashMap::new();
        for e in &self.entries {
            let i = *slot.entry(&e.op_type).or_insert_with(|| {
                order.push(TypeSummary {
                    op_type: e.op_type.clone(),
                    count: 0,
                    flops: 0,
                    mread: 0,
                    mwrite: 0,
                });
                order.len() - 1
            });
            let s = &mut order[i];
            s.count = s.count.saturating_add(1);
            s.flops = s.flops.saturating_add(e.flops);
            s.mread = s.mread.saturating_add(e.mread);
            s.mwrite = s.mwrite.saturating_add(e.mwrite);
        }
        order
    }

    /// Append a row. Nothing changes if the label is taken or the totals
    /// would overflow.
    pub(crate) fn push(&mut self, entry: LayerCostEntry) -> Result<()> {
        if self.index.contains_key(&entry.label) {
            return Err(Error::SessionState(format!(
                "duplicate report label '{}'",
                entry.label
            )));
        }
        let totals = self.totals.checked_add(entry.cost()).ok_or_else(|| {
            Error::CalculatorResult {
                op_type: entry.op_type.clone(),
                reason: format!("adding {} to the report totals overflows u64", entry.label),
            }
        })?;
        self.totals = totals;
        self.index.insert(entry.label.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.totals = Cost::ZERO;
    }
}
