//! Session configuration, loadable from JSON.
//!
//! ```json
//! {
//!   "fma_1flop": false,
//!   "custom_units": "bytes",
//!   "elementwise": [
//!     { "op_type": "Exp", "flops_per_element": 4 }
//!   ]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cost::{Cost, CostCalculator, CostUnits, OpType};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Count a fused multiply-add as one flop.
    pub fma_1flop: bool,
    /// Units assumed for custom calculators that do not declare their own.
    pub custom_units: CostUnits,
    /// Per-element calculators installed as overrides when a session is created.
    pub elementwise: Vec<ElementwiseCost>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fma_1flop: true,
            custom_units: CostUnits::Elements,
            elementwise: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(text: &str) -> Result<SessionConfig> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<SessionConfig> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }
}

/// A calculator linear in the size of the first input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElementwiseCost {
    pub op_type: OpType,
    #[serde(default = "one")]
    pub flops_per_element: u64,
    #[serde(default = "one")]
    pub reads_per_element: u64,
    #[serde(default = "one")]
    pub writes_per_element: u64,
}

fn one() -> u64 {
    1
}

impl ElementwiseCost {
    pub fn calculator(&self) -> CostCalculator {
        let (f, r, w) = (
            self.flops_per_element,
            self.reads_per_element,
            self.writes_per_element,
        );
        CostCalculator::native(move |op, inputs, _| {
            let n = inputs
                .first()
                .ok_or_else(|| format!("{op}: no inputs"))?
                .size()
                .ok_or_else(|| format!("{op}: input size overflows u64"))?;
            let scale = |k: u64| k.checked_mul(n).ok_or_else(|| format!("{op}: cost overflows u64"));
            Ok(Cost::new(scale(f)?, scale(r)?, scale(w)?))
        })
        .with_units(CostUnits::Elements)
    }
}
