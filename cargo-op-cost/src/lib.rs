//! Theoretical cost accounting for computation graphs: FLOPs and memory
//! traffic per executed op, collected by a scoped session that observes a
//! host engine.

pub mod config;
pub mod cost;
pub mod engine;
pub mod error;
pub mod export;
pub mod ir;
pub mod report;
pub mod session;
pub mod zoo;

pub use config::SessionConfig;
pub use cost::{Context, Cost, CostCalculator, CostUnits, OpMatcher, OpType, Parameter, Signature};
pub use error::{Error, Result};
pub use report::{CostReport, LayerCostEntry};
pub use session::{ActiveSession, InterceptionSession};
