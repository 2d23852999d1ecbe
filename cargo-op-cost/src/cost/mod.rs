//! Cost model vocabulary: operation type ids, the (flops, mread, mwrite)
//! triple, unit contracts and the context bag handed to calculators.
//!
//! - `calculator`: the callable contract (native closures and dynamic calculators)
//! - `signature`: structural validation of dynamic calculators
//! - `registry`: default table + session overrides
//! - `defaults`: built-in formulas for the reference op set

pub mod calculator;
pub mod defaults;
pub mod registry;
pub mod signature;

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use calculator::{CostCalculator, DynamicBody};
pub use registry::{CalculatorRegistry, DefaultTable, OpMatcher};
pub use signature::{ParamKind, Parameter, Signature};

/// Identifier naming a class of primitive operation (e.g. `Convolution2D`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpType(String);

impl OpType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OpType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OpType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for OpType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Floating-point operations and memory traffic of one invocation.
///
/// Whether `mread`/`mwrite` are element counts or bytes depends on the
/// [`CostUnits`] of the calculator that produced it; report entries always
/// hold bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    pub flops: u64,
    pub mread: u64,
    pub mwrite: u64,
}

impl Cost {
    pub const ZERO: Cost = Cost {
        flops: 0,
        mread: 0,
        mwrite: 0,
    };

    pub const fn new(flops: u64, mread: u64, mwrite: u64) -> Self {
        Self {
            flops,
            mread,
            mwrite,
        }
    }

    /// Scale element counts to bytes. `None` on overflow.
    pub fn to_bytes(self, read_width: u64, write_width: u64) -> Option<Cost> {
        Some(Cost {
            flops: self.flops,
            mread: self.mread.checked_mul(read_width)?,
            mwrite: self.mwrite.checked_mul(write_width)?,
        })
    }

    /// Field-wise sum. `None` if any field overflows.
    pub fn checked_add(self, rhs: Cost) -> Option<Cost> {
        Some(Cost {
            flops: self.flops.checked_add(rhs.flops)?,
            mread: self.mread.checked_add(rhs.mread)?,
            mwrite: self.mwrite.checked_add(rhs.mwrite)?,
        })
    }
}

impl From<(u64, u64, u64)> for Cost {
    fn from((flops, mread, mwrite): (u64, u64, u64)) -> Self {
        Cost::new(flops, mread, mwrite)
    }
}

/// Saturating; use [`Cost::checked_add`] where overflow must be reported.
impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost {
            flops: self.flops.saturating_add(rhs.flops),
            mread: self.mread.saturating_add(rhs.mread),
            mwrite: self.mwrite.saturating_add(rhs.mwrite),
        }
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        *self = *self + rhs;
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, Add::add)
    }
}

/// What a calculator's `mread`/`mwrite` numbers count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostUnits {
    /// Element counts, scaled by the operands' byte widths when recorded.
    #[default]
    Elements,
    /// Raw byte counts, recorded as-is.
    Bytes,
}

/// Open bag of keyword data passed through to calculators: op attributes
/// from the engine (`stride`, `ksize`, ...) and session settings (`fma_1flop`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(BTreeMap<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Insert only if the key is not already present.
    pub fn insert_default(&mut self, key: &str, value: impl Into<Value>) {
        self.0
            .entry(key.to_string())
            .or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    /// A two-element integer array such as `"stride": [2, 2]`.
    pub fn get_pair(&self, key: &str) -> Option<[u64; 2]> {
        let arr = self.get(key)?.as_array()?;
        match arr.as_slice() {
            [a, b] => Some([a.as_u64()?, b.as_u64()?]),
            _ => None,
        }
    }

    pub fn merge(&mut self, other: &Context) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> serde_json::Map<String, Value> {
        self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}
