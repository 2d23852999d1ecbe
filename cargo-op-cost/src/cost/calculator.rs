//! The cost-calculator capability.
//!
//! Two flavours share one type:
//! - **native**: a Rust closure whose shape the compiler checks
//! - **dynamic**: a declared [`Signature`] plus a body over JSON values, for
//!   calculators supplied at runtime. The signature is validated before the
//!   calculator can be registered, and the returned value is checked on every
//!   call.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::cost::signature::{self, Signature};
use crate::cost::{Context, Cost, CostUnits, OpType};
use crate::error::{Error, Result};
use crate::ir::graph::TensorDesc;

type NativeFn =
    dyn Fn(&OpType, &[TensorDesc], &Context) -> std::result::Result<Cost, String> + Send + Sync;

/// Body of a dynamic calculator: positional arguments, keyword arguments.
pub type DynamicBody =
    dyn Fn(&[Value], &Map<String, Value>) -> std::result::Result<Value, String> + Send + Sync;

#[derive(Clone)]
enum Callable {
    Native(Arc<NativeFn>),
    Dynamic {
        signature: Signature,
        body: Arc<DynamicBody>,
    },
}

#[derive(Clone)]
pub struct CostCalculator {
    callable: Callable,
    units: Option<CostUnits>,
}

impl CostCalculator {
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&OpType, &[TensorDesc], &Context) -> std::result::Result<Cost, String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            callable: Callable::Native(Arc::new(f)),
            units: None,
        }
    }

    pub fn dynamic<F>(signature: Signature, body: F) -> Self
    where
        F: Fn(&[Value], &Map<String, Value>) -> std::result::Result<Value, String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            callable: Callable::Dynamic {
                signature,
                body: Arc::new(body),
            },
            units: None,
        }
    }

    /// Declare what this calculator's memory numbers count. Undeclared
    /// calculators take the registering session's configured units.
    pub fn with_units(mut self, units: CostUnits) -> Self {
        self.units = Some(units);
        self
    }

    pub fn units(&self) -> Option<CostUnits> {
        self.units
    }

    /// Declared signature, for dynamic calculators.
    pub fn signature(&self) -> Option<&Signature> {
        match &self.callable {
            Callable::Native(_) => None,
            Callable::Dynamic { signature, .. } => Some(signature),
        }
    }

    /// Structural check run at registration. Native calculators always pass.
    pub fn validate(&self) -> Result<()> {
        match &self.callable {
            Callable::Native(_) => Ok(()),
            Callable::Dynamic { signature, .. } => signature::validate(signature),
        }
    }

    /// Run the calculator. Any failure, including a malformed result, is a
    /// [`Error::CalculatorResult`]; nothing is coerced.
    pub fn invoke(&self, op: &OpType, inputs: &[TensorDesc], ctx: &Context) -> Result<Cost> {
        let fail = |reason: String| Error::CalculatorResult {
            op_type: op.clone(),
            reason,
        };
        match &self.callable {
            Callable::Native(f) => f(op, inputs, ctx).map_err(fail),
            Callable::Dynamic { body, .. } => {
                let inputs = serde_json::to_value(inputs).map_err(|e| fail(e.to_string()))?;
                let args = [Value::String(op.to_string()), inputs];
                let value = body(&args, &ctx.to_json()).map_err(fail)?;
                parse_triple(&value).map_err(fail)
            }
        }
    }
}

impl fmt::Debug for CostCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.callable {
            Callable::Native(_) => "native",
            Callable::Dynamic { .. } => "dynamic",
        };
        f.debug_struct("CostCalculator")
            .field("kind", &kind)
            .field("units", &self.units)
            .finish()
    }
}

fn parse_triple(value: &Value) -> std::result::Result<Cost, String> {
    let items = match value.as_array() {
        Some(items) if items.len() == 3 => items,
        Some(items) => return Err(format!("expected 3 values, got {}", items.len())),
        None => return Err(format!("expected a 3-element array, got {value}")),
    };
    let mut out = [0u64; 3];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item
            .as_u64()
            .ok_or_else(|| format!("{item} is not a non-negative integer"))?;
    }
    Ok(Cost::new(out[0], out[1], out[2]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::signature::Parameter;
    use crate::ir::graph::DType;
    use serde_json::json;

    fn sig() -> Signature {
        Signature::new(vec![
            Parameter::positional("func"),
            Parameter::positional("in_data"),
            Parameter::var_keyword("kwargs"),
        ])
    }

    fn inputs() -> Vec<TensorDesc> {
        vec![TensorDesc::new(vec![2, 3], DType::F32)]
    }

    #[test]
    fn native_invocation() {
        let calc = CostCalculator::native(|_, inputs, _| {
            let n = inputs[0].size().ok_or("too big")?;
            Ok(Cost::new(n, n, n))
        });
        assert!(calc.validate().is_ok());
        assert!(calc.signature().is_none());
        let cost = calc.invoke(&"ReLU".into(), &inputs(), &Context::new()).unwrap();
        assert_eq!(cost, Cost::new(6, 6, 6));
    }

    #[test]
    fn native_failure_is_calculator_result_error() {
        let calc = CostCalculator::native(|_, _, _| Err("boom".to_string()));
        let err = calc.invoke(&"ReLU".into(), &inputs(), &Context::new()).unwrap_err();
        assert!(matches!(err, Error::CalculatorResult { ref reason, .. } if reason == "boom"));
    }

    #[test]
    fn dynamic_sees_op_inputs_and_context() {
        let calc = CostCalculator::dynamic(sig(), |args, kwargs| {
            assert_eq!(args[0], json!("AddConstant"));
            assert_eq!(args[1][0]["shape"], json!([2, 3]));
            let scale = kwargs.get("scale").and_then(Value::as_u64).unwrap_or(1);
            Ok(json!([6 * scale, 6, 6]))
        });
        let ctx = Context::new().with("scale", 10);
        let cost = calc.invoke(&"AddConstant".into(), &inputs(), &ctx).unwrap();
        assert_eq!(cost, Cost::new(60, 6, 6));
    }

    #[test]
    fn dynamic_rejects_malformed_results() {
        for bad in [
            json!(null),
            json!([1, 2]),
            json!([1, 2, 3, 4]),
            json!([1, -2, 3]),
            json!([1.5, 2, 3]),
            json!({"flops": 1}),
        ] {
            let calc = CostCalculator::dynamic(sig(), move |_, _| Ok(bad.clone()));
            let err = calc.invoke(&"X".into(), &inputs(), &Context::new()).unwrap_err();
            assert!(matches!(err, Error::CalculatorResult { .. }));
        }
    }

    #[test]
    fn units_declaration() {
        let calc = CostCalculator::native(|_, _, _| Ok(Cost::ZERO));
        assert_eq!(calc.units(), None);
        assert_eq!(calc.with_units(CostUnits::Bytes).units(), Some(CostUnits::Bytes));
    }
}
