//! Calculator lookup: an immutable process-wide default table, with
//! session-owned overrides consulted first.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::cost::calculator::CostCalculator;
use crate::cost::{defaults, CostUnits, OpType};
use crate::error::{Error, Result};

static BUILTIN: Lazy<DefaultTable> = Lazy::new(defaults::table);
static EMPTY: Lazy<DefaultTable> = Lazy::new(DefaultTable::new);

/// Op type → calculator. Built once, then only read.
#[derive(Debug, Default)]
pub struct DefaultTable {
    calculators: HashMap<OpType, CostCalculator>,
}

impl DefaultTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table covering every reference op kind.
    pub fn builtin() -> &'static DefaultTable {
        &BUILTIN
    }

    pub fn empty() -> &'static DefaultTable {
        &EMPTY
    }

    pub fn insert(&mut self, op: impl Into<OpType>, calculator: CostCalculator) {
        self.calculators.insert(op.into(), calculator);
    }

    pub fn get(&self, op: &str) -> Option<&CostCalculator> {
        self.calculators.get(op)
    }

    pub fn op_types(&self) -> impl Iterator<Item = &OpType> {
        self.calculators.keys()
    }
}

/// Which operations an override applies to.
#[derive(Clone)]
pub enum OpMatcher {
    Exact(OpType),
    Predicate(Arc<dyn Fn(&OpType) -> bool + Send + Sync>),
}

impl OpMatcher {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&OpType) -> bool + Send + Sync + 'static,
    {
        OpMatcher::Predicate(Arc::new(f))
    }

    pub fn matches(&self, op: &OpType) -> bool {
        match self {
            OpMatcher::Exact(ty) => ty == op,
            OpMatcher::Predicate(f) => f(op),
        }
    }
}

impl fmt::Debug for OpMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpMatcher::Exact(ty) => write!(f, "Exact({ty})"),
            OpMatcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<&str> for OpMatcher {
    fn from(s: &str) -> Self {
        OpMatcher::Exact(s.into())
    }
}

impl From<OpType> for OpMatcher {
    fn from(ty: OpType) -> Self {
        OpMatcher::Exact(ty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Default,
    Override,
}

/// A calculator picked for one op, with its unit contract fixed.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub calculator: CostCalculator,
    pub units: CostUnits,
    pub source: Source,
}

#[derive(Debug)]
struct Override {
    matcher: OpMatcher,
    calculator: CostCalculator,
    units: CostUnits,
}

#[derive(Debug)]
pub struct CalculatorRegistry {
    defaults: &'static DefaultTable,
    overrides: Vec<Override>,
}

impl CalculatorRegistry {
    pub fn new(defaults: &'static DefaultTable) -> Self {
        Self {
            defaults,
            overrides: Vec::new(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(DefaultTable::builtin())
    }

    /// Latest matching override, else the default. Never guesses.
    pub fn resolve(&self, op: &OpType) -> Result<Resolved> {
        if let Some(o) = self.overrides.iter().rev().find(|o| o.matcher.matches(op)) {
            return Ok(Resolved {
                calculator: o.calculator.clone(),
                units: o.units,
                source: Source::Override,
            });
        }
        match self.defaults.get(op.as_str()) {
            Some(calc) => Ok(Resolved {
                calculator: calc.clone(),
                units: calc.units().unwrap_or(CostUnits::Elements),
                source: Source::Default,
            }),
            None => Err(Error::UnsupportedOperation(op.clone())),
        }
    }

    /// Install an override. `units` applies when the calculator did not
    /// declare its own. Validation runs first; a rejected calculator leaves
    /// the registry untouched.
    pub fn register_override(
        &mut self,
        matcher: OpMatcher,
        calculator: CostCalculator,
        units: CostUnits,
    ) -> Result<()> {
        calculator.validate()?;
        let units = calculator.units().unwrap_or(units);
        log::debug!("registering cost override for {matcher:?} ({units:?})");
        self.overrides.push(Override {
            matcher,
            calculator,
            units,
        });
        Ok(())
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::signature::{Parameter, Signature};
    use crate::cost::{Context, Cost};

    fn fixed(flops: u64) -> CostCalculator {
        CostCalculator::native(move |_, _, _| Ok(Cost::new(flops, 0, 0)))
    }

    fn flops(reg: &CalculatorRegistry, op: &str) -> u64 {
        let r = reg.resolve(&op.into()).unwrap();
        r.calculator.invoke(&op.into(), &[], &Context::new()).unwrap().flops
    }

    #[test]
    fn unknown_op_is_unsupported() {
        let reg = CalculatorRegistry::new(DefaultTable::empty());
        let err = reg.resolve(&"Mystery".into()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(ref op) if op.as_str() == "Mystery"));
    }

    #[test]
    fn builtin_defaults_resolve_in_elements() {
        let reg = CalculatorRegistry::builtin();
        let r = reg.resolve(&"Convolution2D".into()).unwrap();
        assert_eq!(r.source, Source::Default);
        assert_eq!(r.units, CostUnits::Elements);
    }

    #[test]
    fn override_shadows_default_and_latest_wins() {
        let mut reg = CalculatorRegistry::builtin();
        reg.register_override("ReLU".into(), fixed(1), CostUnits::Bytes)
            .unwrap();
        assert_eq!(flops(&reg, "ReLU"), 1);
        assert_eq!(reg.resolve(&"ReLU".into()).unwrap().units, CostUnits::Bytes);

        reg.register_override(
            OpMatcher::predicate(|op| op.as_str().starts_with("Re")),
            fixed(2),
            CostUnits::Elements,
        )
        .unwrap();
        assert_eq!(flops(&reg, "ReLU"), 2);
        assert_eq!(flops(&reg, "Reshape"), 2);
        assert_eq!(reg.resolve(&"Linear".into()).unwrap().source, Source::Default);
    }

    #[test]
    fn declared_units_beat_registration_units() {
        let mut reg = CalculatorRegistry::new(DefaultTable::empty());
        reg.register_override(
            "X".into(),
            fixed(0).with_units(CostUnits::Bytes),
            CostUnits::Elements,
        )
        .unwrap();
        assert_eq!(reg.resolve(&"X".into()).unwrap().units, CostUnits::Bytes);
    }

    #[test]
    fn invalid_dynamic_calculator_not_registered() {
        let mut reg = CalculatorRegistry::new(DefaultTable::empty());
        let bad = CostCalculator::dynamic(
            Signature::new(vec![Parameter::positional("func"), Parameter::positional("in")]),
            |_, _| Ok(serde_json::json!([0, 0, 0])),
        );
        let err = reg
            .register_override("X".into(), bad, CostUnits::Elements)
            .unwrap_err();
        assert!(matches!(err, Error::Signature(_)));
        assert_eq!(reg.override_count(), 0);
        assert!(reg.resolve(&"X".into()).is_err());
    }

    #[test]
    fn overrides_do_not_leak_between_registries() {
        let mut a = CalculatorRegistry::builtin();
        a.register_override("Linear".into(), fixed(7), CostUnits::Elements)
            .unwrap();
        let b = CalculatorRegistry::builtin();
        assert_eq!(b.resolve(&"Linear".into()).unwrap().source, Source::Default);
        assert_eq!(b.override_count(), 0);
    }
}
