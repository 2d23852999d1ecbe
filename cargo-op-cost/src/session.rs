//! Scoped cost-accounting session.
//!
//! A session is created inactive, entered once against a host engine,
//! observes every op the engine executes while entered, and is exited when
//! the [`ActiveSession`] guard is dropped (or `exit()`ed). Exiting always
//! unsubscribes from the engine, even after an event failed. The report
//! stays readable afterwards but no longer changes.
//!
//! ```no_run
//! use op_cost::{engine::Executor, zoo, InterceptionSession};
//!
//! let model = zoo::simple_convnet()?;
//! let session = InterceptionSession::new();
//! let mut exec = Executor::new();
//! session.scope(&mut exec, |exec| exec.run(&model, &vec![0.0; 3072]))?;
//! println!("{} flops", session.totals().flops);
//! # Ok::<(), op_cost::Error>(())
//! ```

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SessionConfig;
use crate::cost::registry::{CalculatorRegistry, DefaultTable, OpMatcher};
use crate::cost::{Cost, CostCalculator, CostUnits, OpType};
use crate::engine::{HookId, HostEngine, OperationEvent, OperationObserver};
use crate::error::{Error, Result};
use crate::ir::graph::TensorDesc;
use crate::report::{CostReport, LayerCostEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, never entered
    Inactive,
    Active,
    /// Entered and exited; cannot be entered again
    Exited,
}

struct SessionCore {
    phase: Phase,
    registry: CalculatorRegistry,
    counters: HashMap<OpType, u32>,
    report: CostReport,
}

struct Shared {
    config: SessionConfig,
    core: Mutex<SessionCore>,
    /// Held for the whole of one event so occurrence numbering and report
    /// order agree even if several threads deliver events.
    dispatch: Mutex<()>,
}

pub struct InterceptionSession {
    shared: Arc<Shared>,
}

impl Default for InterceptionSession {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptionSession {
    /// Default configuration, built-in calculators.
    pub fn new() -> Self {
        Self::from_parts(SessionConfig::default(), CalculatorRegistry::builtin())
    }

    /// Built-in calculators plus the overrides `config` declares.
    pub fn with_config(config: SessionConfig) -> Result<Self> {
        Self::with_defaults(config, DefaultTable::builtin())
    }

    pub fn with_defaults(config: SessionConfig, defaults: &'static DefaultTable) -> Result<Self> {
        let mut registry = CalculatorRegistry::new(defaults);
        for decl in &config.elementwise {
            registry.register_override(
                OpMatcher::Exact(decl.op_type.clone()),
                decl.calculator(),
                CostUnits::Elements,
            )?;
        }
        Ok(Self::from_parts(config, registry))
    }

    fn from_parts(config: SessionConfig, registry: CalculatorRegistry) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                core: Mutex::new(SessionCore {
                    phase: Phase::Inactive,
                    registry,
                    counters: HashMap::new(),
                    report: CostReport::new(),
                }),
                dispatch: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn phase(&self) -> Phase {
        self.shared.core.lock().phase
    }

    /// Start observing `engine`. Clears the report and occurrence counters;
    /// overrides registered beforehand are kept.
    pub fn enter<'s, 'e, E>(&'s self, engine: &'e mut E) -> Result<ActiveSession<'s, 'e, E>>
    where
        E: HostEngine + ?Sized,
    {
        {
            let mut core = self.shared.core.lock();
            match core.phase {
                Phase::Inactive => {}
                Phase::Active => {
                    return Err(Error::SessionState("session is already active".to_string()))
                }
                Phase::Exited => {
                    return Err(Error::SessionState(
                        "session was already exited and cannot be re-entered".to_string(),
                    ))
                }
            }
            core.report.clear();
            core.counters.clear();
            core.phase = Phase::Active;
        }
        let hook = engine.subscribe(Arc::new(SessionHook(self.shared.clone())));
        log::info!("cost session entered ({hook:?})");
        Ok(ActiveSession {
            session: self,
            engine,
            hook: Some(hook),
        })
    }

    /// Enter, run `f` against the engine, exit. Exit happens whether or not
    /// `f` fails.
    pub fn scope<E, T, F>(&self, engine: &mut E, f: F) -> Result<T>
    where
        E: HostEngine + ?Sized,
        F: FnOnce(&mut E) -> Result<T>,
    {
        let mut active = self.enter(engine)?;
        let result = f(&mut *active);
        active.exit();
        result
    }

    /// Register a dynamic calculator for the op type named by its first
    /// parameter's annotation. Nothing is registered if the signature is
    /// invalid.
    pub fn add_custom_cost_calculator(&self, calculator: CostCalculator) -> Result<()> {
        let signature = calculator.signature().ok_or_else(|| {
            Error::Signature(
                "native calculators carry no annotation to infer the op type from; \
                 use register_cost_calculator"
                    .to_string(),
            )
        })?;
        let target = signature.target().ok_or_else(|| {
            Error::Signature("first positional parameter has no op type annotation".to_string())
        })?;
        self.register_cost_calculator(target, calculator)
    }

    /// Register an override for an explicit op type or predicate. Takes
    /// effect for every later event; earlier entries are untouched.
    pub fn register_cost_calculator(
        &self,
        matcher: impl Into<OpMatcher>,
        calculator: CostCalculator,
    ) -> Result<()> {
        let mut core = self.shared.core.lock();
        if core.phase == Phase::Exited {
            return Err(Error::SessionState(
                "cannot register calculators on an exited session".to_string(),
            ));
        }
        core.registry
            .register_override(matcher.into(), calculator, self.shared.config.custom_units)
    }

    /// Snapshot of the report.
    pub fn report(&self) -> CostReport {
        self.shared.core.lock().report.clone()
    }

    pub fn entries(&self) -> Vec<LayerCostEntry> {
        self.shared.core.lock().report.entries().to_vec()
    }

    pub fn entry(&self, label: &str) -> Result<LayerCostEntry> {
        self.shared.core.lock().report.entry(label).cloned()
    }

    pub fn totals(&self) -> Cost {
        self.shared.core.lock().report.totals()
    }
}

/// The entered state of a session, borrowing the engine it observes.
/// Derefs to the engine so the caller can keep driving it.
pub struct ActiveSession<'s, 'e, E: HostEngine + ?Sized> {
    session: &'s InterceptionSession,
    engine: &'e mut E,
    hook: Option<HookId>,
}

impl<E: HostEngine + ?Sized> ActiveSession<'_, '_, E> {
    pub fn session(&self) -> &InterceptionSession {
        self.session
    }

    pub fn exit(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(hook) = self.hook.take() {
            if !self.engine.unsubscribe(hook) {
                log::warn!("engine did not know cost session hook {hook:?}");
            }
            let mut core = self.session.shared.core.lock();
            core.phase = Phase::Exited;
            log::info!(
                "cost session exited: {} entries, {} flops",
                core.report.len(),
                core.report.totals().flops
            );
        }
    }
}

impl<E: HostEngine + ?Sized> Deref for ActiveSession<'_, '_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.engine
    }
}

impl<E: HostEngine + ?Sized> DerefMut for ActiveSession<'_, '_, E> {
    fn deref_mut(&mut self) -> &mut E {
        self.engine
    }
}

impl<E: HostEngine + ?Sized> Drop for ActiveSession<'_, '_, E> {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionHook(Arc<Shared>);

impl OperationObserver for SessionHook {
    fn on_operation(&self, event: &OperationEvent<'_>) -> Result<()> {
        self.0.record(event)
    }
}

impl Shared {
    fn record(&self, event: &OperationEvent<'_>) -> Result<()> {
        let _serial = self.dispatch.lock();
        let op = event.op_type;

        // Resolve under the lock, invoke outside it, so a calculator may
        // itself register overrides.
        let (resolved, occurrence) = {
            let core = self.core.lock();
            if core.phase != Phase::Active {
                return Err(Error::SessionState(format!(
                    "'{op}' delivered to a session that is not active"
                )));
            }
            let occurrence = core.counters.get(op).copied().unwrap_or(0) + 1;
            let resolved = core.registry.resolve(op).map_err(|e| {
                log::warn!("{e}");
                e
            })?;
            (resolved, occurrence)
        };

        let mut context = event.context.clone();
        context.insert_default("fma_1flop", self.config.fma_1flop);

        let raw = resolved
            .calculator
            .invoke(op, event.inputs, &context)
            .map_err(|e| {
                log::warn!("{e}");
                e
            })?;
        let cost = match resolved.units {
            CostUnits::Bytes => raw,
            CostUnits::Elements => elements_to_bytes(op, raw, event.inputs, event.outputs)?,
        };

        let mut core = self.core.lock();
        let entry = LayerCostEntry {
            label: LayerCostEntry::label_for(op, occurrence),
            op_type: op.clone(),
            occurrence,
            flops: cost.flops,
            mread: cost.mread,
            mwrite: cost.mwrite,
            inputs: event.inputs.to_vec(),
            outputs: event.outputs.to_vec(),
        };
        log::debug!(
            "{}: flops={} mread={} mwrite={}",
            entry.label,
            entry.flops,
            entry.mread,
            entry.mwrite
        );
        core.report.push(entry).map_err(|e| {
            log::warn!("{e}");
            e
        })?;
        core.counters.insert(op.clone(), occurrence);
        Ok(())
    }
}

/// Reads are sized by the first input, writes by the first output; each
/// falls back to the other side when missing.
fn elements_to_bytes(
    op: &OpType,
    raw: Cost,
    inputs: &[TensorDesc],
    outputs: &[TensorDesc],
) -> Result<Cost> {
    let first_in = inputs.first().map(TensorDesc::itemsize);
    let first_out = outputs.first().map(TensorDesc::itemsize);
    let width = |primary: Option<u64>, fallback: Option<u64>, count: u64| match primary.or(fallback) {
        Some(w) => Ok(w),
        None if count == 0 => Ok(0),
        None => Err(Error::CalculatorResult {
            op_type: op.clone(),
            reason: "element counts reported for an op without operand descriptors".to_string(),
        }),
    };
    let read_w = width(first_in, first_out, raw.mread)?;
    let write_w = width(first_out, first_in, raw.mwrite)?;
    raw.to_bytes(read_w, write_w)
        .ok_or_else(|| Error::CalculatorResult {
            op_type: op.clone(),
            reason: "byte count overflows u64".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::signature::{Parameter, Signature};
    use crate::cost::Context;
    use crate::engine::{Hooks, RecordedEvent, Replay};
    use crate::ir::graph::DType;
    use serde_json::json;

    fn f32(shape: &[usize]) -> TensorDesc {
        TensorDesc::new(shape.to_vec(), DType::F32)
    }

    fn ev(op: &str) -> RecordedEvent {
        RecordedEvent::new(op, vec![f32(&[1, 3, 32, 32])], vec![f32(&[1, 3, 32, 32])])
    }

    fn add_constant_sig() -> Signature {
        Signature::new(vec![
            Parameter::positional("func").annotated("AddConstant"),
            Parameter::positional("in_data"),
            Parameter::var_keyword("kwargs"),
        ])
    }

    #[test]
    fn labels_count_per_type() {
        let session = InterceptionSession::new();
        let mut replay = Replay::new(vec![ev("ReLU"), ev("AddConstant"), ev("ReLU"), ev("ReLU")]);
        session.scope(&mut replay, |r| r.run()).unwrap();
        let labels: Vec<String> = session.entries().into_iter().map(|e| e.label).collect();
        assert_eq!(labels, ["ReLU-1", "AddConstant-1", "ReLU-2", "ReLU-3"]);
        assert_eq!(session.phase(), Phase::Exited);
    }

    #[test]
    fn custom_calculator_counts_elements_by_default() {
        let session = InterceptionSession::new();
        session
            .add_custom_cost_calculator(CostCalculator::dynamic(add_constant_sig(), |_, _| {
                Ok(json!([100, 100, 100]))
            }))
            .unwrap();
        let mut replay = Replay::new(vec![ev("AddConstant")]);
        session.scope(&mut replay, |r| r.run()).unwrap();
        let e = session.entry("AddConstant-1").unwrap();
        assert_eq!((e.flops, e.mread, e.mwrite), (100, 400, 400));
    }

    #[test]
    fn bytes_units_recorded_verbatim() {
        let config = SessionConfig {
            custom_units: CostUnits::Bytes,
            ..SessionConfig::default()
        };
        let session = InterceptionSession::with_config(config).unwrap();
        session
            .register_cost_calculator("ReLU", CostCalculator::native(|_, _, _| Ok(Cost::new(1, 2, 3))))
            .unwrap();
        let mut replay = Replay::new(vec![ev("ReLU")]);
        session.scope(&mut replay, |r| r.run()).unwrap();
        assert_eq!(session.entry("ReLU-1").unwrap().cost(), Cost::new(1, 2, 3));
    }

    #[test]
    fn mixed_widths_scale_each_side() {
        let session = InterceptionSession::new();
        session
            .register_cost_calculator("Cast", CostCalculator::native(|_, _, _| Ok(Cost::new(0, 10, 10))))
            .unwrap();
        let cast = RecordedEvent::new(
            "Cast",
            vec![TensorDesc::new(vec![10], DType::F64)],
            vec![TensorDesc::new(vec![10], DType::F16)],
        );
        let mut replay = Replay::new(vec![cast]);
        session.scope(&mut replay, |r| r.run()).unwrap();
        assert_eq!(session.totals(), Cost::new(0, 80, 20));
    }

    #[test]
    fn missing_annotation_or_native_cannot_infer_target() {
        let session = InterceptionSession::new();
        let unannotated = CostCalculator::dynamic(
            Signature::new(vec![
                Parameter::positional("func"),
                Parameter::positional("in_data"),
                Parameter::var_keyword("kwargs"),
            ]),
            |_, _| Ok(json!(null)),
        );
        assert!(matches!(
            session.add_custom_cost_calculator(unannotated),
            Err(Error::Signature(_))
        ));
        let native = CostCalculator::native(|_, _, _| Ok(Cost::ZERO));
        assert!(matches!(
            session.add_custom_cost_calculator(native),
            Err(Error::Signature(_))
        ));
    }

    #[test]
    fn fma_setting_reaches_calculators() {
        let config = SessionConfig {
            fma_1flop: false,
            ..SessionConfig::default()
        };
        let session = InterceptionSession::with_config(config).unwrap();
        session
            .register_cost_calculator(
                "Inspect",
                CostCalculator::native(|_, _, ctx| {
                    let fma = ctx.get_bool("fma_1flop").ok_or("missing fma_1flop")?;
                    Ok(Cost::new(if fma { 1 } else { 2 }, 0, 0))
                }),
            )
            .unwrap();
        let mut replay = Replay::new(vec![
            ev("Inspect"),
            ev("Inspect").with_context(Context::new().with("fma_1flop", true)),
        ]);
        session.scope(&mut replay, |r| r.run()).unwrap();
        let flops: Vec<u64> = session.entries().iter().map(|e| e.flops).collect();
        assert_eq!(flops, [2, 1]);
    }

    #[test]
    fn failed_event_leaves_counter_contiguous() {
        let session = InterceptionSession::new();
        session
            .register_cost_calculator(
                "Flaky",
                CostCalculator::native(|_, inputs, _| {
                    if inputs.is_empty() {
                        Err("no inputs".to_string())
                    } else {
                        Ok(Cost::new(1, 0, 0))
                    }
                }),
            )
            .unwrap();
        let mut replay = Replay::new(vec![]);
        let mut active = session.enter(&mut replay).unwrap();
        active.emit(&ev("Flaky")).unwrap();
        let err = active.emit(&RecordedEvent::new("Flaky", vec![], vec![])).unwrap_err();
        assert!(matches!(err, Error::CalculatorResult { .. }));
        active.emit(&ev("Flaky")).unwrap();
        drop(active);

        let labels: Vec<String> = session.entries().into_iter().map(|e| e.label).collect();
        assert_eq!(labels, ["Flaky-1", "Flaky-2"]);
    }

    #[test]
    fn totals_overflow_rejects_the_event() {
        let config = SessionConfig {
            custom_units: CostUnits::Bytes,
            ..SessionConfig::default()
        };
        let session = InterceptionSession::with_config(config).unwrap();
        session
            .register_cost_calculator(
                "Big",
                CostCalculator::native(|_, _, _| Ok(Cost::new(u64::MAX / 2 + 1, 0, 0))),
            )
            .unwrap();
        let mut replay = Replay::new(vec![ev("Big"), ev("Big"), ev("Big")]);
        let err = session.scope(&mut replay, |r| r.run()).unwrap_err();
        assert!(matches!(err, Error::CalculatorResult { .. }));
        let labels: Vec<String> = session.entries().into_iter().map(|e| e.label).collect();
        assert_eq!(labels, ["Big-1"]);
        assert_eq!(session.totals().flops, u64::MAX / 2 + 1);
        assert_eq!(session.phase(), Phase::Exited);
    }

    #[test]
    fn oversized_tensor_is_a_calculator_error() {
        let session = InterceptionSession::new();
        let huge = f32(&[1 << 32, 1 << 32, 2]);
        let mut replay = Replay::new(vec![
            ev("ReLU"),
            RecordedEvent::new("ReLU", vec![huge.clone()], vec![huge]),
        ]);
        let err = session.scope(&mut replay, |r| r.run()).unwrap_err();
        assert!(matches!(err, Error::CalculatorResult { ref reason, .. } if reason.contains("overflows")));
        assert_eq!(session.report().len(), 1);
    }

    #[test]
    fn panic_inside_scope_still_unsubscribes() {
        let session = InterceptionSession::new();
        let mut replay = Replay::new(vec![ev("ReLU")]);
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            session.scope(&mut replay, |r| -> Result<()> {
                r.run()?;
                panic!("engine blew up");
            })
        }));
        assert!(caught.is_err());
        assert_eq!(replay.hook_count(), 0);
        assert_eq!(session.phase(), Phase::Exited);
        assert_eq!(session.entries().len(), 1);
    }

    #[test]
    fn calculator_may_register_overrides_mid_event() {
        let session = Arc::new(InterceptionSession::new());
        let inner = session.clone();
        session
            .register_cost_calculator(
                "Setup",
                CostCalculator::native(move |_, _, _| {
                    inner
                        .register_cost_calculator(
                            "Later",
                            CostCalculator::native(|_, _, _| Ok(Cost::new(9, 0, 0))),
                        )
                        .map_err(|e| e.to_string())?;
                    Ok(Cost::ZERO)
                }),
            )
            .unwrap();
        let mut replay = Replay::new(vec![ev("Setup"), ev("Later")]);
        session.scope(&mut replay, |r| r.run()).unwrap();
        assert_eq!(session.entry("Later-1").unwrap().flops, 9);
    }

    #[test]
    fn enter_twice_fails() {
        let session = InterceptionSession::new();
        let mut a = Replay::new(vec![]);
        let mut b = Replay::new(vec![]);
        let active = session.enter(&mut a).unwrap();
        assert!(matches!(session.enter(&mut b), Err(Error::SessionState(_))));
        active.exit();
        assert!(matches!(session.enter(&mut b), Err(Error::SessionState(_))));
    }

    #[test]
    fn exited_session_rejects_registration_and_events() {
        let session = InterceptionSession::new();
        let mut replay = Replay::new(vec![ev("ReLU")]);
        session.scope(&mut replay, |r| r.run()).unwrap();
        let late = CostCalculator::native(|_, _, _| Ok(Cost::ZERO));
        assert!(matches!(
            session.register_cost_calculator("ReLU", late),
            Err(Error::SessionState(_))
        ));

        // A stale hook that somehow outlived exit still cannot mutate the report.
        let hook = SessionHook(session.shared.clone());
        let stale = ev("ReLU");
        assert!(hook.on_operation(&stale.as_event()).is_err());
        assert_eq!(session.report().len(), 1);
    }

    #[test]
    fn concurrent_delivery_keeps_labels_unique() {
        let session = InterceptionSession::new();
        let mut hooks = Hooks::new();
        let mut replay = Replay::new(vec![]);
        let active = session.enter(&mut replay).unwrap();
        hooks.subscribe(Arc::new(SessionHook(session.shared.clone())));

        let event = ev("ReLU");
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..25 {
                        hooks.dispatch(&event.as_event()).unwrap();
                    }
                });
            }
        });
        drop(active);

        let report = session.report();
        assert_eq!(report.len(), 100);
        for (i, e) in report.entries().iter().enumerate() {
            assert_eq!(e.occurrence as usize, i + 1);
        }
    }
}
