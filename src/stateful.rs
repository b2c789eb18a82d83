//! Rule-based state machine testing.
//!
//! A [`RuleSet`] bundles named rules (with optional preconditions) and
//! invariants over some model type. [`run_state_machine`] drives one
//! attempt: a continue/stop boolean, a rule pick among the enabled rules
//! and the rule's own draws, all inside one span per step so the shrinker
//! can delete whole steps, including dependent pairs.

use crate::data::ConjectureData;
use crate::engine::{check, RunReport, Settings};
use crate::errors::{DrawError, EngineError, TestError};

/// Span label for one state-machine step.
pub const STEP_SPAN: u64 = 0x73746570;

/// An insertion-ordered pool of values produced by earlier rules and
/// consumed by later ones. Draws shrink toward the oldest entry.
#[derive(Debug, Clone)]
pub struct Bundle<T> {
    values: Vec<T>,
}

impl<T> Bundle<T> {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn push(&mut self, value: T) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Pick one stored value by drawn index. An empty bundle rejects the
    /// attempt rather than failing it.
    pub fn draw<'b>(&'b self, data: &mut ConjectureData) -> Result<&'b T, DrawError> {
        if self.values.is_empty() {
            return Err(DrawError::Unsatisfied("draw from empty bundle".into()));
        }
        let index = data.draw_integer(Some(0), Some(self.values.len() as i128 - 1), 0, None)?;
        Ok(&self.values[index as usize])
    }

    /// Like [`Bundle::draw`] but removes the value from the pool.
    pub fn take(&mut self, data: &mut ConjectureData) -> Result<T, DrawError> {
        if self.values.is_empty() {
            return Err(DrawError::Unsatisfied("take from empty bundle".into()));
        }
        let index = data.draw_integer(Some(0), Some(self.values.len() as i128 - 1), 0, None)?;
        Ok(self.values.remove(index as usize))
    }
}

impl<T> Default for Bundle<T> {
    fn default() -> Self {
        Self::new()
    }
}

type Precondition<M> = Box<dyn Fn(&M) -> bool>;
type RuleFn<M> = Box<dyn Fn(&mut M, &mut ConjectureData) -> Result<(), TestError>>;
type InvariantFn<M> = Box<dyn Fn(&M) -> Result<(), TestError>>;

/// One named transition over the model.
pub struct RuleDef<M> {
    pub name: &'static str,
    precondition: Option<Precondition<M>>,
    run: RuleFn<M>,
}

impl<M> RuleDef<M> {
    fn enabled(&self, model: &M) -> bool {
        self.precondition.as_ref().map_or(true, |pre| pre(model))
    }
}

impl<M> std::fmt::Debug for RuleDef<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleDef")
            .field("name", &self.name)
            .field("precondition", &self.precondition.is_some())
            .finish()
    }
}

/// The rules and invariants of one state machine, built fluently.
pub struct RuleSet<M> {
    rules: Vec<RuleDef<M>>,
    invariants: Vec<(&'static str, InvariantFn<M>)>,
}

impl<M> RuleSet<M> {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            invariants: Vec::new(),
        }
    }

    pub fn rule(
        mut self,
        name: &'static str,
        run: impl Fn(&mut M, &mut ConjectureData) -> Result<(), TestError> + 'static,
    ) -> Self {
        self.rules.push(RuleDef {
            name,
            precondition: None,
            run: Box::new(run),
        });
        self
    }

    /// A rule that only participates while its precondition holds.
    pub fn rule_if(
        mut self,
        name: &'static str,
        precondition: impl Fn(&M) -> bool + 'static,
        run: impl Fn(&mut M, &mut ConjectureData) -> Result<(), TestError> + 'static,
    ) -> Self {
        self.rules.push(RuleDef {
            name,
            precondition: Some(Box::new(precondition)),
            run: Box::new(run),
        });
        self
    }

    /// Checked after the initial state and after every step.
    pub fn invariant(
        mut self,
        name: &'static str,
        checkfn: impl Fn(&M) -> Result<(), TestError> + 'static,
    ) -> Self {
        self.invariants.push((name, Box::new(checkfn)));
        self
    }

    fn check_invariants(&self, model: &M) -> Result<(), TestError> {
        for (name, checkfn) in &self.invariants {
            checkfn(model).map_err(|err| match err {
                TestError::Failure { origin, message } => TestError::Failure {
                    origin,
                    message: format!("invariant {name}: {message}"),
                },
                other => other,
            })?;
        }
        Ok(())
    }
}

impl<M> Default for RuleSet<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive one attempt of the machine over `model`.
///
/// Each step draws a continue boolean (forced to stop at `max_steps`),
/// picks among the rules whose preconditions hold, runs it, then checks
/// every invariant. Returns the number of steps taken.
pub fn run_state_machine<M>(
    model: &mut M,
    rules: &RuleSet<M>,
    data: &mut ConjectureData,
    max_steps: usize,
) -> Result<usize, TestError> {
    if rules.rules.is_empty() {
        return Err(DrawError::InvalidArguments("rule set has no rules".into()).into());
    }
    rules.check_invariants(model)?;

    // Average machine length sits well under the cap, so most attempts
    // stop on their own and the forced stop only bounds the worst case.
    let p_continue = max_steps as f64 / (max_steps as f64 + 1.0);
    let mut steps = 0;
    loop {
        data.start_span(STEP_SPAN);
        let forced = if steps >= max_steps { Some(false) } else { None };
        let proceed = data.draw_boolean(p_continue, forced)?;
        if !proceed {
            data.stop_span();
            break;
        }

        let enabled: Vec<usize> = rules
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.enabled(model))
            .map(|(i, _)| i)
            .collect();
        if enabled.is_empty() {
            data.stop_span();
            return Err(DrawError::Unsatisfied("no rule is enabled".into()).into());
        }

        let pick = data.draw_integer(Some(0), Some(enabled.len() as i128 - 1), 0, None)?;
        let rule = &rules.rules[enabled[pick as usize]];
        data.note_event(format!("rule:{}", rule.name));

        let step = (rule.run)(model, data).and_then(|()| rules.check_invariants(model));
        data.stop_span();
        step?;
        steps += 1;
    }
    Ok(steps)
}

/// Run a state machine as a property: build a fresh model per attempt and
/// let the engine generate, replay and shrink step sequences.
pub fn check_state_machine<M>(
    name: &str,
    settings: Settings,
    init: impl Fn() -> M,
    rules: &RuleSet<M>,
) -> Result<RunReport, EngineError> {
    let max_steps = settings.stateful_step_count;
    check(name, settings, |data| {
        let mut model = init();
        run_state_machine(&mut model, rules, data, max_steps)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::choice::ChoiceValue;
    use crate::engine::Verbosity;
    use crate::errors::verify;
    use std::collections::HashMap;

    fn quiet_settings() -> Settings {
        Settings {
            max_examples: 100,
            seed: Some(99),
            stateful_step_count: 20,
            verbosity: Verbosity::Quiet,
            ..Settings::default()
        }
    }

    #[test]
    fn empty_rule_set_is_an_argument_error() {
        let rules: RuleSet<u32> = RuleSet::new();
        let result = check_state_machine("stateful::empty", quiet_settings(), || 0u32, &rules);
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn step_count_respects_the_cap() {
        let rules = RuleSet::new().rule("tick", |model: &mut u32, _| {
            *model += 1;
            Ok(())
        });
        let report =
            check_state_machine("stateful::capped", quiet_settings(), || 0u32, &rules).unwrap();
        assert!(report.passed());
    }

    #[test]
    fn invariant_violations_are_found_and_minimized() {
        // A counter that only increments; the invariant breaks at 3. The
        // minimal machine is exactly three "inc" steps.
        let rules = RuleSet::new()
            .rule("inc", |model: &mut u32, _| {
                *model += 1;
                Ok(())
            })
            .rule("noop", |_, _| Ok(()))
            .invariant("below_three", |model: &u32| verify(*model < 3, "below_three"));
        let report = check_state_machine(
            "stateful::counter",
            quiet_settings(),
            || 0u32,
            &rules,
        )
        .unwrap();
        assert_eq!(report.failures.len(), 1);
        let choices = &report.failures[0].choices;
        // Three steps of (continue=true, pick=inc) plus nothing after: the
        // failing step ends the attempt before a final stop flag.
        assert_eq!(
            choices.as_slice(),
            &[
                ChoiceValue::Boolean(true),
                ChoiceValue::Integer(0),
                ChoiceValue::Boolean(true),
                ChoiceValue::Integer(0),
                ChoiceValue::Boolean(true),
                ChoiceValue::Integer(0),
            ]
        );
    }

    #[test]
    fn preconditions_gate_rule_selection() {
        // "dec" is disabled at zero, so the model can never go negative
        // and the invariant holds.
        let rules = RuleSet::new()
            .rule("inc", |model: &mut i64, _| {
                *model += 1;
                Ok(())
            })
            .rule_if(
                "dec",
                |model: &i64| *model > 0,
                |model: &mut i64, _| {
                    *model -= 1;
                    Ok(())
                },
            )
            .invariant("non_negative", |model: &i64| {
                verify(*model >= 0, "non_negative")
            });
        let report = check_state_machine(
            "stateful::preconditions",
            quiet_settings(),
            || 0i64,
            &rules,
        )
        .unwrap();
        assert!(report.passed());
    }

    #[test]
    fn bundle_draw_rejects_when_empty() {
        let bundle: Bundle<u8> = Bundle::new();
        let mut data = ConjectureData::for_choices(vec![]);
        assert!(matches!(
            bundle.draw(&mut data),
            Err(DrawError::Unsatisfied(_))
        ));
    }

    #[test]
    fn bundle_draw_picks_by_index() {
        let mut bundle = Bundle::new();
        bundle.push("a");
        bundle.push("b");
        bundle.push("c");
        let mut data = ConjectureData::for_choices(vec![ChoiceValue::Integer(2)]);
        assert_eq!(bundle.draw(&mut data).unwrap(), &"c");
    }

    #[test]
    fn bundle_take_removes_the_value() {
        let mut bundle = Bundle::new();
        bundle.push(10);
        bundle.push(20);
        let mut data = ConjectureData::for_choices(vec![ChoiceValue::Integer(0)]);
        assert_eq!(bundle.take(&mut data).unwrap(), 10);
        assert_eq!(bundle.len(), 1);
    }

    #[test]
    fn buggy_store_shrinks_to_a_short_interaction() {
        // Key/value store whose delete leaves the key readable; checked
        // against a plain map. A put followed by a delete of the same key
        // exposes it, so the shrunk machine is two steps.
        #[derive(Default)]
        struct System {
            store: HashMap<u8, u8>,
            deleted: Vec<u8>,
            model: HashMap<u8, u8>,
        }
        impl System {
            fn get(&self, key: u8) -> Option<u8> {
                // Bug: deletion is recorded but not applied.
                self.store.get(&key).copied()
            }
        }
        let rules = RuleSet::new()
            .rule("put", |sys: &mut System, data: &mut ConjectureData| {
                let key = data.draw_integer(Some(0), Some(3), 0, None)? as u8;
                let value = data.draw_integer(Some(0), Some(255), 0, None)? as u8;
                sys.store.insert(key, value);
                sys.model.insert(key, value);
                Ok(())
            })
            .rule("delete", |sys: &mut System, data: &mut ConjectureData| {
                let key = data.draw_integer(Some(0), Some(3), 0, None)? as u8;
                sys.deleted.push(key);
                sys.model.remove(&key);
                Ok(())
            })
            .invariant("matches_model", |sys: &System| {
                for key in 0..4u8 {
                    verify(sys.get(key) == sys.model.get(&key).copied(), "matches_model")?;
                }
                Ok(())
            });
        let settings = Settings {
            max_examples: 300,
            ..quiet_settings()
        };
        let report =
            check_state_machine("stateful::buggy_store", settings, System::default, &rules)
                .unwrap();
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.origin.label, "matches_model");
        // put(0, 0) then delete(0): two full steps, seven choices.
        assert_eq!(
            failure.choices.as_slice(),
            &[
                ChoiceValue::Boolean(true),
                ChoiceValue::Integer(0),
                ChoiceValue::Integer(0),
                ChoiceValue::Integer(0),
                ChoiceValue::Boolean(true),
                ChoiceValue::Integer(1),
                ChoiceValue::Integer(0),
            ]
        );
    }
}
