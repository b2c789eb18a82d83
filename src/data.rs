//! Per-attempt test-case state.
//!
//! [`ConjectureData`] is the choice source a strategy draws from during one
//! attempt. It supports three construction modes: fresh (provider-backed),
//! strict replay of a recorded sequence, and prefix replay that falls back
//! to fresh entropy once the prefix is exhausted. Individual draws can also
//! be forced, which is how explicit examples pin values.
//!
//! Everything downstream (shrinking, persistence, flakiness detection)
//! relies on one invariant: replaying the identical sequence through the
//! identical strategy produces the identical value.

use crate::choice::{
    choice_permitted, BooleanConstraints, BytesConstraints, ChoiceNode, ChoiceValue, Constraints,
    FloatConstraints, IntegerConstraints, StringConstraints,
};
use crate::errors::DrawError;
use crate::provider::PrimitiveProvider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Default cap on draws per attempt.
pub const DEFAULT_MAX_CHOICES: usize = 8192;

/// Recursion bound for deferred/self-referential strategies.
pub const MAX_STRATEGY_DEPTH: usize = 100;

/// Outcome classification for one attempt, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    /// The sequence was exhausted (or misaligned) before the test finished
    /// drawing. Treated as invalid for bookkeeping.
    Overrun,
    /// An assumption failed; the attempt is discarded.
    Invalid,
    /// The test ran to completion and passed.
    Valid,
    /// The test failed; the attempt is a shrink candidate.
    Interesting,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Overrun => write!(f, "overrun"),
            Status::Invalid => write!(f, "invalid"),
            Status::Valid => write!(f, "valid"),
            Status::Interesting => write!(f, "interesting"),
        }
    }
}

/// Coarse identity of a failure: enough to tell unrelated bugs apart, not
/// so much that shrinking a value changes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterestingOrigin {
    /// Failure kind: `assertion`, `panic`, `deadline`, ...
    pub kind: String,
    /// Stable location or label within that kind.
    pub label: String,
}

impl InterestingOrigin {
    pub fn assertion(label: &str) -> Self {
        Self {
            kind: "assertion".into(),
            label: label.into(),
        }
    }

    pub fn panic(message: &str) -> Self {
        // Panic payloads embed formatted values; keep only the first line
        // so the same panic site with different data groups together.
        let label = message.lines().next().unwrap_or("").chars().take(120).collect();
        Self {
            kind: "panic".into(),
            label,
        }
    }

    pub fn deadline() -> Self {
        Self {
            kind: "deadline".into(),
            label: "per-attempt deadline exceeded".into(),
        }
    }
}

impl std::fmt::Display for InterestingOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.kind, self.label)
    }
}

/// A labeled contiguous run of nodes, recorded so the shrinker can delete
/// whole logical blocks (collection elements, state-machine steps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub label: u64,
    pub start: usize,
    pub end: usize,
}

/// Frozen snapshot of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ConjectureResult {
    pub status: Status,
    pub interesting_origin: Option<InterestingOrigin>,
    pub nodes: Vec<ChoiceNode>,
    pub spans: Vec<Span>,
    pub target_observations: BTreeMap<String, f64>,
    pub events: Vec<String>,
    pub draw_time: Duration,
}

impl ConjectureResult {
    pub fn choices(&self) -> Vec<ChoiceValue> {
        self.nodes.iter().map(|n| n.value.clone()).collect()
    }
}

enum Entropy {
    Fresh(Box<dyn PrimitiveProvider>),
    /// Replay `prefix`, then either stop (strict) or continue fresh.
    Replay {
        prefix: Vec<ChoiceValue>,
        position: usize,
        extend: Option<Box<dyn PrimitiveProvider>>,
    },
}

/// The choice source for one attempt.
pub struct ConjectureData {
    entropy: Entropy,
    pub nodes: Vec<ChoiceNode>,
    max_choices: usize,
    pub status: Status,
    pub interesting_origin: Option<InterestingOrigin>,
    frozen: bool,
    spans: Vec<Span>,
    span_stack: Vec<(u64, usize)>,
    pub events: Vec<String>,
    pub target_observations: BTreeMap<String, f64>,
    pub draw_time: Duration,
    depth: usize,
}

impl ConjectureData {
    fn with_entropy(entropy: Entropy) -> Self {
        Self {
            entropy,
            nodes: Vec::new(),
            max_choices: DEFAULT_MAX_CHOICES,
            status: Status::Valid,
            interesting_origin: None,
            frozen: false,
            spans: Vec::new(),
            span_stack: Vec::new(),
            events: Vec::new(),
            target_observations: BTreeMap::new(),
            draw_time: Duration::ZERO,
            depth: 0,
        }
    }

    /// Fresh generation backed by `provider`.
    pub fn new(provider: Box<dyn PrimitiveProvider>) -> Self {
        Self::with_entropy(Entropy::Fresh(provider))
    }

    /// Strict replay of a recorded sequence; exhaustion is an overrun.
    pub fn for_choices(choices: Vec<ChoiceValue>) -> Self {
        Self::with_entropy(Entropy::Replay {
            prefix: choices,
            position: 0,
            extend: None,
        })
    }

    /// Replay `prefix`, then continue with fresh entropy. Used for database
    /// reuse and targeted mutation, where the strategy may legitimately
    /// draw past the recorded sequence.
    pub fn with_prefix(prefix: Vec<ChoiceValue>, provider: Box<dyn PrimitiveProvider>) -> Self {
        Self::with_entropy(Entropy::Replay {
            prefix,
            position: 0,
            extend: Some(provider),
        })
    }

    pub fn set_max_choices(&mut self, max_choices: usize) {
        self.max_choices = max_choices;
    }

    pub fn frozen(&self) -> bool {
        self.frozen
    }

    pub fn choices(&self) -> Vec<ChoiceValue> {
        self.nodes.iter().map(|n| n.value.clone()).collect()
    }

    fn record(&mut self, value: ChoiceValue, constraints: Constraints, was_forced: bool) {
        let index = self.nodes.len();
        self.nodes
            .push(ChoiceNode::new(value, constraints, was_forced, index));
    }

    fn overrun(&mut self) -> DrawError {
        self.status = Status::Overrun;
        DrawError::Overrun
    }

    fn pop_choice(
        &mut self,
        constraints: Constraints,
        forced: Option<ChoiceValue>,
    ) -> Result<ChoiceValue, DrawError> {
        if self.frozen {
            return Err(DrawError::Frozen);
        }
        if self.nodes.len() >= self.max_choices {
            return Err(self.overrun());
        }
        if let Some(value) = forced {
            if !choice_permitted(&value, &constraints) {
                return Err(DrawError::InvalidArguments(format!(
                    "forced value {value:?} violates its constraints"
                )));
            }
            // A forced draw still occupies one slot of a replayed sequence;
            // skipping it would misalign every draw after it.
            if let Entropy::Replay {
                prefix, position, ..
            } = &mut self.entropy
            {
                if *position < prefix.len() {
                    *position += 1;
                }
            }
            self.record(value.clone(), constraints, true);
            return Ok(value);
        }
        let started = Instant::now();
        let drawn = match &mut self.entropy {
            Entropy::Fresh(provider) => draw_from_provider(provider.as_mut(), &constraints),
            Entropy::Replay {
                prefix,
                position,
                extend,
            } => {
                if *position < prefix.len() {
                    let value = prefix[*position].clone();
                    *position += 1;
                    if value.choice_type() != constraints.choice_type()
                        || !choice_permitted(&value, &constraints)
                    {
                        // Misaligned replay: the recorded sequence no longer
                        // fits this strategy. Discard the attempt.
                        self.draw_time += started.elapsed();
                        return Err(self.overrun());
                    }
                    value
                } else if let Some(provider) = extend {
                    draw_from_provider(provider.as_mut(), &constraints)
                } else {
                    self.draw_time += started.elapsed();
                    return Err(self.overrun());
                }
            }
        };
        self.draw_time += started.elapsed();
        self.record(drawn.clone(), constraints, false);
        Ok(drawn)
    }

    /// Draw an integer in `[min, max]` (either bound optional), shrinking
    /// toward `shrink_towards`.
    pub fn draw_integer(
        &mut self,
        min_value: Option<i128>,
        max_value: Option<i128>,
        shrink_towards: i128,
        forced: Option<i128>,
    ) -> Result<i128, DrawError> {
        if let (Some(min), Some(max)) = (min_value, max_value) {
            if min > max {
                return Err(DrawError::InvalidArguments(format!(
                    "draw_integer: min {min} > max {max}"
                )));
            }
        }
        let constraints = Constraints::Integer(IntegerConstraints {
            min_value,
            max_value,
            shrink_towards,
        });
        match self.pop_choice(constraints, forced.map(ChoiceValue::Integer))? {
            ChoiceValue::Integer(v) => Ok(v),
            other => unreachable!("integer draw produced {other:?}"),
        }
    }

    /// Draw a boolean that is `true` with probability `p`.
    pub fn draw_boolean(&mut self, p: f64, forced: Option<bool>) -> Result<bool, DrawError> {
        if !(0.0..=1.0).contains(&p) {
            return Err(DrawError::InvalidArguments(format!(
                "draw_boolean: p {p} outside [0, 1]"
            )));
        }
        let constraints = Constraints::Boolean(BooleanConstraints { p });
        match self.pop_choice(constraints, forced.map(ChoiceValue::Boolean))? {
            ChoiceValue::Boolean(b) => Ok(b),
            other => unreachable!("boolean draw produced {other:?}"),
        }
    }

    /// Draw a float in `[min_value, max_value]`.
    pub fn draw_float(
        &mut self,
        min_value: f64,
        max_value: f64,
        allow_nan: bool,
        forced: Option<f64>,
    ) -> Result<f64, DrawError> {
        if min_value.is_nan() || max_value.is_nan() || min_value > max_value {
            return Err(DrawError::InvalidArguments(format!(
                "draw_float: invalid bounds [{min_value}, {max_value}]"
            )));
        }
        let constraints = Constraints::Float(FloatConstraints {
            min_value,
            max_value,
            allow_nan,
        });
        match self.pop_choice(constraints, forced.map(ChoiceValue::Float))? {
            ChoiceValue::Float(f) => Ok(f),
            other => unreachable!("float draw produced {other:?}"),
        }
    }

    /// Draw a string over `alphabet` with length in `[min_size, max_size]`.
    pub fn draw_string(
        &mut self,
        alphabet: &str,
        min_size: usize,
        max_size: usize,
        forced: Option<String>,
    ) -> Result<String, DrawError> {
        if min_size > max_size {
            return Err(DrawError::InvalidArguments(format!(
                "draw_string: min_size {min_size} > max_size {max_size}"
            )));
        }
        if alphabet.is_empty() && min_size > 0 {
            return Err(DrawError::InvalidArguments(
                "draw_string: empty alphabet with nonzero min_size".into(),
            ));
        }
        let constraints =
            Constraints::String(StringConstraints::new(alphabet, min_size, max_size));
        match self.pop_choice(constraints, forced.map(ChoiceValue::String))? {
            ChoiceValue::String(s) => Ok(s),
            other => unreachable!("string draw produced {other:?}"),
        }
    }

    /// Draw a byte string with length in `[min_size, max_size]`.
    pub fn draw_bytes(
        &mut self,
        min_size: usize,
        max_size: usize,
        forced: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, DrawError> {
        if min_size > max_size {
            return Err(DrawError::InvalidArguments(format!(
                "draw_bytes: min_size {min_size} > max_size {max_size}"
            )));
        }
        let constraints = Constraints::Bytes(BytesConstraints { min_size, max_size });
        match self.pop_choice(constraints, forced.map(ChoiceValue::Bytes))? {
            ChoiceValue::Bytes(b) => Ok(b),
            other => unreachable!("bytes draw produced {other:?}"),
        }
    }

    /// Report a scalar score for targeted search. Higher is better; the
    /// engine keeps the best-scoring sequence per label and mutates it.
    pub fn target(&mut self, label: &str, score: f64) {
        if score.is_nan() {
            return;
        }
        let entry = self
            .target_observations
            .entry(label.to_string())
            .or_insert(score);
        if score > *entry {
            *entry = score;
        }
    }

    /// Note a free-form event for observability and health checks.
    pub fn note_event(&mut self, event: impl Into<String>) {
        self.events.push(event.into());
    }

    pub fn start_span(&mut self, label: u64) {
        self.span_stack.push((label, self.nodes.len()));
    }

    pub fn stop_span(&mut self) {
        if let Some((label, start)) = self.span_stack.pop() {
            self.spans.push(Span {
                label,
                start,
                end: self.nodes.len(),
            });
        }
    }

    /// Track recursion depth for deferred strategies; the bound keeps
    /// self-referential definitions from generating unbounded values.
    pub fn enter_recursion(&mut self) -> Result<(), DrawError> {
        if self.depth >= MAX_STRATEGY_DEPTH {
            return Err(DrawError::Unsatisfied("strategy recursion bound hit".into()));
        }
        self.depth += 1;
        Ok(())
    }

    pub fn exit_recursion(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Freeze with an explicit classification.
    pub fn freeze_with(&mut self, status: Status, origin: Option<InterestingOrigin>) {
        if self.frozen {
            return;
        }
        self.status = status;
        self.interesting_origin = origin;
        self.freeze();
    }

    /// Freeze with the already-recorded status.
    pub fn freeze(&mut self) {
        if self.frozen {
            return;
        }
        // Close any spans left open by an aborted attempt.
        while !self.span_stack.is_empty() {
            self.stop_span();
        }
        self.frozen = true;
    }

    pub fn as_result(&self) -> ConjectureResult {
        ConjectureResult {
            status: self.status,
            interesting_origin: self.interesting_origin.clone(),
            nodes: self.nodes.clone(),
            spans: self.spans.clone(),
            target_observations: self.target_observations.clone(),
            events: self.events.clone(),
            draw_time: self.draw_time,
        }
    }
}

fn draw_from_provider(
    provider: &mut dyn PrimitiveProvider,
    constraints: &Constraints,
) -> ChoiceValue {
    match constraints {
        Constraints::Integer(c) => ChoiceValue::Integer(provider.draw_integer(c)),
        Constraints::Boolean(c) => ChoiceValue::Boolean(provider.draw_boolean(c)),
        Constraints::Float(c) => ChoiceValue::Float(provider.draw_float(c)),
        Constraints::String(c) => ChoiceValue::String(provider.draw_string(c)),
        Constraints::Bytes(c) => ChoiceValue::Bytes(provider.draw_bytes(c)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StandardProvider;

    fn fresh(seed: u64) -> ConjectureData {
        ConjectureData::new(Box::new(StandardProvider::new(seed)))
    }

    #[test]
    fn fresh_draws_are_deterministic_per_seed() {
        let draw_all = |mut data: ConjectureData| {
            let a = data.draw_integer(Some(0), Some(1000), 0, None).unwrap();
            let b = data.draw_boolean(0.5, None).unwrap();
            let c = data.draw_bytes(0, 16, None).unwrap();
            (a, b, c)
        };
        assert_eq!(draw_all(fresh(42)), draw_all(fresh(42)));
    }

    #[test]
    fn replay_reproduces_recorded_values() {
        let mut data = fresh(1);
        let x = data.draw_integer(Some(0), Some(200), 0, None).unwrap();
        let s = data.draw_string("ab", 0, 5, None).unwrap();
        data.freeze();

        let mut replay = ConjectureData::for_choices(data.choices());
        assert_eq!(replay.draw_integer(Some(0), Some(200), 0, None).unwrap(), x);
        assert_eq!(replay.draw_string("ab", 0, 5, None).unwrap(), s);
    }

    #[test]
    fn strict_replay_overruns_when_exhausted() {
        let mut replay = ConjectureData::for_choices(vec![ChoiceValue::Integer(3)]);
        replay.draw_integer(Some(0), Some(10), 0, None).unwrap();
        let err = replay.draw_integer(Some(0), Some(10), 0, None).unwrap_err();
        assert_eq!(err, DrawError::Overrun);
        assert_eq!(replay.status, Status::Overrun);
    }

    #[test]
    fn misaligned_replay_is_an_overrun() {
        let mut replay = ConjectureData::for_choices(vec![ChoiceValue::Integer(500)]);
        let err = replay.draw_integer(Some(0), Some(10), 0, None).unwrap_err();
        assert_eq!(err, DrawError::Overrun);
    }

    #[test]
    fn forced_draws_are_recorded_as_forced() {
        let mut data = fresh(5);
        let v = data.draw_integer(Some(0), Some(100), 0, Some(77)).unwrap();
        assert_eq!(v, 77);
        assert!(data.nodes[0].was_forced);
    }

    #[test]
    fn prefix_mode_extends_with_fresh_entropy() {
        let mut data = ConjectureData::with_prefix(
            vec![ChoiceValue::Integer(9)],
            Box::new(StandardProvider::new(0)),
        );
        assert_eq!(data.draw_integer(Some(0), Some(10), 0, None).unwrap(), 9);
        // Past the prefix: still succeeds.
        data.draw_integer(Some(0), Some(10), 0, None).unwrap();
    }

    #[test]
    fn forced_draws_consume_replay_slots() {
        // Sequence recorded with a forced middle value: replaying it with
        // the same forcing must keep the tail aligned.
        let mut replay = ConjectureData::for_choices(vec![
            ChoiceValue::Integer(4),
            ChoiceValue::Boolean(false),
            ChoiceValue::Integer(6),
        ]);
        assert_eq!(replay.draw_integer(Some(0), Some(10), 0, None).unwrap(), 4);
        assert!(!replay.draw_boolean(0.5, Some(false)).unwrap());
        assert_eq!(replay.draw_integer(Some(0), Some(10), 0, None).unwrap(), 6);
    }

    #[test]
    fn frozen_data_refuses_draws() {
        let mut data = fresh(8);
        data.freeze();
        assert_eq!(
            data.draw_boolean(0.5, None).unwrap_err(),
            DrawError::Frozen
        );
    }

    #[test]
    fn spans_record_node_ranges() {
        let mut data = fresh(2);
        data.draw_boolean(0.5, None).unwrap();
        data.start_span(7);
        data.draw_integer(None, None, 0, None).unwrap();
        data.draw_integer(None, None, 0, None).unwrap();
        data.stop_span();
        data.freeze();
        let result = data.as_result();
        assert_eq!(
            result.spans,
            vec![Span {
                label: 7,
                start: 1,
                end: 3
            }]
        );
    }

    #[test]
    fn target_keeps_the_best_score_per_label() {
        let mut data = fresh(3);
        data.target("distance", 1.0);
        data.target("distance", 5.0);
        data.target("distance", 2.0);
        assert_eq!(data.target_observations["distance"], 5.0);
    }
}
