//! Composable strategies: descriptions of how to turn a choice sequence
//! into a structured value.
//!
//! A [`Strategy`] is pure with respect to its [`ConjectureData`]: it only
//! consumes choices, so replaying a sequence rebuilds the same value.
//! Combinators follow the usual algebra (`map`, `filter`, `flat_map`,
//! unions, collections); recursive definitions go through [`deferred`],
//! which resolves a thunk on first use and enforces a depth bound instead
//! of allowing literal cycles.
//!
//! Arguments are validated when a strategy is constructed. A malformed
//! strategy carries the error and returns `DrawError::InvalidArguments`
//! from every draw without consuming choices; the runner treats that as
//! fatal, so a malformed strategy can never generate.

use crate::data::ConjectureData;
use crate::errors::DrawError;
use once_cell::unsync::OnceCell;
use std::rc::Rc;

/// Span label for one collection element (its continue flag plus draws).
pub(crate) const ELEMENT_SPAN: u64 = 0x636f6c6c; // "coll"

/// Retries before `filter` gives up and marks the attempt invalid.
const MAX_FILTER_RETRIES: usize = 3;

/// Constructor-time validation verdict stored on the strategy.
fn checked(invalid: &Option<String>) -> Result<(), DrawError> {
    match invalid {
        Some(message) => Err(DrawError::InvalidArguments(message.clone())),
        None => Ok(()),
    }
}

pub trait Strategy {
    type Value;

    fn draw(&self, data: &mut ConjectureData) -> Result<Self::Value, DrawError>;

    fn map<U, F>(self, f: F) -> Map<Self, F>
    where
        Self: Sized,
        F: Fn(Self::Value) -> U,
    {
        Map { inner: self, f }
    }

    /// Keep only values satisfying `predicate`. Retries a bounded number of
    /// times; exhaustion marks the whole attempt invalid rather than
    /// looping, and every retry is recorded as a `filter` event so the
    /// FilterTooMuch health check can see it.
    fn filter<F>(self, description: &'static str, predicate: F) -> Filter<Self, F>
    where
        Self: Sized,
        F: Fn(&Self::Value) -> bool,
    {
        Filter {
            inner: self,
            description,
            predicate,
        }
    }

    fn flat_map<S, F>(self, f: F) -> FlatMap<Self, F>
    where
        Self: Sized,
        S: Strategy,
        F: Fn(Self::Value) -> S,
    {
        FlatMap { inner: self, f }
    }

    fn boxed(self) -> BoxedStrategy<Self::Value>
    where
        Self: Sized + 'static,
    {
        BoxedStrategy(Rc::new(self))
    }
}

/// Type-erased, cheaply clonable strategy handle.
pub struct BoxedStrategy<T>(Rc<dyn Strategy<Value = T>>);

impl<T> Clone for BoxedStrategy<T> {
    fn clone(&self) -> Self {
        BoxedStrategy(Rc::clone(&self.0))
    }
}

impl<T> Strategy for BoxedStrategy<T> {
    type Value = T;

    fn draw(&self, data: &mut ConjectureData) -> Result<T, DrawError> {
        self.0.draw(data)
    }
}

// --- leaves -----------------------------------------------------------

#[derive(Clone)]
pub struct Integers {
    min_value: Option<i128>,
    max_value: Option<i128>,
    shrink_towards: i128,
    invalid: Option<String>,
}

impl Strategy for Integers {
    type Value = i128;

    fn draw(&self, data: &mut ConjectureData) -> Result<i128, DrawError> {
        checked(&self.invalid)?;
        data.draw_integer(self.min_value, self.max_value, self.shrink_towards, None)
    }
}

/// Integers in `[min, max]`.
pub fn integers(min: i128, max: i128) -> Integers {
    Integers {
        min_value: Some(min),
        max_value: Some(max),
        shrink_towards: 0,
        invalid: (min > max).then(|| format!("integers: empty range {min}..={max}")),
    }
}

/// Unbounded integers.
pub fn any_integer() -> Integers {
    Integers {
        min_value: None,
        max_value: None,
        shrink_towards: 0,
        invalid: None,
    }
}

#[derive(Clone)]
pub struct Booleans;

impl Strategy for Booleans {
    type Value = bool;

    fn draw(&self, data: &mut ConjectureData) -> Result<bool, DrawError> {
        data.draw_boolean(0.5, None)
    }
}

pub fn booleans() -> Booleans {
    Booleans
}

#[derive(Clone)]
pub struct Floats {
    min_value: f64,
    max_value: f64,
    allow_nan: bool,
    invalid: Option<String>,
}

impl Strategy for Floats {
    type Value = f64;

    fn draw(&self, data: &mut ConjectureData) -> Result<f64, DrawError> {
        checked(&self.invalid)?;
        data.draw_float(self.min_value, self.max_value, self.allow_nan, None)
    }
}

/// Floats in `[min, max]`, never NaN.
pub fn floats(min: f64, max: f64) -> Floats {
    let invalid = (min.is_nan() || max.is_nan() || min > max)
        .then(|| format!("floats: bad bounds [{min}, {max}]"));
    Floats {
        min_value: min,
        max_value: max,
        allow_nan: false,
        invalid,
    }
}

/// Any float, including infinities and NaN.
pub fn any_float() -> Floats {
    Floats {
        min_value: f64::NEG_INFINITY,
        max_value: f64::INFINITY,
        allow_nan: true,
        invalid: None,
    }
}

#[derive(Clone)]
pub struct Text {
    alphabet: String,
    min_size: usize,
    max_size: usize,
    invalid: Option<String>,
}

impl Strategy for Text {
    type Value = String;

    fn draw(&self, data: &mut ConjectureData) -> Result<String, DrawError> {
        checked(&self.invalid)?;
        data.draw_string(&self.alphabet, self.min_size, self.max_size, None)
    }
}

/// Strings over `alphabet` with length in `[min_size, max_size]`.
pub fn text(alphabet: &str, min_size: usize, max_size: usize) -> Text {
    let invalid = if min_size > max_size {
        Some(format!("text: min_size {min_size} > max_size {max_size}"))
    } else if alphabet.is_empty() && min_size > 0 {
        Some("text: empty alphabet with nonzero min_size".to_string())
    } else {
        None
    };
    Text {
        alphabet: alphabet.to_string(),
        min_size,
        max_size,
        invalid,
    }
}

#[derive(Clone)]
pub struct Binary {
    min_size: usize,
    max_size: usize,
    invalid: Option<String>,
}

impl Strategy for Binary {
    type Value = Vec<u8>;

    fn draw(&self, data: &mut ConjectureData) -> Result<Vec<u8>, DrawError> {
        checked(&self.invalid)?;
        data.draw_bytes(self.min_size, self.max_size, None)
    }
}

/// Byte strings with length in `[min_size, max_size]`.
pub fn binary(min_size: usize, max_size: usize) -> Binary {
    Binary {
        min_size,
        max_size,
        invalid: (min_size > max_size)
            .then(|| format!("binary: min_size {min_size} > max_size {max_size}")),
    }
}

#[derive(Clone)]
pub struct Just<T: Clone>(T);

impl<T: Clone> Strategy for Just<T> {
    type Value = T;

    fn draw(&self, _data: &mut ConjectureData) -> Result<T, DrawError> {
        Ok(self.0.clone())
    }
}

/// Always the given value; consumes no choices.
pub fn just<T: Clone>(value: T) -> Just<T> {
    Just(value)
}

#[derive(Clone)]
pub struct SampledFrom<T: Clone> {
    options: Vec<T>,
    invalid: Option<String>,
}

impl<T: Clone> Strategy for SampledFrom<T> {
    type Value = T;

    fn draw(&self, data: &mut ConjectureData) -> Result<T, DrawError> {
        checked(&self.invalid)?;
        let i = data.draw_integer(Some(0), Some(self.options.len() as i128 - 1), 0, None)?;
        Ok(self.options[i as usize].clone())
    }
}

/// One of the given values, earlier entries shrinking first.
pub fn sampled_from<T: Clone>(options: Vec<T>) -> SampledFrom<T> {
    let invalid = options
        .is_empty()
        .then(|| "sampled_from: empty options".to_string());
    SampledFrom { options, invalid }
}

// --- combinators ------------------------------------------------------

pub struct Map<S, F> {
    inner: S,
    f: F,
}

impl<S, F, U> Strategy for Map<S, F>
where
    S: Strategy,
    F: Fn(S::Value) -> U,
{
    type Value = U;

    fn draw(&self, data: &mut ConjectureData) -> Result<U, DrawError> {
        Ok((self.f)(self.inner.draw(data)?))
    }
}

pub struct Filter<S, F> {
    inner: S,
    description: &'static str,
    predicate: F,
}

impl<S, F> Strategy for Filter<S, F>
where
    S: Strategy,
    F: Fn(&S::Value) -> bool,
{
    type Value = S::Value;

    fn draw(&self, data: &mut ConjectureData) -> Result<S::Value, DrawError> {
        for _ in 0..MAX_FILTER_RETRIES {
            let value = self.inner.draw(data)?;
            if (self.predicate)(&value) {
                return Ok(value);
            }
            data.note_event(format!("filter:{}", self.description));
        }
        Err(DrawError::Unsatisfied(format!(
            "filter {} exhausted its retries",
            self.description
        )))
    }
}

pub struct FlatMap<S, F> {
    inner: S,
    f: F,
}

impl<S, F, S2> Strategy for FlatMap<S, F>
where
    S: Strategy,
    S2: Strategy,
    F: Fn(S::Value) -> S2,
{
    type Value = S2::Value;

    fn draw(&self, data: &mut ConjectureData) -> Result<S2::Value, DrawError> {
        let seed = self.inner.draw(data)?;
        (self.f)(seed).draw(data)
    }
}

pub struct OneOf<T> {
    options: Vec<(u64, BoxedStrategy<T>)>,
    total_weight: u64,
    invalid: Option<String>,
}

impl<T> Strategy for OneOf<T> {
    type Value = T;

    fn draw(&self, data: &mut ConjectureData) -> Result<T, DrawError> {
        checked(&self.invalid)?;
        let roll = data.draw_integer(Some(0), Some(self.total_weight as i128 - 1), 0, None)?;
        let mut acc = 0u64;
        for (weight, option) in &self.options {
            acc += weight;
            if (roll as u64) < acc {
                return option.draw(data);
            }
        }
        unreachable!("one_of roll exceeded total weight")
    }
}

/// Uniform union of strategies; the first option is the shrink target.
pub fn one_of<T>(options: Vec<BoxedStrategy<T>>) -> OneOf<T> {
    weighted(options.into_iter().map(|s| (1, s)).collect())
}

/// Weighted union of strategies.
pub fn weighted<T>(options: Vec<(u64, BoxedStrategy<T>)>) -> OneOf<T> {
    let total_weight = options.iter().map(|(w, _)| *w).sum();
    let invalid = (options.is_empty() || total_weight == 0)
        .then(|| "one_of: no options with nonzero weight".to_string());
    OneOf {
        options,
        total_weight,
        invalid,
    }
}

pub struct VecOf<S> {
    element: S,
    min_size: usize,
    max_size: usize,
    invalid: Option<String>,
}

impl<S: Strategy> Strategy for VecOf<S> {
    type Value = Vec<S::Value>;

    fn draw(&self, data: &mut ConjectureData) -> Result<Vec<S::Value>, DrawError> {
        checked(&self.invalid)?;
        // Continue-boolean protocol: each element is preceded by a "more?"
        // draw, forced at the size bounds so replay stays aligned. Each
        // (flag, element) pair lives in its own span so the shrinker can
        // delete elements wholesale.
        let average = (self.min_size as f64 + 4.0).min(self.max_size as f64);
        let p_continue = if self.max_size == 0 {
            0.0
        } else {
            average / (average + 1.0)
        };
        let mut out = Vec::new();
        loop {
            let forced = if out.len() >= self.max_size {
                Some(false)
            } else if out.len() < self.min_size {
                Some(true)
            } else {
                None
            };
            data.start_span(ELEMENT_SPAN);
            let more = data.draw_boolean(p_continue, forced)?;
            if !more {
                data.stop_span();
                break;
            }
            let element = self.element.draw(data)?;
            data.stop_span();
            out.push(element);
        }
        Ok(out)
    }
}

/// Vectors of `element` with length in `[min_size, max_size]`.
pub fn vec_of<S: Strategy>(element: S, min_size: usize, max_size: usize) -> VecOf<S> {
    VecOf {
        element,
        min_size,
        max_size,
        invalid: (min_size > max_size)
            .then(|| format!("vec_of: min_size {min_size} > max_size {max_size}")),
    }
}

impl<A: Strategy, B: Strategy> Strategy for (A, B) {
    type Value = (A::Value, B::Value);

    fn draw(&self, data: &mut ConjectureData) -> Result<Self::Value, DrawError> {
        Ok((self.0.draw(data)?, self.1.draw(data)?))
    }
}

impl<A: Strategy, B: Strategy, C: Strategy> Strategy for (A, B, C) {
    type Value = (A::Value, B::Value, C::Value);

    fn draw(&self, data: &mut ConjectureData) -> Result<Self::Value, DrawError> {
        Ok((self.0.draw(data)?, self.1.draw(data)?, self.2.draw(data)?))
    }
}

/// Lazy, named indirection for recursive strategy definitions. The thunk
/// resolves once; drawing tracks recursion depth on the data so cyclic
/// definitions bottom out as invalid instead of diverging.
pub struct Deferred<T> {
    resolve: fn() -> BoxedStrategy<T>,
    cell: OnceCell<BoxedStrategy<T>>,
}

impl<T> Strategy for Deferred<T> {
    type Value = T;

    fn draw(&self, data: &mut ConjectureData) -> Result<T, DrawError> {
        data.enter_recursion()?;
        let strategy = self.cell.get_or_init(self.resolve);
        let result = strategy.draw(data);
        data.exit_recursion();
        result
    }
}

pub fn deferred<T>(resolve: fn() -> BoxedStrategy<T>) -> Deferred<T> {
    Deferred {
        resolve,
        cell: OnceCell::new(),
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
    fn map_transforms_drawn_values() {
        let strategy = integers(0, 10).map(|v| v * 2);
        let mut data = fresh(1);
        let v = strategy.draw(&mut data).unwrap();
        assert_eq!(v % 2, 0);
        assert!((0..=20).contains(&v));
    }

    #[test]
    fn filter_marks_the_attempt_invalid_when_exhausted() {
        let strategy = integers(0, 10).filter("impossible", |_| false);
        let mut data = fresh(1);
        match strategy.draw(&mut data) {
            Err(DrawError::Unsatisfied(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(data.events.len(), 3); // one event per retry
    }

    #[test]
    fn flat_map_draws_a_dependent_strategy() {
        let strategy = integers(1, 5).flat_map(|n| vec_of(integers(0, 9), n as usize, n as usize));
        let mut data = fresh(4);
        let v = strategy.draw(&mut data).unwrap();
        assert!((1..=5).contains(&v.len()));
    }

    #[test]
    fn vec_of_respects_size_bounds() {
        let strategy = vec_of(integers(0, 100), 2, 6);
        for seed in 0..30 {
            let mut data = fresh(seed);
            let v = strategy.draw(&mut data).unwrap();
            assert!((2..=6).contains(&v.len()), "len {} out of range", v.len());
        }
    }

    #[test]
    fn one_of_only_draws_listed_options() {
        let strategy = one_of(vec![
            integers(0, 0).boxed(),
            integers(100, 100).boxed(),
        ]);
        for seed in 0..20 {
            let mut data = fresh(seed);
            let v = strategy.draw(&mut data).unwrap();
            assert!(v == 0 || v == 100);
        }
    }

    #[test]
    fn malformed_arguments_fail_from_construction_without_drawing() {
        let mut data = fresh(1);
        let rejected: Vec<Box<dyn Strategy<Value = i128>>> = vec![
            Box::new(integers(5, 2)),
            Box::new(floats(1.0, 0.0).map(|_| 0)),
            Box::new(text("", 1, 3).map(|_| 0)),
            Box::new(binary(4, 2).map(|_| 0)),
            Box::new(sampled_from(Vec::<i128>::new())),
            Box::new(one_of(Vec::new())),
            Box::new(vec_of(integers(0, 1), 5, 2).map(|_| 0)),
        ];
        for strategy in &rejected {
            match strategy.draw(&mut data) {
                Err(DrawError::InvalidArguments(_)) => {}
                other => panic!("unexpected: {other:?}"),
            }
        }
        // The verdict was reached at construction; no draw consumed choices.
        assert!(data.nodes.is_empty());
    }

    #[test]
    fn replaying_a_composite_strategy_is_deterministic() {
        let strategy = vec_of(integers(0, 1000), 0, 8).map(|v| v.len());
        let mut data = fresh(9);
        let first = strategy.draw(&mut data).unwrap();
        data.freeze();
        let mut replay = ConjectureData::for_choices(data.choices());
        assert_eq!(strategy.draw(&mut replay).unwrap(), first);
    }

    fn nested_lists() -> BoxedStrategy<i128> {
        // Self-referential: either a leaf integer or a recursion that sums.
        one_of(vec![integers(0, 3).boxed(), deferred(nested_lists).boxed()]).boxed()
    }

    #[test]
    fn deferred_strategies_terminate_via_the_depth_bound() {
        for seed in 0..20 {
            let mut data = fresh(seed);
            // Either a value or an Unsatisfied recursion bound; never hangs.
            match nested_lists().draw(&mut data) {
                Ok(v) => assert!((0..=3).contains(&v)),
                Err(DrawError::Unsatisfied(_)) => {}
                Err(other) => panic!("unexpected: {other:?}"),
            }
        }
    }
}
