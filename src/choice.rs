//! Choice model for the refute engine.
//!
//! All randomness flows through strongly-typed choices with associated
//! constraints. A test attempt is an ordered sequence of [`ChoiceNode`]s;
//! replaying the same sequence through the same strategy must reproduce the
//! same structured value, which is what makes shrinking and database reuse
//! possible.
//!
//! This module also defines the canonical "simpler than" order used by the
//! shrinker: [`sort_key`] is shortlex over per-node [`ChoiceKey`]s, so a
//! shorter sequence is always simpler, and for equal lengths nodes compare
//! by a stable per-kind scalar with a content tie-break.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Kinds of primitive draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChoiceType {
    Integer,
    Boolean,
    Float,
    String,
    Bytes,
}

impl std::fmt::Display for ChoiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChoiceType::Integer => write!(f, "integer"),
            ChoiceType::Boolean => write!(f, "boolean"),
            ChoiceType::Float => write!(f, "float"),
            ChoiceType::String => write!(f, "string"),
            ChoiceType::Bytes => write!(f, "bytes"),
        }
    }
}

/// One drawn value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChoiceValue {
    Integer(i128),
    Boolean(bool),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl ChoiceValue {
    pub fn choice_type(&self) -> ChoiceType {
        match self {
            ChoiceValue::Integer(_) => ChoiceType::Integer,
            ChoiceValue::Boolean(_) => ChoiceType::Boolean,
            ChoiceValue::Float(_) => ChoiceType::Float,
            ChoiceValue::String(_) => ChoiceType::String,
            ChoiceValue::Bytes(_) => ChoiceType::Bytes,
        }
    }
}

// Floats compare bitwise here so that NaN == NaN and -0.0 != 0.0. Replay
// equality is identity of the recorded draw, not IEEE equality.
impl Eq for ChoiceValue {}

impl Hash for ChoiceValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ChoiceValue::Integer(i) => {
                0u8.hash(state);
                i.hash(state);
            }
            ChoiceValue::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            ChoiceValue::Float(f) => {
                2u8.hash(state);
                f.to_bits().hash(state);
            }
            ChoiceValue::String(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            ChoiceValue::Bytes(b) => {
                4u8.hash(state);
                b.hash(state);
            }
        }
    }
}

/// Equality under the replay rules: bitwise for floats, structural otherwise.
pub fn choice_equal(a: &ChoiceValue, b: &ChoiceValue) -> bool {
    match (a, b) {
        (ChoiceValue::Float(x), ChoiceValue::Float(y)) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}

/// Constraints for integer draws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegerConstraints {
    pub min_value: Option<i128>,
    pub max_value: Option<i128>,
    /// Value the shrinker pulls toward; clamped into range when bounded.
    pub shrink_towards: i128,
}

impl Default for IntegerConstraints {
    fn default() -> Self {
        Self {
            min_value: None,
            max_value: None,
            shrink_towards: 0,
        }
    }
}

/// Constraints for boolean draws: probability of drawing `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BooleanConstraints {
    pub p: f64,
}

impl Default for BooleanConstraints {
    fn default() -> Self {
        Self { p: 0.5 }
    }
}

/// Constraints for float draws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatConstraints {
    pub min_value: f64,
    pub max_value: f64,
    pub allow_nan: bool,
}

impl Default for FloatConstraints {
    fn default() -> Self {
        Self {
            min_value: f64::NEG_INFINITY,
            max_value: f64::INFINITY,
            allow_nan: true,
        }
    }
}

/// Constraints for string draws. The alphabet is sorted and deduplicated at
/// construction so that "smallest character" is well defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringConstraints {
    pub alphabet: Vec<char>,
    pub min_size: usize,
    pub max_size: usize,
}

impl StringConstraints {
    pub fn new(alphabet: &str, min_size: usize, max_size: usize) -> Self {
        let mut chars: Vec<char> = alphabet.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        Self {
            alphabet: chars,
            min_size,
            max_size,
        }
    }
}

/// Constraints for bytes draws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BytesConstraints {
    pub min_size: usize,
    pub max_size: usize,
}

/// Union over the per-kind constraint records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraints {
    Integer(IntegerConstraints),
    Boolean(BooleanConstraints),
    Float(FloatConstraints),
    String(StringConstraints),
    Bytes(BytesConstraints),
}

impl Constraints {
    pub fn choice_type(&self) -> ChoiceType {
        match self {
            Constraints::Integer(_) => ChoiceType::Integer,
            Constraints::Boolean(_) => ChoiceType::Boolean,
            Constraints::Float(_) => ChoiceType::Float,
            Constraints::String(_) => ChoiceType::String,
            Constraints::Bytes(_) => ChoiceType::Bytes,
        }
    }
}

/// A single choice made during an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceNode {
    pub choice_type: ChoiceType,
    pub value: ChoiceValue,
    pub constraints: Constraints,
    /// Forced nodes were pinned by an explicit example or a protocol draw
    /// and must not be mutated by the shrinker.
    pub was_forced: bool,
    /// Position within its sequence.
    pub index: usize,
}

impl ChoiceNode {
    pub fn new(
        value: ChoiceValue,
        constraints: Constraints,
        was_forced: bool,
        index: usize,
    ) -> Self {
        Self {
            choice_type: value.choice_type(),
            value,
            constraints,
            was_forced,
            index,
        }
    }

    /// Copy this node with a new value. Forced nodes cannot be modified.
    pub fn copy_with_value(&self, new_value: ChoiceValue) -> Option<Self> {
        if self.was_forced {
            return None;
        }
        Some(Self {
            choice_type: self.choice_type,
            value: new_value,
            constraints: self.constraints.clone(),
            was_forced: false,
            index: self.index,
        })
    }

    /// Whether this node is already as simple as it can get in isolation.
    pub fn trivial(&self) -> bool {
        if self.was_forced {
            return true;
        }
        match simplest_choice(&self.constraints) {
            Some(simplest) => choice_equal(&self.value, &simplest),
            None => false,
        }
    }
}

/// Whether `value` satisfies `constraints`. Used to validate replayed
/// prefixes: a mismatch means the sequence is misaligned for this strategy.
pub fn choice_permitted(value: &ChoiceValue, constraints: &Constraints) -> bool {
    match (value, constraints) {
        (ChoiceValue::Integer(v), Constraints::Integer(c)) => {
            c.min_value.map_or(true, |min| *v >= min) && c.max_value.map_or(true, |max| *v <= max)
        }
        (ChoiceValue::Boolean(b), Constraints::Boolean(c)) => {
            if c.p <= 0.0 {
                !*b
            } else if c.p >= 1.0 {
                *b
            } else {
                true
            }
        }
        (ChoiceValue::Float(f), Constraints::Float(c)) => {
            if f.is_nan() {
                c.allow_nan
            } else {
                *f >= c.min_value && *f <= c.max_value
            }
        }
        (ChoiceValue::String(s), Constraints::String(c)) => {
            let n = s.chars().count();
            n >= c.min_size && n <= c.max_size && s.chars().all(|ch| c.alphabet.contains(&ch))
        }
        (ChoiceValue::Bytes(b), Constraints::Bytes(c)) => {
            b.len() >= c.min_size && b.len() <= c.max_size
        }
        _ => false,
    }
}

/// The canonical simplest value permitted by `constraints`, i.e. the value a
/// fully successful shrink leaves behind. Returns `None` when no value is
/// permitted (empty alphabet with a nonzero minimum size, inverted bounds).
pub fn simplest_choice(constraints: &Constraints) -> Option<ChoiceValue> {
    match constraints {
        Constraints::Integer(c) => {
            let mut v = c.shrink_towards;
            if let Some(min) = c.min_value {
                v = v.max(min);
            }
            if let Some(max) = c.max_value {
                v = v.min(max);
            }
            if let (Some(min), Some(max)) = (c.min_value, c.max_value) {
                if min > max {
                    return None;
                }
            }
            Some(ChoiceValue::Integer(v))
        }
        Constraints::Boolean(c) => Some(ChoiceValue::Boolean(c.p >= 1.0)),
        Constraints::Float(c) => {
            if c.min_value > c.max_value {
                return None;
            }
            if c.min_value <= 0.0 && 0.0 <= c.max_value {
                return Some(ChoiceValue::Float(0.0));
            }
            // The range excludes zero; prefer the integral value closest to
            // it when the interval contains one.
            let (ceil_min, floor_max) = (c.min_value.ceil(), c.max_value.floor());
            if ceil_min <= floor_max {
                let target = if c.min_value > 0.0 { ceil_min } else { floor_max };
                return Some(ChoiceValue::Float(target));
            }
            Some(ChoiceValue::Float(if c.min_value > 0.0 {
                c.min_value
            } else {
                c.max_value
            }))
        }
        Constraints::String(c) => {
            if c.min_size == 0 {
                return Some(ChoiceValue::String(String::new()));
            }
            let smallest = *c.alphabet.first()?;
            Some(ChoiceValue::String(
                std::iter::repeat(smallest).take(c.min_size).collect(),
            ))
        }
        Constraints::Bytes(c) => Some(ChoiceValue::Bytes(vec![0u8; c.min_size])),
    }
}

/// Stable per-node ordering key. Smaller keys are simpler values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChoiceKey {
    /// Coarse scalar: zigzag distance from `shrink_towards` for integers,
    /// false < true for booleans, sign/magnitude encoding for floats,
    /// length for strings and bytes.
    pub primary: u128,
    /// Content tie-break for strings and bytes; empty for scalars.
    pub tail: Vec<u8>,
}

fn float_primary(f: f64) -> u128 {
    if f.is_nan() {
        return u128::MAX;
    }
    // Magnitude-first, positive preferred: abs bits order IEEE floats by
    // magnitude, and the sign occupies the low bit so +x < -x.
    ((f.abs().to_bits() as u128) << 1) | (f.is_sign_negative() as u128)
}

/// Canonical shrink-order key for one choice.
pub fn choice_key(value: &ChoiceValue, constraints: &Constraints) -> ChoiceKey {
    match (value, constraints) {
        (ChoiceValue::Integer(v), Constraints::Integer(c)) => {
            let d = v.abs_diff(c.shrink_towards);
            // Zigzag outward from shrink_towards, positive side first:
            // 0, +1, -1, +2, -2, ...
            let primary = if *v >= c.shrink_towards {
                d.saturating_mul(2).saturating_sub(1)
            } else {
                d.saturating_mul(2)
            };
            ChoiceKey {
                primary,
                tail: Vec::new(),
            }
        }
        (ChoiceValue::Integer(v), _) => ChoiceKey {
            primary: v.unsigned_abs(),
            tail: Vec::new(),
        },
        (ChoiceValue::Boolean(b), _) => ChoiceKey {
            primary: *b as u128,
            tail: Vec::new(),
        },
        (ChoiceValue::Float(f), _) => ChoiceKey {
            primary: float_primary(*f),
            tail: Vec::new(),
        },
        (ChoiceValue::String(s), Constraints::String(c)) => {
            let mut tail = Vec::with_capacity(s.len() * 4);
            for ch in s.chars() {
                // Compare by alphabet position so "smallest character" wins
                // regardless of the alphabet's codepoint layout.
                let pos = c
                    .alphabet
                    .binary_search(&ch)
                    .map(|i| i as u32)
                    .unwrap_or(u32::MAX);
                tail.extend_from_slice(&pos.to_be_bytes());
            }
            ChoiceKey {
                primary: s.chars().count() as u128,
                tail,
            }
        }
        (ChoiceValue::String(s), _) => ChoiceKey {
            primary: s.chars().count() as u128,
            tail: s.as_bytes().to_vec(),
        },
        (ChoiceValue::Bytes(b), _) => ChoiceKey {
            primary: b.len() as u128,
            tail: b.clone(),
        },
    }
}

/// Shortlex key for a whole sequence: length first, then per-node keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey {
    pub len: usize,
    pub keys: Vec<ChoiceKey>,
}

pub fn sort_key(nodes: &[ChoiceNode]) -> SortKey {
    SortKey {
        len: nodes.len(),
        keys: nodes
            .iter()
            .map(|n| choice_key(&n.value, &n.constraints))
            .collect(),
    }
}

/// Cheap content hash of a value sequence, used for flakiness bookkeeping
/// and shrink-candidate deduplication.
pub fn choices_checksum(values: &[ChoiceValue]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for v in values {
        v.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_constraints(min: i128, max: i128) -> Constraints {
        Constraints::Integer(IntegerConstraints {
            min_value: Some(min),
            max_value: Some(max),
            shrink_towards: 0,
        })
    }

    #[test]
    fn integer_key_orders_by_distance_from_shrink_target() {
        let c = int_constraints(-100, 100);
        let k = |v: i128| choice_key(&ChoiceValue::Integer(v), &c);
        assert!(k(0) < k(1));
        assert!(k(1) < k(-1)); // positive side of each distance band first
        assert!(k(-1) < k(2));
        assert!(k(5) < k(50));
    }

    #[test]
    fn positive_floats_are_simpler_than_negative_of_same_magnitude() {
        let c = Constraints::Float(FloatConstraints::default());
        let k = |v: f64| choice_key(&ChoiceValue::Float(v), &c);
        assert!(k(0.0) < k(1.0));
        assert!(k(1.0) < k(-1.0));
        assert!(k(2.5) < k(f64::NAN));
    }

    #[test]
    fn shorter_sequences_always_sort_first() {
        let c = int_constraints(0, 255);
        let node = |v: i128, i: usize| {
            ChoiceNode::new(ChoiceValue::Integer(v), c.clone(), false, i)
        };
        let long = vec![node(0, 0), node(0, 1)];
        let short = vec![node(200, 0)];
        assert!(sort_key(&short) < sort_key(&long));
    }

    #[test]
    fn simplest_integer_respects_bounds() {
        assert_eq!(
            simplest_choice(&int_constraints(50, 200)),
            Some(ChoiceValue::Integer(50))
        );
        assert_eq!(
            simplest_choice(&int_constraints(-5, 5)),
            Some(ChoiceValue::Integer(0))
        );
    }

    #[test]
    fn simplest_float_prefers_integral_values() {
        let c = Constraints::Float(FloatConstraints {
            min_value: 2.5,
            max_value: 10.0,
            allow_nan: false,
        });
        assert_eq!(simplest_choice(&c), Some(ChoiceValue::Float(3.0)));
    }

    #[test]
    fn forced_nodes_are_trivial_and_immutable() {
        let node = ChoiceNode::new(
            ChoiceValue::Integer(42),
            int_constraints(0, 100),
            true,
            0,
        );
        assert!(node.trivial());
        assert!(node.copy_with_value(ChoiceValue::Integer(0)).is_none());
    }

    #[test]
    fn permitted_rejects_out_of_range_and_wrong_kind() {
        let c = int_constraints(0, 10);
        assert!(choice_permitted(&ChoiceValue::Integer(10), &c));
        assert!(!choice_permitted(&ChoiceValue::Integer(11), &c));
        assert!(!choice_permitted(&ChoiceValue::Boolean(true), &c));
    }

    #[test]
    fn string_keys_use_alphabet_positions() {
        let c = Constraints::String(StringConstraints::new("zab", 0, 8));
        let k = |s: &str| choice_key(&ChoiceValue::String(s.into()), &c);
        // 'a' is the smallest alphabet entry after sorting, so "a" < "z".
        assert!(k("a") < k("z"));
        assert!(k("z") < k("aa"));
    }
}
