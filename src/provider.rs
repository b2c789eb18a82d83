//! Entropy backends for fresh generation.
//!
//! A [`PrimitiveProvider`] turns validated constraint records into concrete
//! values. This is the interface an alternative generation backend must
//! satisfy; the engine itself only ships [`StandardProvider`], a ChaCha8
//! PRNG with distributions biased toward small, shrink-friendly values.
//!
//! Providers are looked up by name through a process-wide registry so that
//! `Settings.backend` can select one without the engine linking against it.

use crate::choice::{
    BooleanConstraints, BytesConstraints, FloatConstraints, IntegerConstraints,
    StringConstraints,
};
use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Mutex;

/// Generation backend interface. Constraints are validated by
/// `ConjectureData` before they reach a provider, so draws are infallible.
pub trait PrimitiveProvider {
    fn draw_boolean(&mut self, constraints: &BooleanConstraints) -> bool;
    fn draw_integer(&mut self, constraints: &IntegerConstraints) -> i128;
    fn draw_float(&mut self, constraints: &FloatConstraints) -> f64;
    fn draw_string(&mut self, constraints: &StringConstraints) -> String;
    fn draw_bytes(&mut self, constraints: &BytesConstraints) -> Vec<u8>;
}

/// Default PRNG-backed provider.
pub struct StandardProvider {
    rng: ChaCha8Rng,
}

impl StandardProvider {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Size-biased length in `[min, max]`: squaring the uniform sample
    /// skews toward short collections, which both find bugs sooner and
    /// shrink faster.
    fn draw_size(&mut self, min: usize, max: usize) -> usize {
        if min >= max {
            return min;
        }
        let span = (max - min) as f64;
        let u: f64 = self.rng.gen();
        min + (u * u * (span + 1.0)).floor().min(span) as usize
    }

    /// Magnitude with a geometric-ish tail for unbounded integer draws.
    fn draw_magnitude(&mut self) -> i128 {
        let bits = self.rng.gen_range(0..=64u32);
        if bits == 0 {
            return 0;
        }
        let raw: u64 = self.rng.gen();
        (raw >> (64 - bits)) as i128
    }
}

impl PrimitiveProvider for StandardProvider {
    fn draw_boolean(&mut self, constraints: &BooleanConstraints) -> bool {
        if constraints.p <= 0.0 {
            false
        } else if constraints.p >= 1.0 {
            true
        } else {
            self.rng.gen::<f64>() < constraints.p
        }
    }

    fn draw_integer(&mut self, constraints: &IntegerConstraints) -> i128 {
        match (constraints.min_value, constraints.max_value) {
            (Some(min), Some(max)) => {
                if min == max {
                    min
                } else {
                    self.rng.gen_range(min..=max)
                }
            }
            (Some(min), None) => min.saturating_add(self.draw_magnitude()),
            (None, Some(max)) => max.saturating_sub(self.draw_magnitude()),
            (None, None) => {
                let m = self.draw_magnitude();
                if self.rng.gen::<bool>() {
                    m
                } else {
                    -m
                }
            }
        }
    }

    fn draw_float(&mut self, constraints: &FloatConstraints) -> f64 {
        // Weight a handful of boundary values: most float bugs live at
        // zeros, bounds and non-finite values.
        if self.rng.gen::<f64>() < 0.15 {
            let mut specials = vec![0.0, -0.0, 1.0, -1.0];
            specials.push(constraints.min_value);
            specials.push(constraints.max_value);
            if constraints.allow_nan {
                specials.push(f64::NAN);
            }
            specials.retain(|f| {
                f.is_nan() && constraints.allow_nan
                    || *f >= constraints.min_value && *f <= constraints.max_value
            });
            if !specials.is_empty() {
                let i = self.rng.gen_range(0..specials.len());
                return specials[i];
            }
        }
        let lo = constraints.min_value.max(f64::MIN / 2.0);
        let hi = constraints.max_value.min(f64::MAX / 2.0);
        let u: f64 = self.rng.gen();
        let v = lo * (1.0 - u) + hi * u;
        v.clamp(constraints.min_value, constraints.max_value)
    }

    fn draw_string(&mut self, constraints: &StringConstraints) -> String {
        if constraints.alphabet.is_empty() {
            return String::new();
        }
        let len = self.draw_size(constraints.min_size, constraints.max_size);
        (0..len)
            .map(|_| constraints.alphabet[self.rng.gen_range(0..constraints.alphabet.len())])
            .collect()
    }

    fn draw_bytes(&mut self, constraints: &BytesConstraints) -> Vec<u8> {
        let len = self.draw_size(constraints.min_size, constraints.max_size);
        let mut out = vec![0u8; len];
        self.rng.fill(&mut out[..]);
        out
    }
}

/// Constructor registered for a named backend.
pub type ProviderFactory = fn(seed: u64) -> Box<dyn PrimitiveProvider>;

static PROVIDER_REGISTRY: Lazy<Mutex<HashMap<String, ProviderFactory>>> = Lazy::new(|| {
    let mut registry: HashMap<String, ProviderFactory> = HashMap::new();
    registry.insert("standard".to_string(), |seed| {
        Box::new(StandardProvider::new(seed))
    });
    Mutex::new(registry)
});

/// Register a backend under `name`, replacing any previous registration.
pub fn register_provider(name: &str, factory: ProviderFactory) {
    PROVIDER_REGISTRY
        .lock()
        .expect("provider registry poisoned")
        .insert(name.to_string(), factory);
}

/// Instantiate the backend registered under `name`.
pub fn make_provider(name: &str, seed: u64) -> Option<Box<dyn PrimitiveProvider>> {
    let registry = PROVIDER_REGISTRY
        .lock()
        .expect("provider registry poisoned");
    registry.get(name).map(|factory| factory(seed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_integers_stay_in_range() {
        let mut p = StandardProvider::new(7);
        let c = IntegerConstraints {
            min_value: Some(-3),
            max_value: Some(12),
            shrink_towards: 0,
        };
        for _ in 0..500 {
            let v = p.draw_integer(&c);
            assert!((-3..=12).contains(&v));
        }
    }

    #[test]
    fn same_seed_is_deterministic() {
        let c = IntegerConstraints {
            min_value: Some(0),
            max_value: Some(1_000_000),
            shrink_towards: 0,
        };
        let run = |seed| {
            let mut p = StandardProvider::new(seed);
            (0..50).map(|_| p.draw_integer(&c)).collect::<Vec<_>>()
        };
        assert_eq!(run(99), run(99));
        assert_ne!(run(99), run(100));
    }

    #[test]
    fn floats_respect_bounds_and_nan_flag() {
        let mut p = StandardProvider::new(3);
        let c = FloatConstraints {
            min_value: -5.0,
            max_value: 5.0,
            allow_nan: false,
        };
        for _ in 0..500 {
            let v = p.draw_float(&c);
            assert!(!v.is_nan());
            assert!((-5.0..=5.0).contains(&v));
        }
    }

    #[test]
    fn strings_use_only_the_alphabet() {
        let mut p = StandardProvider::new(11);
        let c = StringConstraints::new("abc", 1, 10);
        for _ in 0..100 {
            let s = p.draw_string(&c);
            assert!(!s.is_empty() && s.len() <= 10);
            assert!(s.chars().all(|ch| "abc".contains(ch)));
        }
    }

    #[test]
    fn registry_resolves_the_standard_backend() {
        assert!(make_provider("standard", 1).is_some());
        assert!(make_provider("no-such-backend", 1).is_none());
    }
}
