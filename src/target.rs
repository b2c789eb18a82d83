//! Targeted search: hill climbing on user-reported scores.
//!
//! When a test calls `data.target(label, score)`, the engine keeps the
//! best-scoring choice sequence per label and, some of the time, mutates
//! it instead of generating from scratch. This is purely additive: it only
//! changes which inputs get tried, never how an outcome is classified, so
//! disabling the phase cannot change pass/fail results.

use crate::choice::ChoiceValue;
use crate::data::ConjectureResult;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

/// How many non-improving mutations before a label's climb restarts from
/// fresh generation.
const STALL_WINDOW: usize = 32;

#[derive(Debug, Default)]
pub struct TargetState {
    best: HashMap<String, (f64, Vec<ChoiceValue>)>,
    since_improvement: usize,
}

impl TargetState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_observations(&self) -> bool {
        !self.best.is_empty()
    }

    /// Fold one attempt's observations into the per-label bests.
    pub fn record(&mut self, result: &ConjectureResult) {
        let mut improved = false;
        for (label, &score) in &result.target_observations {
            match self.best.get(label) {
                Some((best, _)) if *best >= score => {}
                _ => {
                    self.best
                        .insert(label.clone(), (score, result.choices()));
                    improved = true;
                }
            }
        }
        if improved {
            self.since_improvement = 0;
        } else if !self.best.is_empty() {
            self.since_improvement += 1;
        }
    }

    /// A mutated copy of some current best, or `None` while stalled (which
    /// sends the generate phase back to fresh sequences: restart).
    pub fn candidate(&mut self, rng: &mut ChaCha8Rng) -> Option<Vec<ChoiceValue>> {
        if self.best.is_empty() {
            return None;
        }
        if self.since_improvement >= STALL_WINDOW {
            self.since_improvement = 0;
            return None;
        }
        let labels: Vec<&String> = self.best.keys().collect();
        let label = labels[rng.gen_range(0..labels.len())];
        let (_, choices) = &self.best[label];
        Some(mutate_choices(choices, rng))
    }
}

/// Perturb a small subset of choices. Mutations stay in-kind; constraint
/// violations are handled downstream by replay validation.
pub fn mutate_choices(choices: &[ChoiceValue], rng: &mut ChaCha8Rng) -> Vec<ChoiceValue> {
    let mut out = choices.to_vec();
    if out.is_empty() {
        return out;
    }
    let mutations = rng.gen_range(1..=out.len().min(3));
    for _ in 0..mutations {
        let i = rng.gen_range(0..out.len());
        out[i] = mutate_one(&out[i], rng);
    }
    out
}

fn mutate_one(value: &ChoiceValue, rng: &mut ChaCha8Rng) -> ChoiceValue {
    match value {
        ChoiceValue::Integer(v) => {
            // Geometric step sizes: small steps polish, large steps cross
            // plateaus. Out-of-range results die in replay validation.
            let magnitude = i128::from(rng.gen_range(1..=16u8)) << rng.gen_range(0..=32u32);
            let delta = if rng.gen::<bool>() { magnitude } else { -magnitude };
            ChoiceValue::Integer(v.saturating_add(delta))
        }
        ChoiceValue::Boolean(b) => ChoiceValue::Boolean(!b),
        ChoiceValue::Float(f) => {
            if f.is_finite() {
                let nudge = 1.0 + (rng.gen::<f64>() - 0.5) * 0.2;
                ChoiceValue::Float(f * nudge + (rng.gen::<f64>() - 0.5))
            } else {
                ChoiceValue::Float(rng.gen::<f64>())
            }
        }
        ChoiceValue::String(s) => {
            let mut chars: Vec<char> = s.chars().collect();
            if chars.is_empty() || rng.gen::<bool>() {
                // Grow by duplicating an existing character when possible.
                if let Some(&ch) = chars.last() {
                    chars.push(ch);
                }
            } else {
                chars.pop();
            }
            ChoiceValue::String(chars.into_iter().collect())
        }
        ChoiceValue::Bytes(b) => {
            let mut bytes = b.clone();
            if bytes.is_empty() || rng.gen::<bool>() {
                bytes.push(rng.gen());
            } else {
                bytes.pop();
            }
            ChoiceValue::Bytes(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ConjectureData, Status};
    use crate::provider::StandardProvider;
    use rand::SeedableRng;

    fn result_with_target(score: f64) -> ConjectureResult {
        let mut data = ConjectureData::new(Box::new(StandardProvider::new(1)));
        data.draw_integer(Some(0), Some(100), 0, None).unwrap();
        data.target("score", score);
        data.freeze_with(Status::Valid, None);
        data.as_result()
    }

    #[test]
    fn keeps_the_best_score_per_label() {
        let mut state = TargetState::new();
        state.record(&result_with_target(3.0));
        state.record(&result_with_target(9.0));
        state.record(&result_with_target(5.0));
        assert_eq!(state.best["score"].0, 9.0);
    }

    #[test]
    fn candidate_mutates_the_best_sequence() {
        let mut state = TargetState::new();
        state.record(&result_with_target(1.0));
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let candidate = state.candidate(&mut rng).unwrap();
        assert_eq!(candidate.len(), 1); // same shape, possibly new value
    }

    #[test]
    fn stalls_trigger_a_restart() {
        let mut state = TargetState::new();
        state.record(&result_with_target(10.0));
        for _ in 0..STALL_WINDOW {
            state.record(&result_with_target(1.0)); // never improves
        }
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(state.candidate(&mut rng).is_none()); // restart
        assert!(state.candidate(&mut rng).is_some()); // then climbs again
    }

    #[test]
    fn mutation_preserves_sequence_kinds() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let original = vec![
            ChoiceValue::Integer(10),
            ChoiceValue::Boolean(false),
            ChoiceValue::String("ab".into()),
        ];
        for _ in 0..50 {
            let mutated = mutate_choices(&original, &mut rng);
            assert_eq!(mutated.len(), original.len());
            for (a, b) in original.iter().zip(&mutated) {
                assert_eq!(a.choice_type(), b.choice_type());
            }
        }
    }
}
