//! Multi-pass local-search minimizer over choice sequences.
//!
//! Given one interesting result and the origin it must preserve, the
//! shrinker repeatedly applies a fixed library of reduction passes until a
//! full sweep makes no progress (a fixpoint) or the budget runs out. A
//! candidate is accepted only when it re-executes to the same interesting
//! origin with a strictly smaller [`sort_key`], which gives both
//! non-regression and termination: the key order is well founded, so only
//! finitely many acceptances can ever happen.
//!
//! Candidates that fail with a *different* origin are recorded and
//! discarded, never substituted for the tracked bug.

use crate::choice::{
    choice_key, choices_checksum, simplest_choice, sort_key, ChoiceValue, Constraints, SortKey,
};
use crate::data::{ConjectureResult, InterestingOrigin, Status};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Outcome of a shrink run. `fully_shrunk` distinguishes a proven local
/// minimum from a budget-bounded partial result.
#[derive(Debug)]
pub struct ShrinkOutcome {
    pub result: ConjectureResult,
    pub fully_shrunk: bool,
    pub calls: usize,
    pub diverged_origins: Vec<InterestingOrigin>,
}

pub struct Shrinker<'a> {
    execute: Box<dyn FnMut(&[ChoiceValue]) -> ConjectureResult + 'a>,
    current: ConjectureResult,
    origin: InterestingOrigin,
    calls: usize,
    max_calls: usize,
    deadline: Duration,
    started: Instant,
    seen: HashSet<u64>,
    diverged: Vec<InterestingOrigin>,
}

impl<'a> Shrinker<'a> {
    pub fn new(
        initial: ConjectureResult,
        origin: InterestingOrigin,
        max_calls: usize,
        deadline: Duration,
        execute: Box<dyn FnMut(&[ChoiceValue]) -> ConjectureResult + 'a>,
    ) -> Self {
        let mut seen = HashSet::new();
        seen.insert(choices_checksum(&initial.choices()));
        Self {
            execute,
            current: initial,
            origin,
            calls: 0,
            max_calls,
            deadline,
            started: Instant::now(),
            seen,
            diverged: Vec::new(),
        }
    }

    pub fn shrink(mut self) -> ShrinkOutcome {
        loop {
            let before: SortKey = sort_key(&self.current.nodes);
            self.delete_spans();
            self.delete_chunks();
            self.dedupe_chunks();
            self.zero_chunks();
            self.minimize_nodes();
            self.sort_adjacent();
            if self.out_of_budget() {
                return self.finish(false);
            }
            if sort_key(&self.current.nodes) == before {
                return self.finish(true);
            }
        }
    }

    fn finish(self, fully_shrunk: bool) -> ShrinkOutcome {
        ShrinkOutcome {
            result: self.current,
            fully_shrunk,
            calls: self.calls,
            diverged_origins: self.diverged,
        }
    }

    fn out_of_budget(&self) -> bool {
        self.calls >= self.max_calls || self.started.elapsed() >= self.deadline
    }

    /// Execute `candidate`; adopt it when it reproduces the tracked origin
    /// and is strictly simpler. Returns whether it was adopted.
    fn attempt(&mut self, candidate: Vec<ChoiceValue>) -> bool {
        if self.out_of_budget() {
            return false;
        }
        if !self.seen.insert(choices_checksum(&candidate)) {
            return false;
        }
        self.calls += 1;
        let result = (self.execute)(&candidate);
        if result.status != Status::Interesting {
            return false;
        }
        match &result.interesting_origin {
            Some(origin) if *origin == self.origin => {
                // The replay may finish drawing early; the result's own
                // (pruned) nodes are what we compare and keep.
                if sort_key(&result.nodes) < sort_key(&self.current.nodes) {
                    self.current = result;
                    true
                } else {
                    false
                }
            }
            Some(other) => {
                if !self.diverged.contains(other) {
                    self.diverged.push(other.clone());
                }
                false
            }
            None => false,
        }
    }

    fn attempt_delete(&mut self, start: usize, end: usize) -> bool {
        let mut candidate = self.current.choices();
        if start >= end || end > candidate.len() {
            return false;
        }
        candidate.drain(start..end);
        self.attempt(candidate)
    }

    fn attempt_replace(&mut self, index: usize, value: ChoiceValue) -> bool {
        let node = &self.current.nodes[index];
        if node.was_forced || crate::choice::choice_equal(&node.value, &value) {
            return false;
        }
        if !crate::choice::choice_permitted(&value, &node.constraints) {
            return false;
        }
        let replaced_key = choice_key(&value, &node.constraints);
        if replaced_key >= choice_key(&node.value, &node.constraints) {
            return false;
        }
        let mut candidate = self.current.choices();
        candidate[index] = value;
        self.attempt(candidate)
    }

    /// Delete whole labeled spans (collection elements, stateful steps).
    /// When removing one span alone fails, try removing it together with a
    /// later span of the same label: deleting a bundle-producing step only
    /// works if its dependents go with it.
    fn delete_spans(&mut self) {
        loop {
            let mut spans = self.current.spans.clone();
            spans.sort_by(|a, b| b.start.cmp(&a.start));
            let mut improved = false;
            for span in spans {
                if self.out_of_budget() {
                    return;
                }
                if span.end > self.current.nodes.len() || span.start >= span.end {
                    continue;
                }
                if self.attempt_delete(span.start, span.end) {
                    improved = true;
                    break; // indices shifted, recompute spans
                }
                // Paired deletion, nearest followers first.
                let followers: Vec<_> = self
                    .current
                    .spans
                    .iter()
                    .filter(|s| s.label == span.label && s.start >= span.end)
                    .take(8)
                    .cloned()
                    .collect();
                let mut paired = false;
                for follower in followers {
                    if follower.end > self.current.nodes.len() {
                        continue;
                    }
                    let mut candidate = self.current.choices();
                    candidate.drain(follower.start..follower.end);
                    candidate.drain(span.start..span.end);
                    if self.attempt(candidate) {
                        paired = true;
                        break;
                    }
                }
                if paired {
                    improved = true;
                    break;
                }
            }
            if !improved {
                return;
            }
        }
    }

    /// Delta-debugging style deletion of contiguous runs, coarse to fine.
    fn delete_chunks(&mut self) {
        for k in [8usize, 4, 2, 1] {
            let mut i = self.current.nodes.len().saturating_sub(k);
            loop {
                if self.out_of_budget() {
                    return;
                }
                if i + k <= self.current.nodes.len() {
                    self.attempt_delete(i, i + k);
                }
                if i == 0 {
                    break;
                }
                i -= 1;
            }
        }
    }

    /// Collapse one copy of an adjacent duplicated run. Unlike the blind
    /// window scan in `delete_chunks`, a call is only spent once both
    /// halves already match, so repeated sub-sequences from collection
    /// combinators stay cheap to remove.
    fn dedupe_chunks(&mut self) {
        for k in [8usize, 4, 2, 1] {
            let mut i = self.current.nodes.len().saturating_sub(2 * k);
            loop {
                if self.out_of_budget() {
                    return;
                }
                if i + 2 * k <= self.current.nodes.len() && self.runs_match(i, k) {
                    self.attempt_delete(i + k, i + 2 * k);
                }
                if i == 0 {
                    break;
                }
                i -= 1;
            }
        }
    }

    fn runs_match(&self, start: usize, len: usize) -> bool {
        (0..len).all(|j| {
            let a = &self.current.nodes[start + j];
            let b = &self.current.nodes[start + len + j];
            a.constraints == b.constraints && crate::choice::choice_equal(&a.value, &b.value)
        })
    }

    /// Replace runs of non-trivial nodes with their simplest permitted
    /// values in one step; much faster than minimizing them one by one.
    fn zero_chunks(&mut self) {
        for k in [4usize, 2, 1] {
            let mut i = self.current.nodes.len().saturating_sub(k);
            loop {
                if self.out_of_budget() {
                    return;
                }
                if i + k <= self.current.nodes.len() {
                    let mut candidate = self.current.choices();
                    let mut changed = false;
                    for j in i..i + k {
                        let node = &self.current.nodes[j];
                        if node.was_forced || node.trivial() {
                            continue;
                        }
                        if let Some(simplest) = simplest_choice(&node.constraints) {
                            candidate[j] = simplest;
                            changed = true;
                        }
                    }
                    if changed {
                        self.attempt(candidate);
                    }
                }
                if i == 0 {
                    break;
                }
                i -= 1;
            }
        }
    }

    fn minimize_nodes(&mut self) {
        let mut i = 0;
        while i < self.current.nodes.len() {
            if self.out_of_budget() {
                return;
            }
            let node = self.current.nodes[i].clone();
            if !node.was_forced && !node.trivial() {
                match &node.value {
                    ChoiceValue::Integer(v) => self.minimize_integer(i, *v, &node.constraints),
                    ChoiceValue::Boolean(_) => {
                        self.attempt_replace(i, ChoiceValue::Boolean(false));
                    }
                    ChoiceValue::Float(v) => self.minimize_float(i, *v, &node.constraints),
                    ChoiceValue::String(s) => {
                        let s = s.clone();
                        self.minimize_string(i, &s, &node.constraints);
                    }
                    ChoiceValue::Bytes(b) => {
                        let b = b.clone();
                        self.minimize_bytes(i, &b);
                    }
                }
            }
            i += 1;
        }
    }

    /// Binary search for the boundary: the smallest replacement (in shrink
    /// order) that still reproduces the failure.
    fn minimize_integer(&mut self, index: usize, value: i128, constraints: &Constraints) {
        let target = match simplest_choice(constraints) {
            Some(ChoiceValue::Integer(t)) => t,
            _ => return,
        };
        if self.attempt_replace(index, ChoiceValue::Integer(target)) {
            return;
        }
        // Invariant: `hi` reproduces, `lo` does not.
        let mut lo = target;
        let mut hi = value;
        while hi.abs_diff(lo) > 1 {
            // Overflow-safe midpoint: bounds may span the whole i128 range.
            let mid = (lo / 2) + (hi / 2) + ((lo % 2 + hi % 2) / 2);
            if self.attempt_replace(index, ChoiceValue::Integer(mid)) {
                hi = mid;
            } else {
                lo = mid;
            }
        }
    }

    fn minimize_float(&mut self, index: usize, value: f64, constraints: &Constraints) {
        if let Some(simplest) = simplest_choice(constraints) {
            if self.attempt_replace(index, simplest) {
                return;
            }
        }
        if value.is_nan() || value.is_infinite() {
            self.attempt_replace(index, ChoiceValue::Float(0.0));
            return;
        }
        // Positive of the same magnitude, then integral, then halving.
        if value.is_sign_negative() {
            if self.attempt_replace(index, ChoiceValue::Float(-value)) {
                return;
            }
        }
        if value.fract() != 0.0 {
            self.attempt_replace(index, ChoiceValue::Float(value.trunc()));
        }
        let mut w = match &self.current.nodes[index].value {
            ChoiceValue::Float(f) => *f,
            _ => return,
        };
        for _ in 0..24 {
            let half = (w / 2.0).trunc();
            if half == w || !self.attempt_replace(index, ChoiceValue::Float(half)) {
                break;
            }
            w = half;
        }
    }

    fn minimize_string(&mut self, index: usize, value: &str, constraints: &Constraints) {
        let chars: Vec<char> = value.chars().collect();
        if chars.len() > 256 {
            // Content passes are quadratic; rely on deletion for huge
            // strings and only try the simplest value.
            if let Some(simplest) = simplest_choice(constraints) {
                self.attempt_replace(index, simplest);
            }
            return;
        }
        if let Some(simplest) = simplest_choice(constraints) {
            if self.attempt_replace(index, simplest) {
                return;
            }
        }
        // Drop characters, from the end first.
        let mut current: Vec<char> = chars;
        let mut pos = current.len();
        while pos > 0 {
            pos -= 1;
            let mut shorter = current.clone();
            shorter.remove(pos);
            let candidate: String = shorter.iter().collect();
            if self.attempt_replace(index, ChoiceValue::String(candidate)) {
                current = shorter;
            }
        }
        // Lower the remaining characters to the smallest alphabet entry.
        if let Constraints::String(c) = constraints {
            if let Some(&smallest) = c.alphabet.first() {
                for j in 0..current.len() {
                    if current[j] == smallest {
                        continue;
                    }
                    let mut lowered = current.clone();
                    lowered[j] = smallest;
                    let candidate: String = lowered.iter().collect();
                    if self.attempt_replace(index, ChoiceValue::String(candidate)) {
                        current = lowered;
                    }
                }
            }
        }
    }

    fn minimize_bytes(&mut self, index: usize, value: &[u8]) {
        if value.len() > 1024 {
            self.attempt_replace(index, ChoiceValue::Bytes(Vec::new()));
            return;
        }
        let mut current = value.to_vec();
        if self.attempt_replace(index, ChoiceValue::Bytes(vec![0u8; 0])) {
            return;
        }
        let mut pos = current.len();
        while pos > 0 {
            pos -= 1;
            let mut shorter = current.clone();
            shorter.remove(pos);
            if self.attempt_replace(index, ChoiceValue::Bytes(shorter.clone())) {
                current = shorter;
            }
        }
        for j in 0..current.len() {
            if current[j] == 0 {
                continue;
            }
            let mut zeroed = current.clone();
            zeroed[j] = 0;
            if self.attempt_replace(index, ChoiceValue::Bytes(zeroed.clone())) {
                current = zeroed;
            }
        }
    }

    /// Swap adjacent out-of-order same-kind nodes; canonicalizes list-like
    /// draws so equivalent examples collapse to one representative.
    fn sort_adjacent(&mut self) {
        let mut i = 0;
        while i + 1 < self.current.nodes.len() {
            if self.out_of_budget() {
                return;
            }
            let a = &self.current.nodes[i];
            let b = &self.current.nodes[i + 1];
            if a.choice_type == b.choice_type
                && a.constraints == b.constraints
                && !a.was_forced
                && !b.was_forced
                && choice_key(&b.value, &b.constraints) < choice_key(&a.value, &a.constraints)
            {
                let mut candidate = self.current.choices();
                candidate.swap(i, i + 1);
                self.attempt(candidate);
            }
            i += 1;
        }
    }
}
