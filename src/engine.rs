//! The runner: a phase-driven state machine over test attempts.
//!
//! Phases run in a fixed order, each optional per settings: `explicit`
//! (user-pinned sequences), `reuse` (database replay), `generate` (fresh
//! sequences, with targeted mutation folded in), `shrink` (once per
//! distinct interesting origin) and `explain` (best-effort analysis of the
//! minimal failure). Outcomes feed health-check counters and flakiness
//! bookkeeping continuously; the first unsuppressed health check aborts
//! the run.

use crate::choice::{choices_checksum, ChoiceValue};
use crate::data::{
    ConjectureData, ConjectureResult, InterestingOrigin, Status, DEFAULT_MAX_CHOICES,
};
use crate::database::{
    choices_from_bytes, choices_to_bytes, database_key, ExampleDatabase,
};
use crate::errors::{DrawError, EngineError, HealthCheck, TestError};
use crate::observe::Observation;
use crate::provider::{make_provider, PrimitiveProvider};
use crate::shrinker::Shrinker;
use crate::target::TargetState;
use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha384};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Execution phases, in their fixed run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Explicit,
    Reuse,
    Generate,
    Target,
    Shrink,
    Explain,
}

impl Phase {
    pub fn all() -> Vec<Phase> {
        vec![
            Phase::Explicit,
            Phase::Reuse,
            Phase::Generate,
            Phase::Target,
            Phase::Shrink,
            Phase::Explain,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    Debug,
}

/// Wall-clock budget for the whole generate phase.
const GENERATE_TIME_BUDGET: Duration = Duration::from_secs(60);

/// Cap on independently reported bugs per run.
const MAX_REPORTED_BUGS: usize = 10;

/// Attempts with at least this many choices count as oversized for the
/// DataTooLarge health check.
const LARGE_EXAMPLE_CHOICES: usize = DEFAULT_MAX_CHOICES / 2;

/// Immutable configuration snapshot; every runner closes over one.
#[derive(Clone)]
pub struct Settings {
    pub max_examples: usize,
    /// Derive all entropy from the test's identity, for reproducible CI.
    pub derandomize: bool,
    pub seed: Option<u64>,
    pub database: Option<Arc<dyn ExampleDatabase>>,
    /// Per-attempt deadline; exceeding it is a failure in its own right.
    pub deadline: Option<Duration>,
    pub phases: Vec<Phase>,
    /// Include a reproduction blob in failure reports.
    pub print_blob: bool,
    pub report_multiple_bugs: bool,
    /// Step bound per attempt for stateful tests.
    pub stateful_step_count: usize,
    pub suppress_health_check: HashSet<HealthCheck>,
    pub verbosity: Verbosity,
    /// Named entropy backend; see [`crate::provider::register_provider`].
    pub backend: String,
    /// Call budget for each shrink run.
    pub max_shrinks: usize,
    pub shrink_deadline: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_examples: 100,
            derandomize: false,
            seed: None,
            database: None,
            deadline: None,
            phases: Phase::all(),
            print_blob: false,
            report_multiple_bugs: true,
            stateful_step_count: 50,
            suppress_health_check: HashSet::new(),
            verbosity: Verbosity::Normal,
            backend: "standard".to_string(),
            max_shrinks: 500,
            shrink_deadline: Duration::from_secs(20),
        }
    }
}

impl Settings {
    /// Validation happens at construction, never mid-generation.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_examples == 0 {
            return Err(EngineError::InvalidArgument(
                "max_examples must be positive".into(),
            ));
        }
        if self.stateful_step_count == 0 {
            return Err(EngineError::InvalidArgument(
                "stateful_step_count must be positive".into(),
            ));
        }
        if self.max_shrinks == 0 {
            return Err(EngineError::InvalidArgument(
                "max_shrinks must be positive".into(),
            ));
        }
        if make_provider(&self.backend, 0).is_none() {
            return Err(EngineError::InvalidArgument(format!(
                "unknown backend {:?}",
                self.backend
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("max_examples", &self.max_examples)
            .field("derandomize", &self.derandomize)
            .field("seed", &self.seed)
            .field("database", &self.database.is_some())
            .field("deadline", &self.deadline)
            .field("phases", &self.phases)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

static DEFAULT_PROFILE: Lazy<RwLock<Settings>> = Lazy::new(|| RwLock::new(Settings::default()));

/// Snapshot of the process-wide default profile.
pub fn default_settings() -> Settings {
    DEFAULT_PROFILE
        .read()
        .expect("settings profile poisoned")
        .clone()
}

/// Override the process-wide default profile. Runners snapshot settings at
/// construction, so a running runner is unaffected.
pub fn set_default_settings(settings: Settings) -> Result<(), EngineError> {
    settings.validate()?;
    *DEFAULT_PROFILE.write().expect("settings profile poisoned") = settings;
    Ok(())
}

/// Aggregate counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub calls: usize,
    pub valid: usize,
    pub invalid: usize,
    pub overrun: usize,
    pub interesting: usize,
    pub shrink_calls: usize,
    pub mutated: usize,
}

/// One minimized bug.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub origin: InterestingOrigin,
    pub message: String,
    pub choices: Vec<ChoiceValue>,
    /// Hex reproduction blob, present when `print_blob` is set.
    pub blob: Option<String>,
    /// Whether shrinking reached a fixpoint (vs running out of budget).
    pub fully_shrunk: bool,
    /// Node ranges that the explain phase found to vary freely.
    pub free_ranges: Vec<(usize, usize)>,
    /// Other origins encountered while shrinking this one.
    pub diverged_origins: Vec<InterestingOrigin>,
}

#[derive(Debug)]
pub struct RunReport {
    pub failures: Vec<FailureReport>,
    pub stats: RunStats,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

type TestFn<'a> = Box<dyn FnMut(&mut ConjectureData) -> Result<(), TestError> + 'a>;
type SinkFn<'a> = Box<dyn FnMut(&Observation) + 'a>;

/// Drives one property through all phases.
pub struct Runner<'a> {
    name: String,
    settings: Settings,
    test: TestFn<'a>,
    explicit: Vec<Vec<ChoiceValue>>,
    observer: Option<SinkFn<'a>>,
    rng: ChaCha8Rng,
    seed_base: u64,
    stats: RunStats,
    /// Insertion-ordered distinct interesting results, one per origin.
    interesting: Vec<ConjectureResult>,
    /// checksum of executed choices -> (status, origin), for flakiness.
    seen: HashMap<u64, (Status, Option<InterestingOrigin>)>,
    flaky: Option<EngineError>,
    fatal: Option<EngineError>,
    target_state: TargetState,
    large_examples: usize,
    current_phase: Phase,
}

impl<'a> Runner<'a> {
    pub fn new(
        name: impl Into<String>,
        settings: Settings,
        test: impl FnMut(&mut ConjectureData) -> Result<(), TestError> + 'a,
    ) -> Result<Self, EngineError> {
        settings.validate()?;
        let name = name.into();
        let seed_base = if settings.derandomize {
            seed_from_name(&name)
        } else {
            settings.seed.unwrap_or_else(rand::random)
        };
        Ok(Self {
            settings,
            test: Box::new(test),
            explicit: Vec::new(),
            observer: None,
            rng: ChaCha8Rng::seed_from_u64(seed_base ^ 0x5eed),
            seed_base,
            stats: RunStats::default(),
            interesting: Vec::new(),
            seen: HashMap::new(),
            flaky: None,
            fatal: None,
            target_state: TargetState::new(),
            large_examples: 0,
            current_phase: Phase::Explicit,
            name,
        })
    }

    /// Pin an explicit example: its choices are replayed before anything
    /// else, and a failure here aborts all remaining phases.
    pub fn add_explicit_example(&mut self, choices: Vec<ChoiceValue>) {
        self.explicit.push(choices);
    }

    /// Attach a write-only observation sink.
    pub fn set_observer(&mut self, sink: impl FnMut(&Observation) + 'a) {
        self.observer = Some(Box::new(sink));
    }

    /// Adapters report environment-level health problems through this.
    pub fn raise_health_check(
        &self,
        check: HealthCheck,
        message: impl Into<String>,
    ) -> Result<(), EngineError> {
        if self.settings.suppress_health_check.contains(&check) {
            log::warn!("suppressed health check {check}: {}", message.into());
            Ok(())
        } else {
            Err(EngineError::FailedHealthCheck {
                check,
                message: message.into(),
            })
        }
    }

    fn phase_enabled(&self, phase: Phase) -> bool {
        self.settings.phases.contains(&phase)
    }

    fn database(&self) -> Option<Arc<dyn ExampleDatabase>> {
        self.settings
            .database
            .clone()
            .or_else(crate::database::default_database)
    }

    fn db_key(&self) -> Vec<u8> {
        database_key(&self.name)
    }

    /// Run all enabled phases and report.
    pub fn run(&mut self) -> Result<RunReport, EngineError> {
        log::debug!("starting run for {:?} with {:?}", self.name, self.settings);

        if self.phase_enabled(Phase::Explicit) {
            self.current_phase = Phase::Explicit;
            let pinned_failure = self.run_explicit()?;
            if let Some(err) = self.take_run_error() {
                return Err(err);
            }
            if let Some(report) = pinned_failure {
                return Ok(report);
            }
        }
        if self.phase_enabled(Phase::Reuse) {
            self.current_phase = Phase::Reuse;
            self.run_reuse()?;
        }
        if self.phase_enabled(Phase::Generate) {
            self.current_phase = Phase::Generate;
            self.run_generate()?;
        }

        // An inconsistent classification must surface even when the run
        // found nothing interesting to shrink.
        if let Some(err) = self.take_run_error() {
            return Err(err);
        }

        if self.interesting.is_empty() {
            // Too many discards without enough valid examples is a
            // configuration problem, not a pass.
            let discards = self.stats.invalid + self.stats.overrun;
            if self.stats.valid < self.settings.max_examples
                && self.stats.calls >= 50
                && discards * 10 >= self.stats.calls * 9
            {
                return Err(EngineError::Unsatisfiable {
                    valid: self.stats.valid,
                    calls: self.stats.calls,
                });
            }
            return Ok(RunReport {
                failures: Vec::new(),
                stats: self.stats.clone(),
            });
        }

        let mut failures = self.run_shrink()?;

        if self.phase_enabled(Phase::Explain) {
            self.current_phase = Phase::Explain;
            for failure in &mut failures {
                failure.free_ranges = self.explain(failure);
            }
            if let Some(err) = self.take_run_error() {
                return Err(err);
            }
        }

        self.persist_failures(&failures);
        Ok(RunReport {
            failures,
            stats: self.stats.clone(),
        })
    }

    // --- explicit ----------------------------------------------------

    fn run_explicit(&mut self) -> Result<Option<RunReport>, EngineError> {
        for choices in self.explicit.clone() {
            let result = self.execute_forced(&choices)?;
            if result.status == Status::Interesting {
                // A failing pinned example short-circuits everything.
                let origin = result
                    .interesting_origin
                    .clone()
                    .unwrap_or_else(|| InterestingOrigin::assertion("explicit"));
                let failure = FailureReport {
                    message: format!("{origin} (explicit example)"),
                    choices: result.choices(),
                    blob: self.blob_for(&result),
                    fully_shrunk: false,
                    free_ranges: Vec::new(),
                    diverged_origins: Vec::new(),
                    origin,
                };
                return Ok(Some(RunReport {
                    failures: vec![failure],
                    stats: self.stats.clone(),
                }));
            }
        }
        Ok(None)
    }

    // --- reuse -------------------------------------------------------

    fn run_reuse(&mut self) -> Result<(), EngineError> {
        let Some(db) = self.database() else {
            return Ok(());
        };
        let key = self.db_key();
        for blob in db.fetch(&key) {
            let Some(choices) = choices_from_bytes(&blob) else {
                // Stale entries from an older serialization are misses.
                db.delete(&key, &blob);
                continue;
            };
            let result = self.execute_replay(&choices)?;
            match result.status {
                Status::Interesting => self.note_interesting(result),
                _ => {
                    log::warn!(
                        "did not reproduce: stored example for {:?} is no longer failing",
                        self.name
                    );
                    db.delete(&key, &blob);
                }
            }
        }
        Ok(())
    }

    // --- generate ----------------------------------------------------

    fn should_keep_generating(&self, started: Instant) -> bool {
        if self.stats.valid >= self.settings.max_examples {
            return false;
        }
        if self.stats.calls >= self.settings.max_examples.saturating_mul(10) {
            return false;
        }
        if started.elapsed() >= GENERATE_TIME_BUDGET {
            return false;
        }
        if !self.interesting.is_empty() && !self.settings.report_multiple_bugs {
            return false;
        }
        if self.interesting.len() >= MAX_REPORTED_BUGS {
            return false;
        }
        true
    }

    fn run_generate(&mut self) -> Result<(), EngineError> {
        let started = Instant::now();
        while self.should_keep_generating(started) {
            let attempt_seed = self.seed_base.wrapping_add(self.stats.calls as u64);
            let provider = self.provider(attempt_seed)?;

            let mutate = self.phase_enabled(Phase::Target)
                && self.target_state.has_observations()
                && self.rng.gen::<f64>() < 0.3;
            let result = if mutate {
                match self.target_state.candidate(&mut self.rng) {
                    Some(prefix) => {
                        self.stats.mutated += 1;
                        let data = ConjectureData::with_prefix(prefix, provider);
                        self.execute(data)?
                    }
                    None => self.execute(ConjectureData::new(provider))?,
                }
            } else {
                self.execute(ConjectureData::new(provider))?
            };

            self.target_state.record(&result);
            self.check_generate_health(&result)?;
            if result.status == Status::Interesting {
                self.note_interesting(result);
            }
        }
        Ok(())
    }

    fn check_generate_health(&mut self, result: &ConjectureResult) -> Result<(), EngineError> {
        if result.draw_time > Duration::from_secs(1) {
            self.raise_health_check(
                HealthCheck::TooSlow,
                format!("drawing one input took {:?}", result.draw_time),
            )?;
        }
        if result.nodes.len() >= LARGE_EXAMPLE_CHOICES {
            self.large_examples += 1;
            if self.large_examples >= 10 {
                self.raise_health_check(
                    HealthCheck::DataTooLarge,
                    format!(
                        "{} generated examples used {}+ choices",
                        self.large_examples, LARGE_EXAMPLE_CHOICES
                    ),
                )?;
            }
        }
        // Filter pressure, checked once early: discards dominating the
        // first batch means the predicates are doing the generation's job.
        let discards = self.stats.invalid + self.stats.overrun;
        if self.stats.calls == 50 && self.interesting.is_empty() && discards * 10 >= self.stats.calls * 9 {
            self.raise_health_check(
                HealthCheck::FilterTooMuch,
                format!("{discards} of {} attempts were discarded", self.stats.calls),
            )?;
        }
        Ok(())
    }

    // --- shrink ------------------------------------------------------

    fn run_shrink(&mut self) -> Result<Vec<FailureReport>, EngineError> {
        let mut queue = self.interesting.clone();
        if !self.settings.report_multiple_bugs {
            queue.truncate(1);
        }
        queue.truncate(MAX_REPORTED_BUGS);

        let mut failures = Vec::new();
        for seed_result in queue {
            let origin = match seed_result.interesting_origin.clone() {
                Some(origin) => origin,
                None => continue,
            };
            let (result, fully_shrunk, diverged) = if self.phase_enabled(Phase::Shrink) {
                self.current_phase = Phase::Shrink;
                let max_calls = self.settings.max_shrinks;
                let deadline = self.settings.shrink_deadline;
                let outcome = {
                    let shrinker = Shrinker::new(
                        seed_result,
                        origin.clone(),
                        max_calls,
                        deadline,
                        Box::new(|choices| self.execute_for_shrink(choices)),
                    );
                    shrinker.shrink()
                };
                self.stats.shrink_calls += outcome.calls;
                (outcome.result, outcome.fully_shrunk, outcome.diverged_origins)
            } else {
                (seed_result, false, Vec::new())
            };
            if let Some(err) = self.take_run_error() {
                return Err(err);
            }
            failures.push(FailureReport {
                message: format!("{origin}"),
                choices: result.choices(),
                blob: self.blob_for(&result),
                fully_shrunk,
                free_ranges: Vec::new(),
                diverged_origins: diverged,
                origin,
            });
        }
        Ok(failures)
    }

    fn persist_failures(&mut self, failures: &[FailureReport]) {
        let Some(db) = self.database() else { return };
        let key = self.db_key();
        for failure in failures {
            db.save(&key, &choices_to_bytes(&failure.choices));
        }
    }

    // --- explain -----------------------------------------------------

    /// Best effort: for each choice of the minimal failure, try a few
    /// random substitutions; positions where every substitute still fails
    /// the same way are reported as varying freely.
    fn explain(&mut self, failure: &FailureReport) -> Vec<(usize, usize)> {
        const PROBES: usize = 3;
        let choices = failure.choices.clone();
        let mut free: Vec<usize> = Vec::new();
        for i in 0..choices.len() {
            let mut all_reproduce = true;
            for probe in 0..PROBES {
                let seed = self.rng.gen::<u64>().wrapping_add(probe as u64);
                let Ok(mut provider) = self.provider(seed) else {
                    return Vec::new();
                };
                let mut candidate = choices.clone();
                candidate[i] = resample(provider.as_mut(), &candidate[i]);
                if choices_checksum(&candidate) == choices_checksum(&choices) {
                    continue;
                }
                let Ok(result) = self.execute_replay(&candidate) else {
                    return Vec::new();
                };
                if result.status != Status::Interesting
                    || result.interesting_origin.as_ref() != Some(&failure.origin)
                {
                    all_reproduce = false;
                    break;
                }
            }
            if all_reproduce {
                free.push(i);
            }
        }
        // Collapse index runs into ranges.
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for i in free {
            match ranges.last_mut() {
                Some((_, end)) if *end == i => *end = i + 1,
                _ => ranges.push((i, i + 1)),
            }
        }
        ranges
    }

    // --- execution ---------------------------------------------------

    fn provider(&self, seed: u64) -> Result<Box<dyn PrimitiveProvider>, EngineError> {
        make_provider(&self.settings.backend, seed).ok_or_else(|| {
            EngineError::InvalidArgument(format!("unknown backend {:?}", self.settings.backend))
        })
    }

    fn execute_replay(&mut self, choices: &[ChoiceValue]) -> Result<ConjectureResult, EngineError> {
        let data = ConjectureData::for_choices(choices.to_vec());
        self.execute(data)
    }

    /// Replay with every value pinned, for explicit examples.
    fn execute_forced(&mut self, choices: &[ChoiceValue]) -> Result<ConjectureResult, EngineError> {
        // Forced-prefix: replay the pinned values, then continue fresh so a
        // partial explicit example still produces a complete input.
        let provider = self.provider(self.seed_base)?;
        let data = ConjectureData::with_prefix(choices.to_vec(), provider);
        self.execute(data)
    }

    /// Shrink-candidate execution: same classification, but errors are
    /// stashed because the shrinker's callback cannot propagate them.
    fn execute_for_shrink(&mut self, choices: &[ChoiceValue]) -> ConjectureResult {
        let data = ConjectureData::for_choices(choices.to_vec());
        match self.execute(data) {
            Ok(result) => result,
            Err(err) => {
                if self.fatal.is_none() {
                    self.fatal = Some(err);
                }
                // Sterile placeholder; the shrinker will discard it.
                ConjectureResult {
                    status: Status::Invalid,
                    interesting_origin: None,
                    nodes: Vec::new(),
                    spans: Vec::new(),
                    target_observations: Default::default(),
                    events: Vec::new(),
                    draw_time: Duration::ZERO,
                }
            }
        }
    }

    fn take_run_error(&mut self) -> Option<EngineError> {
        self.flaky.take().or_else(|| self.fatal.take())
    }

    /// Run the test callback over `data` and classify the outcome.
    fn execute(&mut self, mut data: ConjectureData) -> Result<ConjectureResult, EngineError> {
        self.stats.calls += 1;
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.test)(&mut data)));
        let runtime = started.elapsed();

        match outcome {
            Ok(Ok(())) => {
                let deadline_hit = self
                    .settings
                    .deadline
                    .map_or(false, |deadline| runtime > deadline);
                if deadline_hit {
                    data.freeze_with(
                        Status::Interesting,
                        Some(InterestingOrigin::deadline()),
                    );
                } else {
                    data.freeze_with(Status::Valid, None);
                }
            }
            Ok(Err(TestError::Draw(DrawError::Overrun))) => {
                data.freeze_with(Status::Overrun, None);
            }
            Ok(Err(TestError::Draw(
                err @ (DrawError::Frozen | DrawError::InvalidArguments(_)),
            ))) => {
                return Err(EngineError::InvalidArgument(err.to_string()));
            }
            Ok(Err(TestError::Draw(DrawError::Unsatisfied(_))))
            | Ok(Err(TestError::Rejected(_))) => {
                data.freeze_with(Status::Invalid, None);
            }
            Ok(Err(TestError::Failure { origin, .. })) => {
                data.freeze_with(Status::Interesting, Some(origin));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                data.freeze_with(
                    Status::Interesting,
                    Some(InterestingOrigin::panic(&message)),
                );
            }
        }

        let result = data.as_result();
        if self.settings.verbosity >= Verbosity::Verbose {
            log::info!(
                "attempt {} in {:?}: {}",
                self.stats.calls,
                self.current_phase,
                result.status
            );
        }
        self.tally(&result);
        self.check_flaky(&result);
        self.emit_observation(&result, runtime);
        Ok(result)
    }

    fn tally(&mut self, result: &ConjectureResult) {
        match result.status {
            Status::Valid => self.stats.valid += 1,
            Status::Invalid => self.stats.invalid += 1,
            Status::Overrun => self.stats.overrun += 1,
            Status::Interesting => self.stats.interesting += 1,
        }
    }

    /// The same executed choices must classify the same way every time.
    fn check_flaky(&mut self, result: &ConjectureResult) {
        let checksum = choices_checksum(&result.choices());
        let entry = (result.status, result.interesting_origin.clone());
        match self.seen.get(&checksum) {
            Some(previous) if *previous != entry => {
                if self.flaky.is_none() {
                    self.flaky = Some(EngineError::Flaky {
                        first: format!("{:?}", previous),
                        second: format!("{:?}", entry),
                    });
                }
            }
            Some(_) => {}
            None => {
                self.seen.insert(checksum, entry);
            }
        }
    }

    fn emit_observation(&mut self, result: &ConjectureResult, runtime: Duration) {
        if let Some(observer) = &mut self.observer {
            let representation = format!(
                "{:?}",
                result.nodes.iter().map(|n| &n.value).collect::<Vec<_>>()
            );
            observer(&Observation {
                status: result.status,
                representation,
                runtime,
                draw_time: result.draw_time,
                events: result.events.clone(),
                targets: result.target_observations.clone(),
                phase: self.current_phase,
            });
        }
    }

    fn note_interesting(&mut self, result: ConjectureResult) {
        let Some(origin) = result.interesting_origin.clone() else {
            return;
        };
        let known = self
            .interesting
            .iter()
            .any(|r| r.interesting_origin.as_ref() == Some(&origin));
        if !known {
            log::debug!("new interesting origin {origin}");
            self.interesting.push(result);
        }
    }

    fn blob_for(&self, result: &ConjectureResult) -> Option<String> {
        if self.settings.print_blob {
            Some(hex::encode(choices_to_bytes(&result.choices())))
        } else {
            None
        }
    }

    // --- fuzzing -----------------------------------------------------

    /// One fuzzer-driven attempt over a raw blob.
    pub fn fuzz_one_input(&mut self, blob: &[u8]) -> Result<FuzzOutcome, EngineError> {
        let Some(choices) = choices_from_bytes(blob) else {
            return Ok(FuzzOutcome::InvalidBlob);
        };
        let result = self.execute_replay(&choices)?;
        if let Some(err) = self.take_run_error() {
            return Err(err);
        }
        match result.status {
            Status::Interesting => {
                if let Some(db) = self.database() {
                    db.save(&self.db_key(), &choices_to_bytes(&result.choices()));
                }
                let origin = result
                    .interesting_origin
                    .clone()
                    .unwrap_or_else(|| InterestingOrigin::assertion("fuzz"));
                Ok(FuzzOutcome::Failed(FailureReport {
                    message: format!("{origin}"),
                    choices: result.choices(),
                    blob: Some(hex::encode(choices_to_bytes(&result.choices()))),
                    fully_shrunk: false,
                    free_ranges: Vec::new(),
                    diverged_origins: Vec::new(),
                    origin,
                }))
            }
            // The result's nodes are the consumed prefix: a canonical,
            // pruned replay blob.
            Status::Valid => Ok(FuzzOutcome::Ok(choices_to_bytes(&result.choices()))),
            Status::Invalid | Status::Overrun => Ok(FuzzOutcome::Rejected),
        }
    }
}

/// Outcome of [`Runner::fuzz_one_input`].
#[derive(Debug)]
pub enum FuzzOutcome {
    /// Attempt passed; contains the canonicalized replay blob.
    Ok(Vec<u8>),
    /// The blob did not parse as a choice sequence.
    InvalidBlob,
    /// The attempt was invalid or overran; nothing to keep.
    Rejected,
    /// The attempt failed; it was persisted before being reported.
    Failed(FailureReport),
}

fn seed_from_name(name: &str) -> u64 {
    let mut hasher = Sha384::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is at least 8 bytes"))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Redraw a value of the same kind with loose constraints, for explain
/// probes.
fn resample(provider: &mut dyn PrimitiveProvider, value: &ChoiceValue) -> ChoiceValue {
    use crate::choice::*;
    match value {
        ChoiceValue::Integer(_) => ChoiceValue::Integer(provider.draw_integer(
            &IntegerConstraints::default(),
        )),
        ChoiceValue::Boolean(_) => {
            ChoiceValue::Boolean(provider.draw_boolean(&BooleanConstraints::default()))
        }
        ChoiceValue::Float(_) => {
            ChoiceValue::Float(provider.draw_float(&FloatConstraints::default()))
        }
        ChoiceValue::String(s) => ChoiceValue::String(provider.draw_string(
            &StringConstraints::new("abcdefghijklmnopqrstuvwxyz", 0, s.chars().count().max(4)),
        )),
        ChoiceValue::Bytes(b) => ChoiceValue::Bytes(provider.draw_bytes(&BytesConstraints {
            min_size: 0,
            max_size: b.len().max(4),
        })),
    }
}

/// Convenience front door: run `test` under `settings`, returning the
/// report.
pub fn check(
    name: &str,
    settings: Settings,
    test: impl FnMut(&mut ConjectureData) -> Result<(), TestError>,
) -> Result<RunReport, EngineError> {
    Runner::new(name, settings, test)?.run()
}
