use crate::config::{Method, TrialHandlerConfig};
use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use trialflow_core::{Condition, ConditionList, SharedRecorder, normalize_conditions};

/// Builds the `n_reps x n_stim` matrix of condition indices for `method`.
pub fn build_sequence(
    n_stim: usize,
    n_reps: usize,
    method: Method,
    seed: Option<u64>,
) -> Vec<Vec<usize>> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let identity: Vec<usize> = (0..n_stim).collect();

    match method {
        Method::Sequential => vec![identity; n_reps],
        Method::Random => (0..n_reps)
            .map(|_| {
                let mut row = identity.clone();
                row.shuffle(&mut rng);
                row
            })
            .collect(),
        Method::FullRandom => {
            let mut flat: Vec<usize> = (0..n_reps).flat_map(|_| 0..n_stim).collect();
            flat.shuffle(&mut rng);
            flat.chunks(n_stim.max(1)).map(<[usize]>::to_vec).collect()
        }
    }
}

/// Pull-based trial loop over a condition list.
///
/// Cursor fields are `None` until the first trial is drawn. `next_trial` and
/// the `Iterator` implementation share the same cursor.
pub struct TrialHandler {
    name: String,
    trial_list: ConditionList,
    n_stim: usize,
    n_reps: usize,
    n_total: usize,
    n_remaining: usize,
    method: Method,
    seed: Option<u64>,
    auto_log: bool,

    this_n: Option<usize>,
    this_rep_n: Option<usize>,
    this_trial_n: Option<usize>,
    this_index: Option<usize>,
    this_trial: Option<Condition>,

    trial_sequence: Vec<Vec<usize>>,
    snapshots: Vec<Rc<Snapshot>>,
    finished: Rc<Cell<bool>>,
    recorder: Option<SharedRecorder>,
}

impl TrialHandler {
    pub fn new(config: TrialHandlerConfig) -> Self {
        let TrialHandlerConfig {
            name,
            trial_list,
            n_reps,
            method,
            seed,
            auto_log,
        } = config;

        if trial_list.as_ref().is_none_or(Vec::is_empty) {
            debug!("{name}: no conditions given, looping over a single empty trial");
        }
        if n_reps == 0 {
            warn!("{name}: n_reps is 0, the loop will not produce any trial");
        }

        let trial_list = normalize_conditions(trial_list);
        let n_stim = trial_list.len();
        let n_total = n_stim * n_reps;
        let trial_sequence = build_sequence(n_stim, n_reps, method, seed);
        info!("{name}: {n_stim} condition(s) x {n_reps} repetition(s), {method:?} order");

        Self {
            name,
            trial_list,
            n_stim,
            n_reps,
            n_total,
            n_remaining: n_total,
            method,
            seed,
            auto_log,
            this_n: None,
            this_rep_n: None,
            this_trial_n: None,
            this_index: None,
            this_trial: None,
            trial_sequence,
            snapshots: Vec::new(),
            finished: Rc::new(Cell::new(false)),
            recorder: None,
        }
    }

    /// Loop whose trials are picked by an adaptive procedure rather than a
    /// condition list. `n_planned` is the trial budget, 0 when there is none.
    pub(crate) fn adaptive(name: impl Into<String>, n_planned: usize) -> Self {
        let name = name.into();
        debug!("{name}: adaptive loop, {n_planned} planned trial(s)");
        Self {
            name,
            trial_list: Vec::new(),
            n_stim: 0,
            n_reps: 1,
            n_total: n_planned,
            n_remaining: n_planned,
            method: Method::Sequential,
            seed: None,
            auto_log: false,
            this_n: None,
            this_rep_n: None,
            this_trial_n: None,
            this_index: None,
            this_trial: None,
            trial_sequence: Vec::new(),
            snapshots: Vec::new(),
            finished: Rc::new(Cell::new(false)),
            recorder: None,
        }
    }

    /// Changes the trial budget of an adaptive loop.
    pub(crate) fn replan(&mut self, n_planned: usize) {
        let drawn = self.this_n.map_or(0, |n| n + 1);
        self.n_total = n_planned;
        self.n_remaining = n_planned.saturating_sub(drawn);
    }

    /// Shorthand for a loop over `conditions` with default settings otherwise.
    pub fn with_conditions(conditions: ConditionList, n_reps: usize, method: Method) -> Self {
        Self::new(TrialHandlerConfig {
            trial_list: Some(conditions),
            n_reps,
            method,
            ..TrialHandlerConfig::default()
        })
    }

    /// Advances the cursor and returns the next condition, or `None` once
    /// every trial has been drawn (leaving `this_trial` empty).
    pub fn next_trial(&mut self) -> Option<Condition> {
        if self.n_stim == 0 {
            self.this_trial = None;
            return None;
        }
        let this_n = self.this_n.map_or(0, |n| (n + 1).min(self.n_total));
        self.this_n = Some(this_n);

        if this_n >= self.n_total {
            self.this_trial = None;
            self.n_remaining = 0;
            return None;
        }

        let rep = this_n / self.n_stim;
        let trial_n = this_n % self.n_stim;
        let index = self.trial_sequence[rep][trial_n];
        let trial = self.trial_list[index].clone();

        self.this_rep_n = Some(rep);
        self.this_trial_n = Some(trial_n);
        self.this_index = Some(index);
        self.this_trial = Some(trial.clone());
        self.n_remaining -= 1;

        if self.auto_log {
            info!("{}: trial {this_n} (rep {rep}, index {index})", self.name);
        } else {
            debug!("{}: trial {this_n} (rep {rep}, index {index})", self.name);
        }
        Some(trial)
    }

    /// Records a trial chosen outside the precomputed sequence, as staircases
    /// do. The index follows the trial counter.
    pub(crate) fn present(&mut self, trial: Option<Condition>) {
        let this_n = self.this_n.map_or(0, |n| n + 1);
        self.present_at(trial, this_n);
    }

    /// Like [`present`](Self::present), for loops that pick which condition
    /// to show themselves.
    pub(crate) fn present_at(&mut self, trial: Option<Condition>, index: usize) {
        let this_n = self.this_n.map_or(0, |n| n + 1);
        self.this_n = Some(this_n);
        self.this_rep_n = Some(0);
        self.this_trial_n = Some(this_n);
        self.this_index = Some(index);
        self.n_remaining = self.n_remaining.saturating_sub(1);
        self.this_trial = trial;
    }

    pub(crate) fn clear_trial(&mut self) {
        self.this_trial = None;
    }

    /// Condition `n` trials before the current one, without moving the cursor.
    pub fn earlier_trial(&self, n: usize) -> Option<&Condition> {
        let this_n = self.this_n?;
        self.condition_at(this_n.checked_sub(n)?)
    }

    /// Condition `n` trials after the current one, without moving the cursor.
    pub fn future_trial(&self, n: usize) -> Option<&Condition> {
        let position = match self.this_n {
            Some(this_n) => this_n + n,
            None => n.checked_sub(1)?,
        };
        self.condition_at(position)
    }

    fn condition_at(&self, position: usize) -> Option<&Condition> {
        if position >= self.n_total || self.n_stim == 0 {
            return None;
        }
        let index = self.trial_sequence[position / self.n_stim][position % self.n_stim];
        self.trial_list.get(index)
    }

    /// Captures the cursor and current trial; the snapshot keeps observing
    /// this loop's `finished` flag.
    pub fn get_snapshot(&mut self) -> Rc<Snapshot> {
        let snapshot = Rc::new(Snapshot {
            name: self.name.clone(),
            n_stim: self.n_stim,
            n_total: self.n_total,
            n_remaining: self.n_remaining,
            this_n: self.this_n,
            this_rep_n: self.this_rep_n,
            this_trial_n: self.this_trial_n,
            this_index: self.this_index,
            trial: self.this_trial.clone(),
            finished: Rc::clone(&self.finished),
            recorder: self.recorder.clone(),
        });
        self.snapshots.push(Rc::clone(&snapshot));
        snapshot
    }

    /// Forwards to the attached recorder; a no-op without one.
    pub fn add_data(&self, key: &str, value: impl Into<Value>) {
        if let Some(recorder) = &self.recorder {
            recorder.borrow_mut().add_data(key, value.into());
        }
    }

    pub fn attach_recorder(&mut self, recorder: SharedRecorder) {
        self.recorder = Some(recorder);
    }

    pub fn recorder(&self) -> Option<&SharedRecorder> {
        self.recorder.as_ref()
    }

    pub fn set_finished(&mut self, finished: bool) {
        if finished && !self.finished.get() {
            info!("{}: finished after {} trial(s)", self.name, self.this_n.map_or(0, |n| n + 1).min(self.n_total));
        }
        self.finished.set(finished);
    }

    pub fn finished(&self) -> bool {
        self.finished.get()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trial_list(&self) -> &[Condition] {
        &self.trial_list
    }

    pub fn trial_sequence(&self) -> &[Vec<usize>] {
        &self.trial_sequence
    }

    pub fn snapshots(&self) -> &[Rc<Snapshot>] {
        &self.snapshots
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn n_stim(&self) -> usize {
        self.n_stim
    }

    pub fn n_reps(&self) -> usize {
        self.n_reps
    }

    pub fn n_total(&self) -> usize {
        self.n_total
    }

    pub fn n_remaining(&self) -> usize {
        self.n_remaining
    }

    pub fn this_n(&self) -> Option<usize> {
        self.this_n
    }

    pub fn this_rep_n(&self) -> Option<usize> {
        self.this_rep_n
    }

    pub fn this_trial_n(&self) -> Option<usize> {
        self.this_trial_n
    }

    pub fn this_index(&self) -> Option<usize> {
        self.this_index
    }

    pub fn this_trial(&self) -> Option<&Condition> {
        self.this_trial.as_ref()
    }
}

impl Iterator for TrialHandler {
    type Item = Condition;

    fn next(&mut self) -> Option<Condition> {
        self.next_trial()
    }
}

impl fmt::Debug for TrialHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrialHandler")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("n_total", &self.n_total)
            .field("n_remaining", &self.n_remaining)
            .field("this_n", &self.this_n)
            .field("finished", &self.finished.get())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a loop, kept for per-trial logging.
///
/// Everything is copied except `finished`, which is read through to the
/// owning loop.
pub struct Snapshot {
    name: String,
    n_stim: usize,
    n_total: usize,
    n_remaining: usize,
    this_n: Option<usize>,
    this_rep_n: Option<usize>,
    this_trial_n: Option<usize>,
    this_index: Option<usize>,
    trial: Option<Condition>,
    finished: Rc<Cell<bool>>,
    recorder: Option<SharedRecorder>,
}

impl Snapshot {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_stim(&self) -> usize {
        self.n_stim
    }

    pub fn n_total(&self) -> usize {
        self.n_total
    }

    pub fn n_remaining(&self) -> usize {
        self.n_remaining
    }

    pub fn this_n(&self) -> Option<usize> {
        self.this_n
    }

    pub fn this_rep_n(&self) -> Option<usize> {
        self.this_rep_n
    }

    pub fn this_trial_n(&self) -> Option<usize> {
        self.this_trial_n
    }

    pub fn this_index(&self) -> Option<usize> {
        self.this_index
    }

    pub fn current_trial(&self) -> Option<&Condition> {
        self.trial.as_ref()
    }

    pub fn finished(&self) -> bool {
        self.finished.get()
    }

    pub fn add_data(&self, key: &str, value: impl Into<Value>) {
        if let Some(recorder) = &self.recorder {
            recorder.borrow_mut().add_data(key, value.into());
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("name", &self.name)
            .field("this_n", &self.this_n)
            .field("this_trial_n", &self.this_trial_n)
            .field("trial", &self.trial)
            .field("finished", &self.finished.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trialflow_core::shared;

    fn handler(conditions: Vec<Value>, n_reps: usize, method: Method) -> TrialHandler {
        TrialHandler::with_conditions(conditions, n_reps, method)
    }

    fn letters() -> Vec<Value> {
        vec![json!("A"), json!("B"), json!("C")]
    }

    #[test]
    fn missing_conditions_become_a_single_placeholder() {
        let handler = TrialHandler::new(TrialHandlerConfig {
            n_reps: 2,
            ..TrialHandlerConfig::default()
        });
        assert_eq!(handler.trial_list(), &[Value::Null]);
        assert_eq!(handler.n_stim(), 1);
        assert_eq!(handler.n_total(), 2);
        assert_eq!(handler.n_remaining(), 2);
        assert_eq!(handler.this_n(), None);
        assert_eq!(handler.this_trial_n(), None);
    }

    #[test]
    fn empty_conditions_become_a_single_placeholder() {
        let handler = handler(vec![], 1, Method::Random);
        assert_eq!(handler.trial_list(), &[Value::Null]);
    }

    #[test]
    fn totals_follow_conditions_and_repetitions() {
        for (n_stim, n_reps) in [(1, 1), (2, 2), (3, 5), (7, 3)] {
            let conditions = (0..n_stim).map(|i| json!({ "cond": i })).collect();
            let mut handler = handler(conditions, n_reps, Method::FullRandom);
            assert_eq!(handler.n_total(), n_stim * n_reps);
            for _ in 0..handler.n_total() {
                assert!(handler.next_trial().is_some());
            }
            assert_eq!(handler.n_remaining(), 0);
            assert!(handler.next_trial().is_none());
            assert!(handler.this_trial().is_none());
        }
    }

    #[test]
    fn sequential_rows_are_identity() {
        let handler = handler(letters(), 2, Method::Sequential);
        assert_eq!(handler.trial_sequence()[0], vec![0, 1, 2]);
        assert_eq!(handler.trial_sequence()[1], vec![0, 1, 2]);
    }

    #[test]
    fn sequential_order_repeats_each_row() {
        let mut handler = handler(vec![json!({"cond": "A"}), json!({"cond": "B"})], 2, Method::Sequential);

        assert_eq!(handler.next_trial(), Some(json!({"cond": "A"})));
        assert_eq!(handler.this_n(), Some(0));
        assert_eq!(handler.this_trial_n(), Some(0));
        assert_eq!(handler.n_remaining(), 3);
        assert_eq!(handler.this_trial(), Some(&json!({"cond": "A"})));

        assert_eq!(handler.next_trial(), Some(json!({"cond": "B"})));
        assert_eq!(handler.this_trial_n(), Some(1));
        assert_eq!(handler.n_remaining(), 2);

        assert_eq!(handler.next_trial(), Some(json!({"cond": "A"})));
        assert_eq!(handler.this_n(), Some(2));
        assert_eq!(handler.this_trial_n(), Some(0));
        assert_eq!(handler.this_rep_n(), Some(1));
        assert_eq!(handler.n_remaining(), 1);

        assert_eq!(handler.next_trial(), Some(json!({"cond": "B"})));
        assert_eq!(handler.this_n(), Some(3));
        assert_eq!(handler.n_remaining(), 0);

        assert_eq!(handler.next_trial(), None);
        assert!(handler.this_trial().is_none());
    }

    #[test]
    fn random_rows_are_reproducible_with_a_seed() {
        let conditions: Vec<Value> = (0..10).map(|i| json!(i)).collect();
        let config = |seed| TrialHandlerConfig {
            trial_list: Some(conditions.clone()),
            n_reps: 3,
            method: Method::Random,
            seed: Some(seed),
            ..TrialHandlerConfig::default()
        };
        let a = TrialHandler::new(config(99999));
        let b = TrialHandler::new(config(99999));
        assert_eq!(a.trial_sequence(), b.trial_sequence());

        let identity: Vec<usize> = (0..10).collect();
        for row in a.trial_sequence() {
            let mut sorted = row.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, identity);
        }
        assert!(a.trial_sequence().iter().any(|row| *row != identity));
    }

    #[test]
    fn unseeded_random_orders_differ_from_identity() {
        let identity: Vec<usize> = (0..12).collect();
        let conditions: Vec<Value> = identity.iter().map(|i| json!(i)).collect();
        let handler = handler(conditions, 2, Method::Random);
        assert_ne!(handler.trial_sequence()[0], identity);
        assert_ne!(handler.trial_sequence()[1], identity);
    }

    #[test]
    fn full_random_keeps_the_multiset() {
        let conditions: Vec<Value> = (0..5).map(|i| json!(i)).collect();
        let handler = TrialHandler::new(TrialHandlerConfig {
            trial_list: Some(conditions),
            n_reps: 4,
            method: Method::FullRandom,
            seed: Some(99999),
            ..TrialHandlerConfig::default()
        });
        assert_eq!(handler.trial_sequence().len(), 4);
        assert!(handler.trial_sequence().iter().all(|row| row.len() == 5));

        let mut merged: Vec<usize> = handler.trial_sequence().concat();
        merged.sort_unstable();
        let expected: Vec<usize> = (0..5).flat_map(|i| std::iter::repeat_n(i, 4)).collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn three_letters_two_reps_sequential() {
        let mut handler = handler(letters(), 2, Method::Sequential);
        let drawn: Vec<Value> = handler.by_ref().take(4).collect();
        assert_eq!(drawn, vec![json!("A"), json!("B"), json!("C"), json!("A")]);
        assert_eq!(handler.next_trial(), Some(json!("B")));
        assert_eq!(handler.next_trial(), Some(json!("C")));
        assert_eq!(handler.next_trial(), None);
    }

    #[test]
    fn iteration_shares_the_cursor() {
        let mut handler = handler(vec![json!({"cond": 1}), json!({"cond": 2})], 1, Method::Sequential);
        let results: Vec<Value> = handler.by_ref().collect();
        assert_eq!(results, vec![json!({"cond": 1}), json!({"cond": 2})]);
        assert!(handler.this_trial().is_none());
        assert_eq!(handler.next_trial(), None);
    }

    #[test]
    fn snapshots_capture_the_cursor() {
        let mut handler = TrialHandler::new(TrialHandlerConfig {
            name: "myLoop".into(),
            trial_list: Some(vec![json!({"cond": "X"}), json!({"cond": "Y"})]),
            method: Method::Sequential,
            ..TrialHandlerConfig::default()
        });

        let before = handler.get_snapshot();
        assert_eq!(before.this_trial_n(), None);
        assert!(!before.finished());
        assert_eq!(handler.snapshots().len(), 1);

        handler.next_trial();
        let after = handler.get_snapshot();
        assert_eq!(after.name(), "myLoop");
        assert_eq!(after.this_trial_n(), Some(0));
        assert_eq!(after.current_trial(), Some(&json!({"cond": "X"})));
        assert_eq!(handler.snapshots().len(), 2);

        handler.next_trial();
        assert_eq!(after.current_trial(), Some(&json!({"cond": "X"})));
    }

    #[test]
    fn finishing_the_loop_is_seen_by_every_snapshot() {
        let mut handler = handler(vec![json!({"cond": 1}), json!({"cond": 2})], 1, Method::Random);
        let mut taken = vec![handler.get_snapshot()];
        handler.next_trial();
        taken.push(handler.get_snapshot());
        handler.next_trial();
        taken.push(handler.get_snapshot());
        assert_eq!(handler.snapshots().len(), 3);

        handler.set_finished(true);
        assert!(taken.iter().all(|s| s.finished()));
        assert!(handler.snapshots().iter().all(|s| s.finished()));
    }

    #[test]
    fn add_data_forwards_to_the_recorder() {
        let mut handler = handler(vec![json!({"cond": "A"})], 1, Method::Random);
        handler.add_data("ignored", 1);

        let recorder = shared(Vec::<(String, Value)>::new());
        handler.attach_recorder(recorder.clone());
        handler.add_data("accuracy", 0.9);
        handler.next_trial();
        handler.get_snapshot().add_data("rt", 412);

        assert_eq!(
            *recorder.borrow(),
            vec![("accuracy".to_string(), json!(0.9)), ("rt".to_string(), json!(412))]
        );
    }

    #[test]
    fn earlier_and_future_trials_do_not_move_the_cursor() {
        let mut handler = handler(letters(), 1, Method::Sequential);
        assert_eq!(handler.future_trial(1), Some(&json!("A")));
        assert_eq!(handler.earlier_trial(1), None);

        handler.next_trial();
        handler.next_trial();
        assert_eq!(handler.earlier_trial(1), Some(&json!("A")));
        assert_eq!(handler.future_trial(1), Some(&json!("C")));
        assert_eq!(handler.future_trial(2), None);
        assert_eq!(handler.this_index(), Some(1));
        assert_eq!(handler.this_trial(), Some(&json!("B")));
    }

    #[test]
    fn adaptive_loops_index_trials_by_their_counter() {
        let mut handler = TrialHandler::adaptive("stairs", 0);
        assert_eq!(handler.n_total(), 0);
        assert!(handler.trial_list().is_empty());

        for n in 0..4 {
            handler.present(Some(json!({"intensity": n})));
            assert_eq!(handler.this_n(), Some(n));
            assert_eq!(handler.this_index(), Some(n));
        }
        assert_eq!(handler.n_remaining(), 0);
        assert_eq!(handler.earlier_trial(1), None);
        assert_eq!(handler.next_trial(), None);
        assert_eq!(handler.this_n(), Some(3));
    }
}
