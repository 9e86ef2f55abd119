use crate::config::{StairConfig, StepType, StopRule};
use crate::staircase::{AttributeReader, Direction, Staircase, check_bounds};
use crate::trial::{Snapshot, TrialHandler};
use log::{debug, warn};
use serde_json::{Map, Value, json};
use std::rc::Rc;
use trialflow_core::{
    AttributeSet, Condition, Error, Result, SharedRecorder, ensure_binary_response, with_attribute,
};

/// Classic n-up/m-down staircase.
///
/// Until the first reversal a 1-up/1-down rule applies when
/// `apply_initial_rule` is set. Step sizes shrink with the number of
/// reversals and stay at the last entry once the list is exhausted.
pub struct StairHandler {
    config: StairConfig,
    attributes: AttributeSet,
    n_reversals: usize,
    trials: TrialHandler,
    stair_value: f64,
    direction: Direction,
    /// Positive: length of the current run of correct answers; negative: of
    /// incorrect ones.
    correct_counter: i64,
    initial_rule: bool,
    data: Vec<u8>,
    values: Vec<f64>,
    reversal_intensities: Vec<f64>,
    reversal_points: Vec<usize>,
}

impl StairHandler {
    pub fn new(config: StairConfig) -> Result<Self> {
        let origin = format!("StairHandler {}", config.name);
        if config.step_sizes.is_empty() {
            return Err(Error::configuration(origin, "at least one step size is required"));
        }
        if config.n_up == 0 || config.n_down == 0 {
            return Err(Error::configuration(origin, "nUp and nDown must be at least 1"));
        }
        if !config.start_val.is_finite() {
            return Err(Error::configuration(origin, "startVal must be a finite number"));
        }
        if let (Some(min), Some(max)) = (config.min_val, config.max_val) {
            if min > max {
                return Err(Error::configuration(origin, format!("minVal {min} exceeds maxVal {max}")));
            }
        }

        let n_steps = config.step_sizes.len();
        let n_reversals = match config.n_reversals {
            None => n_steps,
            Some(n) if n < n_steps => {
                warn!("{origin}: nReversals ({n}) is smaller than the number of step sizes, using {n_steps}");
                n_steps
            }
            Some(n) => n,
        };

        let trials = TrialHandler::adaptive(config.name.as_str(), config.n_trials);

        Ok(Self {
            attributes: Self::declare_attributes(&config, n_reversals),
            stair_value: config.start_val,
            n_reversals,
            trials,
            direction: Direction::Start,
            correct_counter: 0,
            initial_rule: false,
            data: Vec::new(),
            values: Vec::new(),
            reversal_intensities: Vec::new(),
            reversal_points: Vec::new(),
            config,
        })
    }

    fn declare_attributes(config: &StairConfig, n_reversals: usize) -> AttributeSet {
        let mut attrs = AttributeSet::new("StairHandler");
        attrs.insert("name", config.name.as_str());
        attrs.insert("varName", config.var_name.as_str());
        attrs.insert("startVal", config.start_val);
        attrs.insert("minVal", json!(config.min_val));
        attrs.insert("maxVal", json!(config.max_val));
        attrs.insert("nTrials", config.n_trials);
        attrs.insert("nReversals", n_reversals);
        attrs.insert("nUp", config.n_up);
        attrs.insert("nDown", config.n_down);
        attrs.insert("applyInitialRule", config.apply_initial_rule);
        attrs.insert("stepSizes", json!(config.step_sizes));
        attrs.insert("stepType", json!(config.step_type));
        attrs
    }

    /// Runs `callback` with the new value whenever `name` changes through
    /// [`Staircase::set_attribute`].
    pub fn on_attribute_change(&mut self, name: &str, callback: impl Fn(&Value) + 'static) {
        self.attributes.on_change(name, callback);
    }

    fn apply_attribute(&mut self, name: &str, value: &Value) -> Result<()> {
        let origin = format!("StairHandler {}", self.config.name);
        let reader = AttributeReader { origin: &origin, name };
        match name {
            "nUp" => self.config.n_up = reader.positive_count(value)?,
            "nDown" => self.config.n_down = reader.positive_count(value)?,
            "nTrials" => {
                self.config.n_trials = reader.count(value)?;
                self.trials.replan(self.config.n_trials);
            }
            "nReversals" => {
                let n = reader.count(value)?;
                if n < self.config.step_sizes.len() {
                    return Err(reader.invalid("must be at least the number of step sizes"));
                }
                self.n_reversals = n;
            }
            "stepSizes" => {
                let steps = reader.numbers(value)?;
                if steps.len() > self.n_reversals {
                    return Err(reader.invalid("has more entries than nReversals"));
                }
                self.config.step_sizes = steps;
            }
            "stepType" => {
                self.config.step_type = serde_json::from_value(value.clone())
                    .map_err(|_| reader.invalid("expected linear, log or db"))?;
            }
            "applyInitialRule" => {
                self.config.apply_initial_rule =
                    value.as_bool().ok_or_else(|| reader.invalid("expected a boolean"))?;
            }
            "minVal" | "maxVal" => {
                let bound = reader.optional_number(value)?;
                let (min, max) = if name == "minVal" {
                    (bound, self.config.max_val)
                } else {
                    (self.config.min_val, bound)
                };
                check_bounds(&reader, min, max)?;
                self.config.min_val = min;
                self.config.max_val = max;
                self.stair_value = self.clamp(self.stair_value);
            }
            _ => return Err(reader.fixed()),
        }
        Ok(())
    }

    pub fn stair_value(&self) -> f64 {
        self.stair_value
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn correct_counter(&self) -> i64 {
        self.correct_counter
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn reversal_intensities(&self) -> &[f64] {
        &self.reversal_intensities
    }

    /// Trial indices at which the direction reversed.
    pub fn reversal_points(&self) -> &[usize] {
        &self.reversal_points
    }

    pub fn n_reversals(&self) -> usize {
        self.n_reversals
    }

    pub fn finished(&self) -> bool {
        self.trials.finished()
    }

    /// Presents the next trial, `{var_name: intensity, ..extra_args}`, or
    /// `None` once the staircase has finished.
    pub fn next_trial(&mut self) -> Option<Condition> {
        if self.finished() {
            self.trials.clear_trial();
            return None;
        }
        let trial = with_attribute(
            &Value::Object(self.config.extra_args.clone()),
            &self.config.var_name,
            json!(self.stair_value),
        );
        self.trials.present(Some(trial.clone()));
        Some(trial)
    }

    pub fn get_snapshot(&mut self) -> Rc<Snapshot> {
        self.trials.get_snapshot()
    }

    pub fn add_data(&self, key: &str, value: impl Into<Value>) {
        self.trials.add_data(key, value);
    }

    fn update_counter(&mut self, correct: bool) {
        let previous = self.data.len().checked_sub(2).map(|i| self.data[i]);
        self.correct_counter = match (correct, previous) {
            (true, Some(1)) => self.correct_counter + 1,
            (true, _) => 1,
            (false, Some(0)) => self.correct_counter - 1,
            (false, _) => -1,
        };
    }

    fn calculate_next_intensity(&mut self, correct: bool) {
        let in_initial_phase = self.reversal_intensities.is_empty() && self.config.apply_initial_rule;
        let n_down = self.config.n_down as i64;
        let n_up = self.config.n_up as i64;

        let next_direction = if in_initial_phase {
            Some(if correct { Direction::Down } else { Direction::Up })
        } else if self.correct_counter >= n_down {
            Some(Direction::Down)
        } else if self.correct_counter <= -n_up {
            Some(Direction::Up)
        } else {
            None
        };

        let mut reversal = false;
        if let Some(next) = next_direction {
            reversal = self.direction != Direction::Start && self.direction != next;
            self.direction = next;
        }

        if reversal {
            self.reversal_points.push(self.data.len() - 1);
            if self.reversal_intensities.is_empty() && self.config.apply_initial_rule {
                self.initial_rule = true;
            }
            let tested = self.values.last().copied().unwrap_or(self.stair_value);
            self.reversal_intensities.push(tested);
            debug!(
                "{}: reversal {} at {tested}",
                self.config.name,
                self.reversal_intensities.len()
            );
        }

        if self.reached_stopping_rule() {
            self.trials.set_finished(true);
        }

        if (self.reversal_intensities.is_empty() || self.initial_rule) && self.config.apply_initial_rule {
            self.initial_rule = false;
            if correct {
                self.decrease_value();
            } else {
                self.increase_value();
            }
        } else if self.correct_counter >= n_down {
            self.decrease_value();
        } else if self.correct_counter <= -n_up {
            self.increase_value();
        }
    }

    fn reached_stopping_rule(&self) -> bool {
        let enough_reversals = self.reversal_intensities.len() >= self.n_reversals;
        let enough_trials = self.values.len() >= self.config.n_trials;
        match self.config.stop_rule {
            StopRule::ReversalsAndTrials => enough_reversals && enough_trials,
            // A zero trial budget means "no budget" here.
            StopRule::ReversalsOrTrials => {
                enough_reversals || (self.config.n_trials > 0 && enough_trials)
            }
        }
    }

    fn current_step(&self) -> f64 {
        let steps = &self.config.step_sizes;
        steps[self.reversal_intensities.len().min(steps.len() - 1)]
    }

    fn increase_value(&mut self) {
        let step = self.current_step();
        let value = match self.config.step_type {
            StepType::Linear => self.stair_value + step,
            StepType::Log => self.stair_value * 10f64.powf(step),
            StepType::Db => self.stair_value * 10f64.powf(step / 20.0),
        };
        self.stair_value = self.clamp(value);
        self.correct_counter = 0;
        debug!("{}: up to {}", self.config.name, self.stair_value);
    }

    fn decrease_value(&mut self) {
        let step = self.current_step();
        let value = match self.config.step_type {
            StepType::Linear => self.stair_value - step,
            StepType::Log => self.stair_value / 10f64.powf(step),
            StepType::Db => self.stair_value / 10f64.powf(step / 20.0),
        };
        self.stair_value = self.clamp(value);
        self.correct_counter = 0;
        debug!("{}: down to {}", self.config.name, self.stair_value);
    }

    fn clamp(&self, value: f64) -> f64 {
        let value = self.config.min_val.map_or(value, |min| value.max(min));
        self.config.max_val.map_or(value, |max| value.min(max))
    }
}

impl Staircase for StairHandler {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn add_response(&mut self, response: i64, intensity: Option<f64>, record: bool) -> Result<()> {
        let correct = ensure_binary_response(&self.config.name, response)?;
        if record {
            self.trials
                .add_data(&format!("{}.response", self.config.name), response);
        }

        self.data.push(correct as u8);
        self.values.push(intensity.unwrap_or(self.stair_value));
        self.update_counter(correct);
        self.calculate_next_intensity(correct);
        Ok(())
    }

    fn intensity(&self) -> f64 {
        self.stair_value
    }

    fn is_finished(&self) -> bool {
        self.finished()
    }

    fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    fn set_attribute(&mut self, name: &str, operand: Value, operator: &str) -> Result<bool> {
        let value = self.attributes.evaluate(name, operand, operator)?;
        self.apply_attribute(name, &value)?;
        debug!("{}: {name} set to {value}", self.config.name);
        Ok(self.attributes.store(name, value))
    }

    fn extra_args(&self) -> &Map<String, Value> {
        &self.config.extra_args
    }

    fn attach_recorder(&mut self, recorder: SharedRecorder) {
        self.trials.attach_recorder(recorder);
    }
}

impl Iterator for StairHandler {
    type Item = Condition;

    fn next(&mut self) -> Option<Condition> {
        self.next_trial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialflow_core::shared;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn contrast_stairs() -> StairConfig {
        StairConfig {
            name: "TestStair".into(),
            var_name: "contrast".into(),
            min_val: Some(0.1),
            max_val: Some(1.0),
            n_trials: 10,
            n_reversals: Some(3),
            n_up: 1,
            n_down: 3,
            step_sizes: vec![0.05],
            step_type: StepType::Linear,
            ..StairConfig::new(0.5)
        }
    }

    fn linear(start: f64, steps: Vec<f64>) -> StairConfig {
        StairConfig {
            step_sizes: steps,
            step_type: StepType::Linear,
            ..StairConfig::new(start)
        }
    }

    #[test]
    fn initial_state() {
        let mut stairs = StairHandler::new(contrast_stairs()).unwrap();
        assert_eq!(stairs.get_snapshot().n_total(), 10);
        assert_eq!(stairs.stair_value(), 0.5);
        assert_eq!(stairs.intensity(), 0.5);
        assert!(stairs.data().is_empty());
        assert!(stairs.values().is_empty());
        assert_eq!(stairs.correct_counter(), 0);
        assert_eq!(stairs.direction(), Direction::Start);
        assert!(!stairs.finished());
    }

    #[test]
    fn add_response_records_and_logs() {
        let recorder = shared(Vec::<(String, Value)>::new());
        let mut stairs = StairHandler::new(contrast_stairs()).unwrap();
        stairs.attach_recorder(recorder.clone());

        stairs.add_response(1, None, true).unwrap();
        assert_eq!(*recorder.borrow(), vec![("TestStair.response".to_string(), json!(1))]);
        assert_eq!(stairs.data(), &[1]);
        assert_eq!(stairs.values(), &[0.5]);

        stairs.add_response(0, Some(0.42), false).unwrap();
        assert_eq!(recorder.borrow().len(), 1);
        assert_eq!(stairs.values(), &[0.5, 0.42]);
    }

    #[test]
    fn responses_outside_zero_and_one_are_rejected() {
        let mut stairs = StairHandler::new(contrast_stairs()).unwrap();
        let err = stairs.add_response(2, None, true).unwrap_err();
        assert!(err.to_string().contains("the response must be either 0 or 1"));
        assert!(stairs.data().is_empty());
    }

    #[test]
    fn increase_value_adds_the_first_step() {
        let mut stairs = StairHandler::new(contrast_stairs()).unwrap();
        stairs.correct_counter = 2;
        stairs.increase_value();
        assert!(close(stairs.stair_value(), 0.55));
        assert_eq!(stairs.correct_counter(), 0);
    }

    #[test]
    fn decrease_value_subtracts_the_first_step() {
        let mut stairs = StairHandler::new(contrast_stairs()).unwrap();
        stairs.correct_counter = -1;
        stairs.decrease_value();
        assert!(close(stairs.stair_value(), 0.45));
        assert_eq!(stairs.correct_counter(), 0);
    }

    #[test]
    fn values_are_clamped() {
        let mut stairs = StairHandler::new(StairConfig {
            max_val: Some(1.0),
            min_val: Some(0.9),
            ..linear(0.95, vec![0.1])
        })
        .unwrap();
        stairs.increase_value();
        assert_eq!(stairs.stair_value(), 1.0);
        stairs.decrease_value();
        assert!(close(stairs.stair_value(), 0.9));
        stairs.decrease_value();
        assert_eq!(stairs.stair_value(), 0.9);
    }

    #[test]
    fn log_and_decibel_steps_are_multiplicative() {
        let mut db = StairHandler::new(StairConfig {
            step_sizes: vec![20.0],
            ..StairConfig::new(1.0)
        })
        .unwrap();
        db.increase_value();
        assert!(close(db.stair_value(), 10.0));

        let mut log = StairHandler::new(StairConfig {
            step_sizes: vec![1.0],
            step_type: StepType::Log,
            ..StairConfig::new(1.0)
        })
        .unwrap();
        log.decrease_value();
        assert!(close(log.stair_value(), 0.1));
    }

    #[test]
    fn initial_rule_then_three_down_one_up() {
        let mut stairs = StairHandler::new(linear(10.0, vec![2.0, 1.0])).unwrap();

        for response in [1, 1, 0, 1, 1] {
            stairs.add_response(response, None, false).unwrap();
            assert!(!stairs.finished());
        }
        stairs.add_response(1, None, false).unwrap();

        assert_eq!(stairs.values(), &[10.0, 8.0, 6.0, 7.0, 7.0, 7.0]);
        assert_eq!(stairs.reversal_intensities(), &[6.0, 7.0]);
        assert_eq!(stairs.reversal_points(), &[2, 5]);
        assert_eq!(stairs.direction(), Direction::Down);
        assert_eq!(stairs.stair_value(), 6.0);
        assert!(stairs.finished());
    }

    #[test]
    fn without_initial_rule_the_first_move_is_not_a_reversal() {
        let mut stairs = StairHandler::new(StairConfig {
            apply_initial_rule: false,
            n_reversals: Some(5),
            ..linear(10.0, vec![1.0])
        })
        .unwrap();

        for _ in 0..2 {
            stairs.add_response(1, None, false).unwrap();
            assert_eq!(stairs.stair_value(), 10.0);
            assert_eq!(stairs.direction(), Direction::Start);
        }
        stairs.add_response(1, None, false).unwrap();
        assert_eq!(stairs.stair_value(), 9.0);
        assert_eq!(stairs.direction(), Direction::Down);
        assert!(stairs.reversal_intensities().is_empty());

        stairs.add_response(0, None, false).unwrap();
        assert_eq!(stairs.stair_value(), 10.0);
        assert_eq!(stairs.direction(), Direction::Up);
        assert_eq!(stairs.reversal_intensities(), &[9.0]);
    }

    #[test]
    fn trial_budget_finishes_under_the_either_rule() {
        let mut stairs = StairHandler::new(StairConfig {
            n_trials: 3,
            n_reversals: Some(10),
            stop_rule: StopRule::ReversalsOrTrials,
            ..linear(1.0, vec![0.1])
        })
        .unwrap();
        stairs.add_response(1, None, false).unwrap();
        stairs.add_response(1, None, false).unwrap();
        assert!(!stairs.finished());
        stairs.add_response(1, None, false).unwrap();
        assert!(stairs.finished());
    }

    #[test]
    fn next_trial_presents_the_current_intensity() {
        let mut config = contrast_stairs();
        config.extra_args.insert("ori".into(), json!(90));
        let mut stairs = StairHandler::new(config).unwrap();

        let trial = stairs.next_trial().unwrap();
        assert_eq!(trial, json!({"contrast": 0.5, "ori": 90}));
        let snapshot = stairs.get_snapshot();
        assert_eq!(snapshot.current_trial(), Some(&trial));
        assert!(!snapshot.finished());
    }

    #[test]
    fn finished_staircases_stop_iterating() {
        let mut stairs = StairHandler::new(StairConfig {
            n_trials: 1,
            n_reversals: Some(1),
            stop_rule: StopRule::ReversalsOrTrials,
            ..linear(1.0, vec![0.1])
        })
        .unwrap();
        stairs.next_trial();
        let snapshot = stairs.get_snapshot();
        stairs.add_response(1, None, false).unwrap();
        assert!(stairs.finished());
        assert!(snapshot.finished());
        assert_eq!(stairs.next(), None);
    }

    #[test]
    fn invalid_configurations_fail_fast() {
        assert!(matches!(
            StairHandler::new(linear(1.0, vec![])),
            Err(Error::Configuration { .. })
        ));
        assert!(StairHandler::new(StairConfig {
            min_val: Some(2.0),
            max_val: Some(1.0),
            ..linear(1.0, vec![0.1])
        })
        .is_err());
    }

    #[test]
    fn two_up_one_down_waits_for_two_misses() {
        let mut stairs = StairHandler::new(StairConfig {
            n_up: 2,
            n_down: 1,
            apply_initial_rule: false,
            n_reversals: Some(5),
            ..linear(10.0, vec![1.0])
        })
        .unwrap();

        stairs.add_response(0, None, false).unwrap();
        assert_eq!(stairs.stair_value(), 10.0);
        assert_eq!(stairs.correct_counter(), -1);
        stairs.add_response(1, None, false).unwrap();
        assert_eq!(stairs.stair_value(), 9.0);
        assert_eq!(stairs.direction(), Direction::Down);
        stairs.add_response(0, None, false).unwrap();
        assert_eq!(stairs.stair_value(), 9.0);
        stairs.add_response(0, None, false).unwrap();

        assert_eq!(stairs.stair_value(), 10.0);
        assert_eq!(stairs.direction(), Direction::Up);
        assert_eq!(stairs.values(), &[10.0, 10.0, 9.0, 9.0]);
        assert_eq!(stairs.reversal_intensities(), &[9.0]);
        assert_eq!(stairs.reversal_points(), &[3]);
    }

    #[test]
    fn trial_index_follows_the_presentation_count() {
        let mut stairs = StairHandler::new(linear(1.0, vec![0.1])).unwrap();
        stairs.next_trial();
        stairs.next_trial();
        let snapshot = stairs.get_snapshot();
        assert_eq!(snapshot.n_total(), 0);
        assert_eq!(snapshot.this_n(), Some(1));
        assert_eq!(snapshot.this_index(), Some(1));
    }

    #[test]
    fn attributes_list_the_parameters() {
        let stairs = StairHandler::new(contrast_stairs()).unwrap();
        let attrs = stairs.attributes();
        assert_eq!(attrs.get("nDown"), Some(&json!(3)));
        assert_eq!(attrs.get("stepType"), Some(&json!("linear")));
        assert!(attrs.to_string().starts_with("StairHandler(name=TestStair"));
    }

    #[test]
    fn setting_n_down_changes_the_stepping_rule() {
        let mut stairs = StairHandler::new(StairConfig {
            apply_initial_rule: false,
            ..linear(10.0, vec![1.0])
        })
        .unwrap();
        assert!(stairs.set_attribute("nDown", json!(2), "-").unwrap());
        assert_eq!(stairs.attributes().get("nDown"), Some(&json!(1)));

        stairs.add_response(1, None, false).unwrap();
        assert_eq!(stairs.stair_value(), 9.0);
    }

    #[test]
    fn attribute_updates_are_validated_before_they_are_stored() {
        let mut stairs = StairHandler::new(linear(10.0, vec![1.0])).unwrap();

        let err = stairs.set_attribute("startVal", json!(1.0), "=").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(stairs.attributes().get("startVal"), Some(&json!(10.0)));

        assert!(stairs.set_attribute("nUp", json!(0), "=").is_err());
        assert_eq!(stairs.attributes().get("nUp"), Some(&json!(1)));

        assert!(matches!(
            stairs.set_attribute("stepSizes", json!([1, 2]), "+"),
            Err(Error::SizeMismatch { current: 1, operand: 2, .. })
        ));
        assert!(matches!(
            stairs.set_attribute("nUp", json!(1), "%"),
            Err(Error::UnsupportedOperation { .. })
        ));
        assert!(stairs.set_attribute("minVal", json!(11.0), "=").is_ok());
        assert!(stairs.set_attribute("maxVal", json!(5.0), "=").is_err());
    }

    #[test]
    fn bound_changes_clamp_and_notify() {
        use std::cell::RefCell;

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut stairs = StairHandler::new(linear(10.0, vec![1.0])).unwrap();
        let sink = Rc::clone(&seen);
        stairs.on_attribute_change("maxVal", move |value| sink.borrow_mut().push(value.clone()));

        assert!(stairs.set_attribute("maxVal", json!(9.5), "=").unwrap());
        assert!(!stairs.set_attribute("maxVal", json!(9.5), "=").unwrap());
        assert_eq!(stairs.stair_value(), 9.5);
        assert_eq!(*seen.borrow(), vec![json!(9.5)]);
    }
}
