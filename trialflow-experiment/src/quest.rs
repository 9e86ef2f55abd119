//! QUEST: Bayesian adaptive threshold estimation (Watson & Pelli, 1983).
//!
//! The threshold posterior lives on a regular grid of offsets from the
//! initial guess. Each response multiplies it by the likelihood of that
//! response under a Weibull psychometric function.

use crate::config::{QuestConfig, QuestMethod};
use crate::staircase::{AttributeReader, Staircase, check_bounds};
use crate::trial::{Snapshot, TrialHandler};
use log::debug;
use serde_json::{Map, Value, json};
use std::rc::Rc;
use trialflow_core::{
    AttributeSet, Condition, Error, Result, SharedRecorder, ensure_binary_response, with_attribute,
};

const DEFAULT_DIM: usize = 500;

/// Linear interpolation of `x` over ascending `xp`, clamped at both ends.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let last = xp.len() - 1;
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[last] {
        return fp[last];
    }
    let upper = xp.partition_point(|&v| v < x);
    let (x0, x1) = (xp[upper - 1], xp[upper]);
    let (y0, y1) = (fp[upper - 1], fp[upper]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Keeps the points where `p` strictly increases, so it can be inverted.
fn monotone_points(p: &[f64], x: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut ps = Vec::with_capacity(p.len());
    let mut xs = Vec::with_capacity(x.len());
    for (&pi, &xi) in p.iter().zip(x) {
        if ps.last().is_none_or(|&prev| pi > prev) {
            ps.push(pi);
            xs.push(xi);
        }
    }
    (ps, xs)
}

/// Grid posterior over the threshold.
#[derive(Debug, Clone)]
pub struct Quest {
    t_guess: f64,
    half: i64,
    /// Offsets from `t_guess` of each grid point.
    x: Vec<f64>,
    pdf: Vec<f64>,
    /// Likelihood tables for incorrect (0) and correct (1) responses, indexed
    /// by `intensity - threshold` in grid steps.
    s2: [Vec<f64>; 2],
    grain: f64,
    updates: usize,
}

impl Quest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        t_guess: f64,
        t_guess_sd: f64,
        p_threshold: f64,
        beta: f64,
        delta: f64,
        gamma: f64,
        grain: f64,
        range: Option<f64>,
    ) -> Self {
        let dim = match range {
            Some(range) => (2.0 * (range / grain / 2.0).ceil()).max(2.0) as usize,
            None => DEFAULT_DIM,
        };
        let half = (dim / 2) as i64;
        let dim = 2 * half;

        let x: Vec<f64> = (-half..=half).map(|i| i as f64 * grain).collect();
        let mut pdf: Vec<f64> = x
            .iter()
            .map(|xi| (-0.5 * (xi / t_guess_sd).powi(2)).exp())
            .collect();
        normalize(&mut pdf);

        let weibull = |x: f64| {
            delta * gamma + (1.0 - delta) * (1.0 - (1.0 - gamma) * (-(10f64.powf(beta * x))).exp())
        };
        let x2: Vec<f64> = (-dim..=dim).map(|i| i as f64 * grain).collect();
        let p2: Vec<f64> = x2.iter().map(|&v| weibull(v)).collect();
        let (ps, xs) = monotone_points(&p2, &x2);
        let x_threshold = interp(p_threshold, &ps, &xs);

        let p2: Vec<f64> = x2.iter().map(|&v| weibull(v + x_threshold)).collect();
        let correct: Vec<f64> = p2.iter().rev().copied().collect();
        let incorrect: Vec<f64> = p2.iter().rev().map(|p| 1.0 - p).collect();

        Self {
            t_guess,
            half,
            x,
            pdf,
            s2: [incorrect, correct],
            grain,
            updates: 0,
        }
    }

    /// Multiplies the posterior by the likelihood of `correct` at `intensity`.
    pub fn update(&mut self, intensity: f64, correct: bool) {
        let n_s2 = self.s2[0].len() as i64;
        // Offsets beyond the table all land on its edge.
        let r = ((intensity - self.t_guess) / self.grain)
            .round()
            .clamp(-(n_s2 as f64), n_s2 as f64) as i64;
        let last_j = self.pdf.len() as i64 - 1;

        // Indices run from half - r to last_j + half - r; slide them back
        // into the table when the intensity falls off the grid.
        let first = self.half - r;
        let last = last_j + self.half - r;
        let shift = if first < 0 {
            -first
        } else if last >= n_s2 {
            n_s2 - 1 - last
        } else {
            0
        };

        let table = &self.s2[correct as usize];
        for (j, p) in self.pdf.iter_mut().enumerate() {
            *p *= table[(first + j as i64 + shift) as usize];
        }
        normalize(&mut self.pdf);
        self.updates += 1;
    }

    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn mean(&self) -> f64 {
        self.t_guess + self.pdf.iter().zip(&self.x).map(|(p, x)| p * x).sum::<f64>()
    }

    pub fn sd(&self) -> f64 {
        let mean: f64 = self.pdf.iter().zip(&self.x).map(|(p, x)| p * x).sum();
        let second: f64 = self.pdf.iter().zip(&self.x).map(|(p, x)| p * x * x).sum();
        (second - mean * mean).max(0.0).sqrt()
    }

    pub fn mode(&self) -> f64 {
        let best = self
            .pdf
            .iter()
            .enumerate()
            .fold(0, |best, (i, &p)| if p > self.pdf[best] { i } else { best });
        self.t_guess + self.x[best]
    }

    /// Threshold below which the posterior holds `order` of its mass.
    pub fn quantile(&self, order: f64) -> f64 {
        let cumulative: Vec<f64> = self
            .pdf
            .iter()
            .scan(0.0, |acc, p| {
                *acc += p;
                Some(*acc)
            })
            .collect();
        let total = cumulative.last().copied().unwrap_or(0.0);
        let (ps, xs) = monotone_points(&cumulative, &self.x);
        self.t_guess + interp(order * total, &ps, &xs)
    }
}

fn normalize(pdf: &mut [f64]) {
    let total: f64 = pdf.iter().sum();
    if total > 0.0 {
        pdf.iter_mut().for_each(|p| *p /= total);
    }
}

/// QUEST staircase with the same contract as [`crate::StairHandler`].
pub struct QuestHandler {
    config: QuestConfig,
    attributes: AttributeSet,
    quest: Quest,
    trials: TrialHandler,
    next_intensity: f64,
    data: Vec<u8>,
    values: Vec<f64>,
}

impl QuestHandler {
    pub fn new(config: QuestConfig) -> Result<Self> {
        let origin = format!("QuestHandler {}", config.name);
        let check = |ok: bool, reason: &str| {
            if ok {
                Ok(())
            } else {
                Err(Error::configuration(origin.clone(), reason))
            }
        };
        check(config.start_val.is_finite(), "startVal must be a finite number")?;
        check(config.start_val_sd > 0.0, "startValSd must be positive")?;
        check(config.grain > 0.0, "grain must be positive")?;
        check(config.beta > 0.0, "beta must be positive")?;
        check((0.0..1.0).contains(&config.delta), "delta must lie in [0, 1)")?;
        check((0.0..1.0).contains(&config.gamma), "gamma must lie in [0, 1)")?;
        check(
            config.p_threshold > config.gamma && config.p_threshold < 1.0,
            "pThreshold must lie between gamma and 1",
        )?;
        check(
            config.n_trials.is_some() || config.stop_interval.is_some(),
            "either nTrials or stopInterval is required",
        )?;
        check(config.range.is_none_or(|r| r > 0.0), "range must be positive")?;

        let quest = Quest::new(
            config.start_val,
            config.start_val_sd,
            config.p_threshold,
            config.beta,
            config.delta,
            config.gamma,
            config.grain,
            config.range,
        );
        let trials = TrialHandler::adaptive(config.name.as_str(), config.n_trials.unwrap_or(0));

        Ok(Self {
            attributes: Self::declare_attributes(&config),
            next_intensity: config.start_val,
            quest,
            trials,
            data: Vec::new(),
            values: Vec::new(),
            config,
        })
    }

    fn declare_attributes(config: &QuestConfig) -> AttributeSet {
        let mut attrs = AttributeSet::new("QuestHandler");
        attrs.insert("name", config.name.as_str());
        attrs.insert("varName", config.var_name.as_str());
        attrs.insert("startVal", config.start_val);
        attrs.insert("startValSd", config.start_val_sd);
        attrs.insert("pThreshold", config.p_threshold);
        attrs.insert("nTrials", json!(config.n_trials));
        attrs.insert("stopInterval", json!(config.stop_interval));
        attrs.insert("method", json!(config.method));
        attrs.insert("beta", config.beta);
        attrs.insert("delta", config.delta);
        attrs.insert("gamma", config.gamma);
        attrs.insert("grain", config.grain);
        attrs.insert("minVal", json!(config.min_val));
        attrs.insert("maxVal", json!(config.max_val));
        attrs
    }

    /// Runs `callback` with the new value whenever `name` changes through
    /// [`Staircase::set_attribute`].
    pub fn on_attribute_change(&mut self, name: &str, callback: impl Fn(&Value) + 'static) {
        self.attributes.on_change(name, callback);
    }

    /// Only the stopping rule, the estimator and the bounds can change; the
    /// posterior grid is fixed at construction.
    fn apply_attribute(&mut self, name: &str, value: &Value) -> Result<()> {
        let origin = format!("QuestHandler {}", self.config.name);
        let reader = AttributeReader { origin: &origin, name };
        match name {
            "nTrials" => {
                let n_trials = reader.optional_count(value)?;
                if n_trials.is_none() && self.config.stop_interval.is_none() {
                    return Err(reader.invalid("either nTrials or stopInterval is required"));
                }
                self.config.n_trials = n_trials;
                self.trials.replan(n_trials.unwrap_or(0));
            }
            "stopInterval" => {
                let interval = reader.optional_number(value)?;
                if interval.is_some_and(|i| i <= 0.0) {
                    return Err(reader.invalid("must be positive"));
                }
                if interval.is_none() && self.config.n_trials.is_none() {
                    return Err(reader.invalid("either nTrials or stopInterval is required"));
                }
                self.config.stop_interval = interval;
            }
            "method" => {
                self.config.method = serde_json::from_value(value.clone())
                    .map_err(|_| reader.invalid("expected quantile, mean or mode"))?;
                if self.quest.updates() > 0 {
                    self.next_intensity = self.estimate();
                }
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
                self.next_intensity = self.clamp(self.next_intensity);
            }
            _ => return Err(reader.fixed()),
        }
        Ok(())
    }

    pub fn quest_value(&self) -> f64 {
        self.next_intensity
    }

    pub fn mean(&self) -> f64 {
        self.quest.mean()
    }

    pub fn mode(&self) -> f64 {
        self.quest.mode()
    }

    pub fn sd(&self) -> f64 {
        self.quest.sd()
    }

    pub fn quantile(&self, order: f64) -> f64 {
        self.quest.quantile(order)
    }

    /// 95% credible interval of the threshold.
    pub fn confidence_interval(&self) -> (f64, f64) {
        (self.quest.quantile(0.025), self.quest.quantile(0.975))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn finished(&self) -> bool {
        self.trials.finished()
    }

    pub fn next_trial(&mut self) -> Option<Condition> {
        if self.finished() {
            self.trials.clear_trial();
            return None;
        }
        let trial = with_attribute(
            &Value::Object(self.config.extra_args.clone()),
            &self.config.var_name,
            json!(self.next_intensity),
        );
        self.trials.present(Some(trial.clone()));
        Some(trial)
    }

    pub fn get_snapshot(&mut self) -> Rc<Snapshot> {
        self.trials.get_snapshot()
    }

    fn estimate(&self) -> f64 {
        let estimate = match self.config.method {
            QuestMethod::Quantile => self.quest.quantile(0.5),
            QuestMethod::Mean => self.quest.mean(),
            QuestMethod::Mode => self.quest.mode(),
        };
        self.clamp(estimate)
    }

    fn clamp(&self, value: f64) -> f64 {
        let value = self.config.min_val.map_or(value, |min| value.max(min));
        self.config.max_val.map_or(value, |max| value.min(max))
    }

    fn check_finished(&mut self) {
        let budget_spent = self
            .config
            .n_trials
            .is_some_and(|n| self.values.len() >= n);
        let converged = self.config.stop_interval.is_some_and(|interval| {
            let (low, high) = self.confidence_interval();
            high - low < interval
        });
        if budget_spent || converged {
            self.trials.set_finished(true);
        }
    }
}

impl Staircase for QuestHandler {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn add_response(&mut self, response: i64, intensity: Option<f64>, record: bool) -> Result<()> {
        let correct = ensure_binary_response(&self.config.name, response)?;
        if record {
            self.trials
                .add_data(&format!("{}.response", self.config.name), response);
        }

        let tested = intensity.unwrap_or(self.next_intensity);
        self.data.push(correct as u8);
        self.values.push(tested);
        self.quest.update(tested, correct);
        self.next_intensity = self.estimate();
        debug!(
            "{}: response {response} at {tested}, next {} (sd {:.4})",
            self.config.name,
            self.next_intensity,
            self.quest.sd()
        );
        self.check_finished();
        Ok(())
    }

    fn intensity(&self) -> f64 {
        self.next_intensity
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

impl Iterator for QuestHandler {
    type Item = Condition;

    fn next(&mut self) -> Option<Condition> {
        self.next_trial()
    }
}
