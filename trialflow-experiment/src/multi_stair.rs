use crate::config::{Method, MultiStairConfig, StairType, TrialHandlerConfig};
use crate::quest::QuestHandler;
use crate::stair::StairHandler;
use crate::staircase::Staircase;
use crate::trial::{Snapshot, TrialHandler};
use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::rc::Rc;
use trialflow_core::{
    Condition, Error, Result, SharedRecorder, ensure_binary_response, with_attribute,
};

/// Interleaves several staircases within one loop.
///
/// Each pass visits every staircase that had not finished when the pass was
/// built, in construction order or shuffled. The handler finishes once no
/// staircase is left for a new pass.
pub struct MultiStairHandler {
    name: String,
    method: Method,
    staircases: Vec<Box<dyn Staircase>>,
    pass: VecDeque<usize>,
    current: Option<usize>,
    rng: StdRng,
    trials: TrialHandler,
}

impl MultiStairHandler {
    /// Builds one staircase per condition. Conditions need `startVal` and
    /// `label`, plus `startValSd` for QUEST; a missing `nTrials` is taken
    /// from the handler's config.
    pub fn new(config: MultiStairConfig) -> Result<Self> {
        let origin = format!("MultiStairHandler {}", config.name);
        let mut staircases: Vec<Box<dyn Staircase>> = Vec::with_capacity(config.conditions.len());

        for (i, condition) in config.conditions.iter().enumerate() {
            let Value::Object(fields) = condition else {
                return Err(Error::configuration(origin, format!("condition {i} is not an object")));
            };
            let mut required = vec!["startVal", "label"];
            if config.stair_type == StairType::Quest {
                required.push("startValSd");
            }
            if let Some(missing) = required.iter().find(|key| !fields.contains_key(**key)) {
                return Err(Error::configuration(
                    origin,
                    format!("condition {i} is missing the {missing} parameter"),
                ));
            }
            // `label` is the staircase name here.
            if fields.contains_key("name") {
                return Err(Error::configuration(
                    origin,
                    format!("condition {i} sets both label and name, use label only"),
                ));
            }

            let mut fields = fields.clone();
            fields
                .entry("nTrials")
                .or_insert_with(|| json!(config.n_trials));
            let fields = Value::Object(fields);

            let staircase: Box<dyn Staircase> = match config.stair_type {
                StairType::Simple => Box::new(StairHandler::new(serde_json::from_value(fields)?)?),
                StairType::Quest => Box::new(QuestHandler::new(serde_json::from_value(fields)?)?),
            };
            staircases.push(staircase);
        }

        Self::from_staircases(config.name, staircases, config.method, config.seed)
    }

    /// Interleaves prebuilt staircases.
    pub fn from_staircases(
        name: impl Into<String>,
        staircases: Vec<Box<dyn Staircase>>,
        method: Method,
        seed: Option<u64>,
    ) -> Result<Self> {
        let name = name.into();
        if staircases.is_empty() {
            return Err(Error::configuration(
                format!("MultiStairHandler {name}"),
                "at least one staircase is required",
            ));
        }

        let labels = staircases
            .iter()
            .map(|stair| json!({ "label": stair.name() }))
            .collect();
        let trials = TrialHandler::new(TrialHandlerConfig {
            name: name.clone(),
            trial_list: Some(labels),
            n_reps: 1,
            method: Method::Sequential,
            seed: None,
            auto_log: false,
        });
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        info!("{name}: interleaving {} staircase(s), {method:?} order", staircases.len());

        let mut handler = Self {
            name,
            method,
            staircases,
            pass: VecDeque::new(),
            current: None,
            rng,
            trials,
        };
        handler.next_staircase();
        Ok(handler)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn staircases(&self) -> &[Box<dyn Staircase>] {
        &self.staircases
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Staircase the next response goes to; `None` once finished.
    pub fn current_staircase(&self) -> Option<&dyn Staircase> {
        self.current.map(|i| self.staircases[i].as_ref())
    }

    pub fn intensity(&self) -> Option<f64> {
        self.current_staircase().map(|stair| stair.intensity())
    }

    pub fn finished(&self) -> bool {
        self.trials.finished()
    }

    pub fn trials(&self) -> &TrialHandler {
        &self.trials
    }

    /// Validates and logs `response`, hands it to the current staircase and
    /// moves on to the next one.
    pub fn add_response(&mut self, response: i64, intensity: Option<f64>) -> Result<()> {
        ensure_binary_response(&self.name, response)?;
        let Some(current) = self.current.filter(|_| !self.finished()) else {
            return Err(Error::Finished {
                origin: format!("MultiStairHandler {}", self.name),
            });
        };
        self.trials.add_data(&format!("{}.response", self.name), response);

        self.staircases[current].add_response(response, intensity, false)?;
        self.next_staircase();
        Ok(())
    }

    /// Presents `{..extra_args, label, intensity}` of the current staircase.
    pub fn next_trial(&mut self) -> Option<Condition> {
        let Some(current) = self.current.filter(|_| !self.finished()) else {
            self.trials.clear_trial();
            return None;
        };
        let stair = &self.staircases[current];
        let trial = with_attribute(
            &with_attribute(
                &Value::Object(stair.extra_args().clone()),
                "label",
                json!(stair.name()),
            ),
            "intensity",
            json!(stair.intensity()),
        );
        self.trials.present_at(Some(trial.clone()), current);
        Some(trial)
    }

    pub fn get_snapshot(&mut self) -> Rc<Snapshot> {
        self.trials.get_snapshot()
    }

    pub fn add_data(&self, key: &str, value: impl Into<Value>) {
        self.trials.add_data(key, value);
    }

    /// Attaches the recorder to this loop and every staircase in it.
    pub fn attach_recorder(&mut self, recorder: SharedRecorder) {
        for stair in &mut self.staircases {
            stair.attach_recorder(Rc::clone(&recorder));
        }
        self.trials.attach_recorder(recorder);
    }

    fn next_staircase(&mut self) {
        loop {
            if self.pass.is_empty() {
                self.pass = (0..self.staircases.len())
                    .filter(|&i| !self.staircases[i].is_finished())
                    .collect();
                if self.pass.is_empty() {
                    self.current = None;
                    self.trials.set_finished(true);
                    return;
                }
                if self.method != Method::Sequential {
                    self.pass.make_contiguous().shuffle(&mut self.rng);
                }
                debug!("{}: new pass {:?}", self.name, self.pass);
            }

            if let Some(next) = self.pass.pop_front() {
                if !self.staircases[next].is_finished() {
                    self.current = Some(next);
                    return;
                }
            }
        }
    }
}

impl Iterator for MultiStairHandler {
    type Item = Condition;

    fn next(&mut self) -> Option<Condition> {
        self.next_trial()
    }
}
