use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use trialflow_core::ConditionList;

/// Trial ordering of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    Sequential,
    #[default]
    Random,
    FullRandom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrialHandlerConfig {
    pub name: String,
    pub trial_list: Option<ConditionList>,
    pub n_reps: usize,
    pub method: Method,
    pub seed: Option<u64>,
    pub auto_log: bool,
}

impl Default for TrialHandlerConfig {
    fn default() -> Self {
        Self {
            name: "trials".to_string(),
            trial_list: None,
            n_reps: 1,
            method: Method::Random,
            seed: None,
            auto_log: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    #[serde(alias = "lin")]
    Linear,
    Log,
    /// Steps are decibels: one step multiplies the value by `10^(step / 20)`.
    #[default]
    #[serde(alias = "dB")]
    Db,
}

/// When a staircase counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopRule {
    /// Enough reversals *and* at least `n_trials` trials.
    #[default]
    ReversalsAndTrials,
    /// Enough reversals *or* `n_trials` trials, whichever comes first.
    ReversalsOrTrials,
}

/// Up/down staircase parameters. Keys are camelCase so that a row of a
/// condition file deserialises directly; unknown keys end up in `extra_args`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StairConfig {
    #[serde(alias = "label", default = "default_stair_name")]
    pub name: String,
    #[serde(default = "default_var_name")]
    pub var_name: String,
    pub start_val: f64,
    #[serde(default)]
    pub min_val: Option<f64>,
    #[serde(default)]
    pub max_val: Option<f64>,
    #[serde(default)]
    pub n_trials: usize,
    /// Defaults to the number of step sizes.
    #[serde(default)]
    pub n_reversals: Option<usize>,
    #[serde(default = "default_n_up")]
    pub n_up: usize,
    #[serde(default = "default_n_down")]
    pub n_down: usize,
    #[serde(default = "default_true")]
    pub apply_initial_rule: bool,
    #[serde(default = "default_step_sizes", deserialize_with = "one_or_many")]
    pub step_sizes: Vec<f64>,
    #[serde(default)]
    pub step_type: StepType,
    #[serde(default)]
    pub stop_rule: StopRule,
    #[serde(flatten)]
    pub extra_args: Map<String, Value>,
}

impl StairConfig {
    pub fn new(start_val: f64) -> Self {
        Self {
            name: default_stair_name(),
            var_name: default_var_name(),
            start_val,
            min_val: None,
            max_val: None,
            n_trials: 0,
            n_reversals: None,
            n_up: default_n_up(),
            n_down: default_n_down(),
            apply_initial_rule: true,
            step_sizes: default_step_sizes(),
            step_type: StepType::default(),
            stop_rule: StopRule::default(),
            extra_args: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestMethod {
    #[default]
    Quantile,
    Mean,
    Mode,
}

/// QUEST parameters. `start_val` and `start_val_sd` are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestConfig {
    #[serde(alias = "label", default = "default_quest_name")]
    pub name: String,
    #[serde(default = "default_var_name")]
    pub var_name: String,
    pub start_val: f64,
    pub start_val_sd: f64,
    #[serde(default = "default_p_threshold")]
    pub p_threshold: f64,
    #[serde(default)]
    pub n_trials: Option<usize>,
    /// Stop once the 95% confidence interval is narrower than this.
    #[serde(default)]
    pub stop_interval: Option<f64>,
    #[serde(default)]
    pub method: QuestMethod,
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_delta")]
    pub delta: f64,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_grain")]
    pub grain: f64,
    #[serde(default)]
    pub range: Option<f64>,
    #[serde(default)]
    pub min_val: Option<f64>,
    #[serde(default)]
    pub max_val: Option<f64>,
    #[serde(flatten)]
    pub extra_args: Map<String, Value>,
}

impl QuestConfig {
    pub fn new(start_val: f64, start_val_sd: f64) -> Self {
        Self {
            name: default_quest_name(),
            var_name: default_var_name(),
            start_val,
            start_val_sd,
            p_threshold: default_p_threshold(),
            n_trials: None,
            stop_interval: None,
            method: QuestMethod::default(),
            beta: default_beta(),
            delta: default_delta(),
            gamma: default_gamma(),
            grain: default_grain(),
            range: None,
            min_val: None,
            max_val: None,
            extra_args: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StairType {
    #[default]
    Simple,
    Quest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MultiStairConfig {
    pub name: String,
    pub stair_type: StairType,
    pub conditions: ConditionList,
    pub method: Method,
    /// Trial budget handed to every staircase whose condition has none.
    pub n_trials: usize,
    pub seed: Option<u64>,
}

impl Default for MultiStairConfig {
    fn default() -> Self {
        Self {
            name: "multiStair".to_string(),
            stair_type: StairType::Simple,
            conditions: Vec::new(),
            method: Method::Random,
            n_trials: 50,
            seed: None,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(f64),
        Many(Vec<f64>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(step) => vec![step],
        OneOrMany::Many(steps) => steps,
    })
}

fn default_stair_name() -> String {
    "stairs".to_string()
}

fn default_quest_name() -> String {
    "quest".to_string()
}

fn default_var_name() -> String {
    "intensity".to_string()
}

fn default_n_up() -> usize {
    1
}

fn default_n_down() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_step_sizes() -> Vec<f64> {
    vec![4.0]
}

fn default_p_threshold() -> f64 {
    0.82
}

fn default_beta() -> f64 {
    3.5
}

fn default_delta() -> f64 {
    0.01
}

fn default_gamma() -> f64 {
    0.5
}

fn default_grain() -> f64 {
    0.01
}
