use serde_json::{Map, Value};
use trialflow_core::{AttributeSet, Error, Result, SharedRecorder};

/// Direction of the last intensity change of a staircase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Start,
    Up,
    Down,
}

/// What an interleaved loop needs from an adaptive procedure.
pub trait Staircase {
    fn name(&self) -> &str;

    /// Feeds a 0/1 response back. `intensity` overrides the value that was
    /// actually tested; `record` logs `"<name>.response"` to the recorder.
    fn add_response(&mut self, response: i64, intensity: Option<f64>, record: bool) -> Result<()>;

    /// Intensity to present on the next trial.
    fn intensity(&self) -> f64;

    fn is_finished(&self) -> bool;

    /// User-visible parameters, in declaration order.
    fn attributes(&self) -> &AttributeSet;

    /// Updates a parameter through [`AttributeSet::set`] and applies it to the
    /// running procedure. Parameters fixed at construction are rejected.
    fn set_attribute(&mut self, name: &str, operand: Value, operator: &str) -> Result<bool>;

    /// Condition keys that are not staircase parameters, passed through to trials.
    fn extra_args(&self) -> &Map<String, Value>;

    fn attach_recorder(&mut self, recorder: SharedRecorder);
}

/// Reads attribute values back into typed parameters.
pub(crate) struct AttributeReader<'a> {
    pub origin: &'a str,
    pub name: &'a str,
}

impl AttributeReader<'_> {
    pub fn invalid(&self, reason: &str) -> Error {
        Error::configuration(self.origin, format!("{}: {reason}", self.name))
    }

    pub fn count(&self, value: &Value) -> Result<usize> {
        value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| self.invalid("expected a non-negative integer"))
    }

    pub fn positive_count(&self, value: &Value) -> Result<usize> {
        match self.count(value)? {
            0 => Err(self.invalid("must be at least 1")),
            n => Ok(n),
        }
    }

    pub fn optional_count(&self, value: &Value) -> Result<Option<usize>> {
        match value {
            Value::Null => Ok(None),
            other => self.count(other).map(Some),
        }
    }

    pub fn optional_number(&self, value: &Value) -> Result<Option<f64>> {
        match value {
            Value::Null => Ok(None),
            other => other
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid("expected a number or null")),
        }
    }

    pub fn numbers(&self, value: &Value) -> Result<Vec<f64>> {
        let numbers = match value {
            Value::Array(items) => items.iter().map(Value::as_f64).collect::<Option<Vec<_>>>(),
            other => other.as_f64().map(|n| vec![n]),
        };
        match numbers {
            Some(numbers) if !numbers.is_empty() => Ok(numbers),
            _ => Err(self.invalid("expected one or more numbers")),
        }
    }

    pub fn fixed(&self) -> Error {
        self.invalid("cannot change after construction")
    }
}

/// `min <= max` whenever both bounds are set.
pub(crate) fn check_bounds(reader: &AttributeReader<'_>, min: Option<f64>, max: Option<f64>) -> Result<()> {
    match (min, max) {
        (Some(min), Some(max)) if min > max => {
            Err(reader.invalid(&format!("minVal {min} exceeds maxVal {max}")))
        }
        _ => Ok(()),
    }
}
