use crate::error::{Error, Result};
use log::warn;
use serde_json::{Number, Value};
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

const DISPLAY_LIMIT: usize = 50;

/// Arithmetic applied by [`AttributeSet::set`] between the stored value and
/// the operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
}

impl Operation {
    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Operation::Assign => rhs,
            Operation::Add => lhs + rhs,
            Operation::Sub => lhs - rhs,
            Operation::Mul => lhs * rhs,
            Operation::Div => lhs / rhs,
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" | "=" => Ok(Operation::Assign),
            "+" => Ok(Operation::Add),
            "-" => Ok(Operation::Sub),
            "*" => Ok(Operation::Mul),
            "/" => Ok(Operation::Div),
            other => Err(other.to_string()),
        }
    }
}

type ChangeCallback = Rc<dyn Fn(&Value)>;

/// User-visible attributes of a loop or staircase, in declaration order.
///
/// Callbacks registered with [`on_change`](Self::on_change) run after `set`
/// has changed the named attribute.
#[derive(Clone, Default)]
pub struct AttributeSet {
    owner: String,
    entries: Vec<(String, Value)>,
    callbacks: Vec<(String, ChangeCallback)>,
}

impl AttributeSet {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            entries: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn on_change(&mut self, name: &str, callback: impl Fn(&Value) + 'static) {
        self.callbacks.push((name.to_string(), Rc::new(callback)));
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Declares (or overwrites) an attribute without arithmetic.
    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Updates `name` with `operand` combined through `operator`
    /// (`""`, `"="`, `"+"`, `"-"`, `"*"`, `"/"`).
    ///
    /// Arrays combine element-wise and scalars broadcast over arrays.
    /// Returns whether the stored value changed.
    pub fn set(&mut self, name: &str, operand: Value, operator: &str) -> Result<bool> {
        let updated = self.evaluate(name, operand, operator)?;
        Ok(self.store(name, updated))
    }

    /// Stores a value produced by [`evaluate`](Self::evaluate) and runs the
    /// callbacks of `name` if it changed.
    pub fn store(&mut self, name: &str, value: Value) -> bool {
        let changed = self.get(name) != Some(&value);
        self.insert(name, value);
        if changed {
            if let Some(value) = self.get(name) {
                for (_, callback) in self.callbacks.iter().filter(|(n, _)| n == name) {
                    callback(value);
                }
            }
        }
        changed
    }

    /// The value `set` would store, without storing it.
    pub fn evaluate(&self, name: &str, operand: Value, operator: &str) -> Result<Value> {
        let operation = operator
            .parse::<Operation>()
            .map_err(|operator| Error::UnsupportedOperation {
                attribute: name.to_string(),
                operator,
            })?;

        if operand.is_null() {
            warn!(
                "setting attribute {}.{} to an undefined value",
                self.owner, name
            );
        }

        match (operation, self.get(name)) {
            (Operation::Assign, _) | (_, None) => Ok(operand),
            (_, Some(current)) => combine(name, current, &operand, operation),
        }
    }
}

fn combine(name: &str, current: &Value, operand: &Value, op: Operation) -> Result<Value> {
    let scalar = |value: &Value| {
        value.as_f64().ok_or_else(|| Error::NotNumeric {
            attribute: name.to_string(),
        })
    };

    match (current, operand) {
        (Value::Array(lhs), Value::Array(rhs)) => {
            if lhs.len() != rhs.len() {
                return Err(Error::SizeMismatch {
                    attribute: name.to_string(),
                    current: lhs.len(),
                    operand: rhs.len(),
                });
            }
            lhs.iter()
                .zip(rhs)
                .map(|(l, r)| Ok(number(op.apply(scalar(l)?, scalar(r)?))))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array)
        }
        (Value::Array(lhs), rhs) => {
            let rhs = scalar(rhs)?;
            lhs.iter()
                .map(|l| Ok(number(op.apply(scalar(l)?, rhs))))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array)
        }
        (lhs, Value::Array(rhs)) => {
            let lhs = scalar(lhs)?;
            rhs.iter()
                .map(|r| Ok(number(op.apply(lhs, scalar(r)?))))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array)
        }
        (lhs, rhs) => Ok(number(op.apply(scalar(lhs)?, scalar(rhs)?))),
    }
}

/// Keeps integral results integral so `2 * 5` stays `10`, not `10.0`.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

impl PartialEq for AttributeSet {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.entries == other.entries
    }
}

impl fmt::Debug for AttributeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeSet")
            .field("owner", &self.owner)
            .field("entries", &self.entries)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl fmt::Display for AttributeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.owner)?;
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if text.chars().count() > DISPLAY_LIMIT {
                let head: String = text.chars().take(DISPLAY_LIMIT).collect();
                write!(f, "{name}={head}~")?;
            } else {
                write!(f, "{name}={text}")?;
            }
        }
        write!(f, ")")
    }
}
