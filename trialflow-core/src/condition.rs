use serde_json::{Map, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// One row of a condition file: usually an object of key/value pairs,
/// `Value::Null` when a loop runs without conditions.
pub type Condition = Value;

/// Ordered conditions a loop iterates over.
pub type ConditionList = Vec<Condition>;

/// Sink for trial-level data (`"<loop>.response"`, reaction times, ...).
pub trait DataRecorder {
    fn add_data(&mut self, key: &str, value: Value);
}

/// Loops and staircases hold the recorder through a shared handle; everything
/// runs on the scheduler's single call stack.
pub type SharedRecorder = Rc<RefCell<dyn DataRecorder>>;

pub fn shared<R: DataRecorder + 'static>(recorder: R) -> Rc<RefCell<R>> {
    Rc::new(RefCell::new(recorder))
}

/// Plain list of recorded pairs, handy for headless sessions.
impl DataRecorder for Vec<(String, Value)> {
    fn add_data(&mut self, key: &str, value: Value) {
        self.push((key.to_string(), value));
    }
}

/// An absent or empty list becomes a single "no condition" placeholder.
pub fn normalize_conditions(conditions: Option<ConditionList>) -> ConditionList {
    match conditions {
        Some(list) if !list.is_empty() => list,
        _ => vec![Value::Null],
    }
}

/// Returns `condition` with `key` set to `value`. Non-object conditions are
/// replaced by a fresh object.
pub fn with_attribute(condition: &Condition, key: &str, value: Value) -> Condition {
    let mut fields = match condition {
        Value::Object(fields) => fields.clone(),
        _ => Map::new(),
    };
    fields.insert(key.to_string(), value);
    Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_or_missing_lists_get_a_placeholder() {
        assert_eq!(normalize_conditions(None), vec![Value::Null]);
        assert_eq!(normalize_conditions(Some(vec![])), vec![Value::Null]);
        let list = vec![json!({"cond": "A"})];
        assert_eq!(normalize_conditions(Some(list.clone())), list);
    }

    #[test]
    fn with_attribute_merges_into_objects() {
        let merged = with_attribute(&json!({"label": "S1"}), "intensity", json!(0.3));
        assert_eq!(merged, json!({"label": "S1", "intensity": 0.3}));
        assert_eq!(
            with_attribute(&Value::Null, "intensity", json!(1)),
            json!({"intensity": 1})
        );
    }

    #[test]
    fn vec_recorder_keeps_order() {
        let recorder = shared(Vec::<(String, Value)>::new());
        let handle: SharedRecorder = recorder.clone();
        handle.borrow_mut().add_data("a", json!(1));
        handle.borrow_mut().add_data("b", json!(2));
        let rows = recorder.borrow();
        assert_eq!(rows[0], ("a".to_string(), json!(1)));
        assert_eq!(rows[1].0, "b");
    }
}
