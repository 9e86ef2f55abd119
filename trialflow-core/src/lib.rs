pub mod attribute;
pub mod condition;
pub mod error;

pub use attribute::{AttributeSet, Operation};
pub use condition::{
    Condition, ConditionList, DataRecorder, SharedRecorder, normalize_conditions, shared,
    with_attribute,
};
pub use error::{Error, Result, ensure_binary_response};
