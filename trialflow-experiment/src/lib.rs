pub mod config;
pub mod experiment;
pub mod multi_stair;
pub mod quest;
pub mod scheduler;
pub mod stair;
pub mod staircase;
pub mod trial;
pub use config::{
    Method, MultiStairConfig, QuestConfig, QuestMethod, StairConfig, StairType, StepType, StopRule,
    TrialHandlerConfig,
};
pub use experiment::ExperimentHandler;
pub use multi_stair::MultiStairHandler;
pub use quest::{Quest, QuestHandler};
pub use scheduler::{Conditional, Event, Scheduler, Session, Status, StepFn, StopHandle, Task};
pub use stair::StairHandler;
pub use staircase::{Direction, Staircase};
pub use trial::{Snapshot, TrialHandler, build_sequence};
