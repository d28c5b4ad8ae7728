mod controller;
mod types;


pub use controller::{AggregateDefaults, SessionController};
pub(crate) use types::Session;
pub use types::{
    PowerSource, SessionEvent, SessionSnapshot, SessionStatus, StopReason, Summary, TestConfig,
    TestMode,
};
