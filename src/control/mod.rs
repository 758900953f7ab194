pub mod service;
pub mod session;

pub use service::{ControlService, SharedControl, Transition};
