pub mod lifecycle;
pub mod phase;
pub mod service;

pub use phase::{Phase, PhaseDetector};
pub use service::{
    AnnotatedSession, ListOutcome, RegisterOutcome, SessionService, service_for_cwd,
};
