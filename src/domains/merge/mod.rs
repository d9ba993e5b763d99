pub mod audit;
pub mod service;
pub mod types;

pub use audit::{AuditLog, MergeAuditEntry};
pub use service::MergeService;
pub use types::{
    FileCategory, FileResolution, IntegrateOptions, MergeCheck, MergeOutcome, MergePreview,
    MergeStrategy, NotMergeableReason, ResolutionPolicy,
};
