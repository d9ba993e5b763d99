pub mod bootstrapper;

pub use bootstrapper::{CreateWorktreeConfig, WorktreeBootstrapper};
