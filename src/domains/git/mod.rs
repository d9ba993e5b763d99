pub mod adapter;
pub mod cache;
pub mod command;
pub mod operations;

pub use adapter::GitAdapter;
pub use command::{GitOutput, run_git};
pub use operations::{MergeAttempt, ResolveSide, is_valid_branch_name, is_valid_nickname};
