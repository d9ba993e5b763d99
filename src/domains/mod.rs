pub mod git;
pub mod locks;
pub mod merge;
pub mod registry;
pub mod sessions;
