pub mod paths;

pub use paths::StateLayout;
