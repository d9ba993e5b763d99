pub mod cli;
pub mod domains;
pub mod errors;
pub mod shared;
