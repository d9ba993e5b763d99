pub mod entity;
pub mod store;

pub use entity::{Registry, Session, ThreadType};
pub use store::RegistryStore;
