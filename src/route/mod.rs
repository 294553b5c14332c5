//! Cross-connection routing

pub mod fabric;
pub mod local;

pub use fabric::{Publish, RouteFabric, SubNotify};
pub use local::LocalFabric;
