pub mod block;
pub mod store;

pub use store::{Store, StoreError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
