pub mod config;
pub mod error;
pub mod message;
pub mod peers;
pub mod processor;
pub mod store;

pub use config::*;
pub use error::*;
pub use message::*;
pub use peers::*;
pub use processor::*;
pub use store::*;
