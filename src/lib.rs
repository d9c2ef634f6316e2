pub mod config;
pub mod credentials;
pub mod error;
pub mod pipeline;

pub use error::{Result, SinkError, StatusCode};
