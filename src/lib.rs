pub mod config;
pub mod error;
pub mod models;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod unified;

pub use error::{Error, Result};
pub use models::Protocol;
pub use protocol::{NativeEvent, Registry, Transcoder};
