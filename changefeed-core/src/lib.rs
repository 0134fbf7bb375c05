pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod source;

pub use config::Config;
pub use error::{Error, Result};
pub use models::{ChangeEvent, Operation, Row};
pub use source::{ChangeSource, ChannelSource, PgNotifySource};
