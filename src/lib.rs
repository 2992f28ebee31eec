mod broker;
mod error;
mod logger;
mod manager;
mod overrides;
mod profile;
mod schedule;
mod types;

pub use broker::BrokerConfig;
pub use error::{Error, Result};
pub use logger::MessageLogMode;
pub use manager::{ProfileManager, ProfileManagerBuilder};
pub use schedule::{TEMP_FALLBACK, TEMP_OFF};
pub use types::*;
