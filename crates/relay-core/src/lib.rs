pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RelayConfig;
pub use types::*;
