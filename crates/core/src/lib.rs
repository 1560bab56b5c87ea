pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod record;
pub mod result;
pub mod statistics;

pub use classify::{classify, classify_message, is_retryable};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TallyConfig;
pub use error::*;
pub use record::*;
pub use result::*;
pub use statistics::*;
