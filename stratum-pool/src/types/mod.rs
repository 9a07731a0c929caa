//! Small value types shared across modules.

mod share_rate;

pub use share_rate::{RateBand, ShareRate};
