//! Session lifecycle management: activity tracking, idle expiry, capacity
//! limits, and the periodic cleanup sweep.

mod manager;

pub use manager::{Session, SessionConfig, SessionManager, SessionMetrics};
