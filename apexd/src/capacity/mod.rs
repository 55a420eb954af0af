//! Capacity monitoring: time windows, budgets, session pressure

pub mod monitor;
pub mod session;

pub use monitor::{
    CapacityMode, CapacityMonitor, CapacityRestoredEvent, DailyUsage, RestorationReason, TimeWindow,
    UsageStatsProvider,
};
pub use session::{
    SessionLimitStatus, SessionRecommendation, check_session_limit, estimate_conversation_tokens, status_for,
};
