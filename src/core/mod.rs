//! The execution/processing core: categorization, rendering, batched
//! dispatch, the execution state machine, and the access-control reconciler.

pub mod categorize;
pub mod dispatch;
pub mod orchestrator;
pub mod reconciler;
pub mod render;

pub use dispatch::Dispatcher;
pub use orchestrator::Orchestrator;
pub use reconciler::Reconciler;

use chrono::{FixedOffset, NaiveDate, Utc};

/// Fixed service timezone (UTC-3). Calendar-day decisions — categorization,
/// throttling, the daily trigger — are all taken against this offset.
pub const SERVICE_UTC_OFFSET_HOURS: i32 = -3;

/// The service timezone as a chrono offset.
pub fn service_offset() -> FixedOffset {
    // -3h is always a representable offset.
    FixedOffset::east_opt(SERVICE_UTC_OFFSET_HOURS * 3600).expect("valid fixed offset")
}

/// Today's calendar date in the service timezone.
pub fn service_today() -> NaiveDate {
    Utc::now().with_timezone(&service_offset()).date_naive()
}
