//! Background jobs.
//!
//! - **Daily Sync**: runs the default-window sync for a fixed list of
//!   spreadsheets at a configured UTC time of day.
//!
//! Jobs follow a consistent pattern:
//! 1. Configuration in its own `config` section
//! 2. Worker function that loops until the task is cancelled
//! 3. Run function that performs a single pass
//! 4. Structured result type and metrics for monitoring
//!
//! # Example
//!
//! ```toml
//! [schedule]
//! enabled = true
//! time = "06:00"
//! spreadsheet_ids = ["1AbC..."]
//! ```

mod daily_sync;

pub use daily_sync::start_daily_sync_worker;
