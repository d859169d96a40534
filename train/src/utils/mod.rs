//! Misc utilities.

mod lr_scheduler;
mod rate_counter;

pub use lr_scheduler::*;
pub use rate_counter::*;

/// The timestamp format used in file names.
pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

/// Formats a duration as `H:MM:SS`.
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}
