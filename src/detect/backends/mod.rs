pub mod schedule;

pub use schedule::{ScheduleBackend, ScheduleWindow};
