//! Data models for pagepulse

pub mod view_event;

pub use view_event::{format_created_at, ColumnLimits, ViewEvent, CREATED_AT_FORMAT};
