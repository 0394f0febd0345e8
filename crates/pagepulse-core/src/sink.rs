//! Persistent destination for flushed view events

use crate::error::CoreError;
use crate::models::ViewEvent;
use std::future::Future;
use std::sync::Arc;

/// Bulk-insert target of the event buffer.
///
/// A batch succeeds or fails as a whole; partial inserts are not handled.
/// Implementations enforce their own timeouts, the buffer imposes none.
pub trait EventSink: Send + Sync + 'static {
    /// Persist `events` in order, returning the number of rows written
    fn insert_batch(
        &self,
        events: Vec<ViewEvent>,
    ) -> impl Future<Output = Result<usize, CoreError>> + Send;
}

impl<S: EventSink> EventSink for Arc<S> {
    fn insert_batch(
        &self,
        events: Vec<ViewEvent>,
    ) -> impl Future<Output = Result<usize, CoreError>> + Send {
        (**self).insert_batch(events)
    }
}
