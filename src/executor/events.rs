/// Change notifications for listeners outside the engine

use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;
use crate::filter::Filter;

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureEvent {
    /// One inserted row, with the id it was stored under
    Added { type_name: String, id: String },
    /// Rows matching `filter` were updated
    Modified { type_name: String, filter: Filter },
    /// Rows matching `filter` were deleted
    Removed { type_name: String, filter: Filter },
}

impl FeatureEvent {
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Added { type_name, .. } | Self::Modified { type_name, .. } | Self::Removed { type_name, .. } => {
                type_name
            }
        }
    }
}

pub trait FeatureEventSink: Send + Sync {
    fn on_event(&self, event: &FeatureEvent);
}

#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<Arc<dyn FeatureEventSink>>>,
}

impl EventBus {
    pub fn subscribe(&self, sink: Arc<dyn FeatureEventSink>) {
        self.sinks.write().unwrap_or_else(PoisonError::into_inner).push(sink);
    }

    pub fn publish(&self, event: &FeatureEvent) {
        trace!(?event, "publishing feature event");
        for sink in self.sinks.read().unwrap_or_else(PoisonError::into_inner).iter() {
            sink.on_event(event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.sinks.read().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("EventBus").field("sinks", &count).finish()
    }
}
