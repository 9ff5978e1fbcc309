use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::queue::QueueConfig;
use crate::registry::MessageQueueRegistry;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<MessageQueueRegistry>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let registry = Arc::new(MessageQueueRegistry::new(QueueConfig::from(&settings.queue)));
        Self::with_registry(settings, registry)
    }

    /// Build state around an existing registry
    pub fn with_registry(settings: Settings, registry: Arc<MessageQueueRegistry>) -> Self {
        Self {
            settings: Arc::new(settings),
            registry,
            start_time: Instant::now(),
        }
    }
}
