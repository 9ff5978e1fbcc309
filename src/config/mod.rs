mod settings;

pub use settings::{
    LoggingConfig, OtelConfig, QueueSettings, ServerConfig, Settings, ShutdownSettings,
    WebSocketConfig,
};
