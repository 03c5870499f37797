pub mod behavior;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod events;
pub mod pool;
pub mod session;
pub mod store;

pub use behavior::{BehaviorEngine, BehaviorError};
pub use config::{
    load_mirage_config, BehaviorSection, DeviceSection, DriverSection, MirageConfig,
    ObservabilitySection, PoolSection,
};
pub use device::{DeviceClass, DeviceError, DeviceProfile, DeviceRegistry};
pub use driver::{BrowserContext, BrowserDriver, ChromiumDriver, DriverError, PageLink};
pub use error::{ConfigError, Result};
pub use events::{BroadcastSink, EventBus, EventPayload, EventSink, LogSink, SessionEvent, SinkError};
pub use pool::{HealthState, PoolError, ProxyPool, ProxyStats, RotationPolicy};
pub use session::{
    Orchestrator, SessionError, SessionRecord, SessionRequest, SessionState, SessionTarget,
};
pub use store::{SessionSummary, SqliteEventStore, StoreError, StoreStatistics};
