pub mod circuit_breaker;
pub mod device;
pub mod dispatcher;
pub mod event_delivery;
pub mod inspector;
pub mod retry_config;
pub mod stream;
pub mod subscription;

pub use circuit_breaker::{
    BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSummary, WindowBucket,
};
pub use device::{Device, DeviceStatus};
pub use dispatcher::{
    LeaseRequest, LeaseResponse, LeasedDelivery, ReportAttempt, ReportRequest, ReportResponse,
};
pub use event_delivery::{
    CliMetadata, DeliveryAttempt, DeliveryMetadata, DeliveryStatus, EventDelivery, UnknownStatus,
};
pub use inspector::{ListAttemptsResponse, ListDeliveriesResponse};
pub use retry_config::RetryConfiguration;
pub use stream::{
    AckMessage, CliEvent, IngestEventRequest, IngestEventResponse, LoginRequest,
};
pub use subscription::{Event, Subscription, SubscriptionKind};
