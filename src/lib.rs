pub mod client_ip;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod input;
pub mod key_generator;
pub mod middleware;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod storage;
pub mod throttle;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigRepository, JsonConfig, ThrottleSettings};
pub use error::{ThrottleError, ThrottleResult};
pub use middleware::ThrottleState;
pub use rate_limit_config::{Limits, Preset};
pub use rate_limiter::{AttemptOutcome, RateLimiter};
pub use server::create_app;
pub use storage::{AtomicThrottleStorage, ThrottleRecord, ThrottleStorage};
pub use throttle::{KeyResolver, Role, ThrottleRequests};
