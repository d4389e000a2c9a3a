// Core of the room booking service: admission, rate limiting and dependency protection

// Domain types and errors
pub mod booking;
pub mod error;

// Resilience primitives shared by every handler
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod rate_limiter;
pub mod registry;

// Booking admission and the request layer in front of it
pub mod dependency;
pub mod engine;
pub mod service;
pub mod store;

// In-process users and rooms services for tests and benchmarks
pub mod mock_services;

// Re-export key types for convenience
pub use booking::{Booking, BookingId, BookingStatus, Permission, SlotChange, TimeSlot};
pub use circuit_breaker::{CallError, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigProvider, EnvProvider, LayeredProvider, SecretStoreProvider, ServiceConfig};
pub use engine::BookingAvailabilityEngine;
pub use error::{BookingError, ErrorBody, ErrorKind, RetryHint};
pub use rate_limiter::{CallerId, RateKey, RateLimiter, RouteClass};
pub use registry::ResilienceRegistry;
pub use service::{BookingService, CreateBookingRequest, RequestContext};
pub use store::{BookingStore, InMemoryBookingStore};
