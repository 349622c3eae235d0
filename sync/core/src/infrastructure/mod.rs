// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod circuit_breaker;
pub mod db;
pub mod event_bus;
pub mod knowledge_store;
pub mod provider_transport;
pub mod rate_limiter;
pub mod registry;
pub mod repositories;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
pub use event_bus::{EventBus, EventBusError, EventReceiver};
pub use rate_limiter::{is_internal_domain, DomainRateLimiter};
pub use registry::{RegistryError, ServiceClientRegistry};
