// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Service Client Registry - Provider Discovery and Transparent Reconnect
//
// Owns one live handle per named provider. Handles are created by startup
// discovery or `register_local` and are only ever replaced wholesale, so a
// caller never observes a client without its descriptor.
//
// Every remote call made through `with_client` is gated by the provider's
// circuit breaker and throttled by the domain rate limiter, including the
// single retry issued after a reconnect.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::circuit::CircuitStatus;
use crate::domain::events::SyncEvent;
use crate::domain::provider::{
    ProviderClient, ProviderConnector, ProviderDescriptor, ProviderError, RemoteClientHandle,
};
use crate::domain::sync_config::ProviderConfig;
use crate::infrastructure::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::rate_limiter::DomainRateLimiter;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider '{0}' is not registered")]
    NotRegistered(String),

    #[error("Circuit open for provider '{0}'")]
    CircuitOpen(String),

    #[error("Provider '{provider}' failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: ProviderError,
    },

    /// The transport failed again after the one reconnect-and-retry.
    #[error("Provider '{provider}' still failing after reconnect: {source}")]
    RetriesExhausted {
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("Provider '{0}' is registered in-process and cannot be reconnected")]
    NotReconnectable(String),
}

impl RegistryError {
    /// Whether the caller should simply try again later.
    ///
    /// An open breaker, a saturated remote and a transport failure that was
    /// not retried all qualify. `RetriesExhausted` does not.
    pub fn is_retry_later(&self) -> bool {
        match self {
            RegistryError::CircuitOpen(_) => true,
            RegistryError::Provider { source, .. } => source.is_busy() || source.is_transport_failure(),
            _ => false,
        }
    }

    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            RegistryError::Provider { source, .. } | RegistryError::RetriesExhausted { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }

    fn after_retry(provider: &str, source: ProviderError) -> Self {
        if source.is_transport_failure() {
            RegistryError::RetriesExhausted {
                provider: provider.to_string(),
                source,
            }
        } else {
            RegistryError::Provider {
                provider: provider.to_string(),
                source,
            }
        }
    }
}

/// Registry for managing provider clients and their lifecycles
pub struct ServiceClientRegistry {
    handles: DashMap<String, RemoteClientHandle>,
    configs: HashMap<String, ProviderConfig>,
    connector: Arc<dyn ProviderConnector>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<DomainRateLimiter>,
    reconnect_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    generation: AtomicU64,
    event_bus: Option<EventBus>,
}

impl ServiceClientRegistry {
    pub fn new(
        providers: Vec<ProviderConfig>,
        connector: Arc<dyn ProviderConnector>,
        breakers: Arc<CircuitBreakerRegistry>,
        limiter: Arc<DomainRateLimiter>,
    ) -> Self {
        Self {
            handles: DashMap::new(),
            configs: providers.into_iter().map(|p| (p.name.clone(), p)).collect(),
            connector,
            breakers,
            limiter,
            reconnect_locks: DashMap::new(),
            generation: AtomicU64::new(0),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Discover every enabled provider concurrently.
    ///
    /// A provider whose connection or discovery call fails is left
    /// unregistered; the others are unaffected. Returns the number registered.
    pub async fn initialize(&self) -> usize {
        info!(configured = self.configs.len(), "Initializing service client registry");

        let mut enabled: Vec<&ProviderConfig> = Vec::new();
        for config in self.configs.values() {
            if config.enabled {
                enabled.push(config);
            } else {
                info!("Provider '{}' disabled, skipping", config.name);
            }
        }

        let results = join_all(
            enabled
                .into_iter()
                .map(|config| async move { (config, self.discover(config).await) }),
        )
        .await;

        let mut registered = 0;
        for (config, result) in results {
            match result {
                Ok(handle) => {
                    self.install(handle, false);
                    registered += 1;
                }
                Err(e) => {
                    warn!(provider = %config.name, endpoint = %config.endpoint, error = %e, "Provider discovery failed");
                    self.publish(SyncEvent::ProviderDiscoveryFailed {
                        provider: config.name.clone(),
                        reason: e.to_string(),
                        at: Utc::now(),
                    });
                }
            }
        }

        if registered == 0 && !self.configs.is_empty() {
            warn!("No providers registered - remote synchronization will be unavailable");
        }
        registered
    }

    /// Register an in-process provider. Callers use it exactly like a remote one.
    pub fn register_local(
        &self,
        provider: impl Into<String>,
        client: ProviderClient,
        descriptor: ProviderDescriptor,
    ) {
        let provider = provider.into();
        let handle = RemoteClientHandle {
            provider_id: provider,
            client,
            descriptor,
            endpoint: None,
            generation: self.next_generation(),
            connected_at: Utc::now(),
        };
        self.install(handle, false);
    }

    pub fn get_client(&self, provider: &str) -> Result<ProviderClient, RegistryError> {
        self.get_client_or_none(provider)
            .ok_or_else(|| RegistryError::NotRegistered(provider.to_string()))
    }

    pub fn get_client_or_none(&self, provider: &str) -> Option<ProviderClient> {
        self.handles.get(provider).map(|h| h.client.clone())
    }

    pub fn handle(&self, provider: &str) -> Option<RemoteClientHandle> {
        self.handles.get(provider).map(|h| h.clone())
    }

    pub fn descriptor(&self, provider: &str) -> Option<ProviderDescriptor> {
        self.handles.get(provider).map(|h| h.descriptor.clone())
    }

    pub fn registered_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Registered and not refused by its breaker. Does not take the HALF_OPEN probe.
    pub fn is_available(&self, provider: &str) -> bool {
        self.handles.contains_key(provider)
            && self.breakers.get(provider).current_state() != CircuitStatus::Open
    }

    pub fn deregister(&self, provider: &str) -> bool {
        let removed = self.handles.remove(provider).is_some();
        if removed {
            info!(provider = %provider, "Provider deregistered");
        }
        removed
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Run `operation` against the provider's current client.
    ///
    /// If the call fails at the transport level (refused, timed out or
    /// invalidated), the client is rebuilt once and `operation` is retried a
    /// single time. Both attempts are gated by the breaker and throttled by
    /// the rate limiter. A transport failure on the retry, or a failed
    /// rebuild, is reported as `RetriesExhausted`.
    pub async fn with_client<T, F, Fut>(&self, provider: &str, operation: F) -> Result<T, RegistryError>
    where
        F: Fn(ProviderClient) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let handle = self
            .handle(provider)
            .ok_or_else(|| RegistryError::NotRegistered(provider.to_string()))?;
        let breaker = self.breakers.get(provider);

        if !breaker.allow_request() {
            debug!(provider = %provider, "Call refused by open circuit");
            return Err(RegistryError::CircuitOpen(provider.to_string()));
        }
        self.throttle(&handle).await;

        let error = match operation(handle.client.clone()).await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(e) => e,
        };

        if !error.is_transport_failure() || handle.is_local() {
            record_outcome(&breaker, &error);
            return Err(RegistryError::Provider {
                provider: provider.to_string(),
                source: error,
            });
        }

        breaker.record_failure();
        warn!(provider = %provider, error = %error, "Transport failure, reconnecting once");

        if !breaker.allow_request() {
            return Err(RegistryError::CircuitOpen(provider.to_string()));
        }
        let fresh = match self.reconnect_from(provider, Some(handle.generation)).await {
            Ok(fresh) => fresh,
            Err(RegistryError::Provider { source, .. }) => {
                record_outcome(&breaker, &source);
                return Err(RegistryError::after_retry(provider, source));
            }
            Err(e) => {
                breaker.record_neutral();
                return Err(e);
            }
        };
        self.throttle(&fresh).await;

        match operation(fresh.client.clone()).await {
            Ok(value) => {
                breaker.record_success();
                info!(provider = %provider, "Retry after reconnect succeeded");
                Ok(value)
            }
            Err(e) => {
                record_outcome(&breaker, &e);
                Err(RegistryError::after_retry(provider, e))
            }
        }
    }

    /// Tear down and rebuild the provider's transport, re-running discovery.
    ///
    /// Also registers a configured provider that failed startup discovery.
    pub async fn reconnect(&self, provider: &str) -> Result<RemoteClientHandle, RegistryError> {
        let observed = self.handles.get(provider).map(|h| h.generation);
        self.reconnect_from(provider, observed).await
    }

    async fn reconnect_from(
        &self,
        provider: &str,
        observed_generation: Option<u64>,
    ) -> Result<RemoteClientHandle, RegistryError> {
        let lock = self
            .reconnect_locks
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let current = self.handle(provider);
        if let Some(current) = &current {
            if current.is_local() {
                return Err(RegistryError::NotReconnectable(provider.to_string()));
            }
            if Some(current.generation) != observed_generation {
                debug!(provider = %provider, generation = current.generation, "Already reconnected by another caller");
                return Ok(current.clone());
            }
        }

        let config = self
            .configs
            .get(provider)
            .ok_or_else(|| RegistryError::NotRegistered(provider.to_string()))?;

        match self.discover(config).await {
            Ok(handle) => {
                let generation = handle.generation;
                self.install(handle.clone(), current.is_some());
                metrics::counter!("aegis_sync_provider_reconnects_total", "provider" => provider.to_string())
                    .increment(1);
                info!(provider = %provider, generation, "Provider reconnected");
                Ok(handle)
            }
            Err(e) => {
                warn!(provider = %provider, error = %e, "Provider reconnect failed");
                self.publish(SyncEvent::ProviderReconnectFailed {
                    provider: provider.to_string(),
                    reason: e.to_string(),
                    at: Utc::now(),
                });
                Err(RegistryError::Provider {
                    provider: provider.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Connect and discover. Nothing is registered until both succeed.
    async fn discover(&self, config: &ProviderConfig) -> Result<RemoteClientHandle, ProviderError> {
        let timeout = Duration::from_secs(config.timeout_seconds);

        let client = tokio::time::timeout(timeout, self.connector.connect(config))
            .await
            .map_err(|_| ProviderError::Unavailable(format!("connect to {} timed out", config.endpoint)))??;

        let descriptor = tokio::time::timeout(timeout, client.descriptor())
            .await
            .map_err(|_| ProviderError::Unavailable(format!("discovery on {} timed out", config.endpoint)))??;

        if descriptor.kind != config.kind || client.kind() != config.kind {
            let actual = if descriptor.kind != config.kind {
                descriptor.kind
            } else {
                client.kind()
            };
            return Err(ProviderError::KindMismatch {
                expected: config.kind,
                actual,
            });
        }

        Ok(RemoteClientHandle {
            provider_id: config.name.clone(),
            client,
            descriptor,
            endpoint: Some(config.endpoint.clone()),
            generation: self.next_generation(),
            connected_at: Utc::now(),
        })
    }

    fn install(&self, handle: RemoteClientHandle, replaced: bool) {
        let provider = handle.provider_id.clone();
        let event = if replaced {
            SyncEvent::ProviderReconnected {
                provider: provider.clone(),
                generation: handle.generation,
                at: Utc::now(),
            }
        } else {
            info!(
                provider = %provider,
                kind = %handle.descriptor.kind,
                display_name = %handle.descriptor.display_name,
                local = handle.is_local(),
                "Provider registered"
            );
            SyncEvent::ProviderRegistered {
                provider: provider.clone(),
                kind: handle.descriptor.kind,
                display_name: handle.descriptor.display_name.clone(),
                local: handle.is_local(),
                at: Utc::now(),
            }
        };
        self.handles.insert(provider, handle);
        self.publish(event);
    }

    async fn throttle(&self, handle: &RemoteClientHandle) {
        if let Some(endpoint) = &handle.endpoint {
            self.limiter.acquire_url(endpoint, None).await;
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn publish(&self, event: SyncEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// A transport failure counts against the breaker. Anything else proves the
/// remote is alive and only releases a pending probe.
fn record_outcome(breaker: &CircuitBreaker, error: &ProviderError) {
    if error.counts_as_breaker_failure() {
        breaker.record_failure();
    } else {
        breaker.record_neutral();
    }
}
