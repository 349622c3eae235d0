// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Rate Limiter
//!
//! Token-bucket admission control keyed by remote host. Each bucket enforces
//! a per-second and a per-minute ceiling at the same time (two `governor`
//! direct limiters). Buckets are created on first use and evicted once idle
//! for longer than the configured TTL.
//!
//! Rate limiting never fails a call. The worst case is added latency.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Backpressure towards rate-capped remotes

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::sync_config::{RateLimitConfig, RateLimiterConfig};

struct RateBucket {
    config: RateLimitConfig,
    per_second: Option<DefaultDirectRateLimiter>,
    per_minute: Option<DefaultDirectRateLimiter>,
    last_access: Mutex<Instant>,
}

impl RateBucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            per_second: NonZeroU32::new(config.max_requests_per_second)
                .map(|n| RateLimiter::direct(Quota::per_second(n))),
            per_minute: NonZeroU32::new(config.max_requests_per_minute)
                .map(|n| RateLimiter::direct(Quota::per_minute(n))),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }
}

pub struct DomainRateLimiter {
    buckets: DashMap<String, Arc<RateBucket>>,
    defaults: RateLimitConfig,
    ttl: Duration,
    internal_domains: Vec<String>,
}

impl DomainRateLimiter {
    pub fn new(defaults: RateLimitConfig, ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            defaults,
            ttl,
            internal_domains: Vec::new(),
        }
    }

    pub fn from_config(config: &RateLimiterConfig) -> Self {
        Self::new(config.defaults, config.ttl()).with_internal_domains(config.internal_domains.clone())
    }

    /// First-party host suffixes that bypass limiting
    pub fn with_internal_domains(mut self, domains: Vec<String>) -> Self {
        self.internal_domains = domains
            .into_iter()
            .map(|d| normalize_host(&d))
            .filter(|d| !d.is_empty())
            .collect();
        self
    }

    /// Wait until `domain` may be called. Returns how long the caller waited.
    ///
    /// `override_config` replaces the default ceilings for this domain; a
    /// disabled override skips the wait entirely.
    pub async fn acquire(&self, domain: &str, override_config: Option<&RateLimitConfig>) -> Duration {
        let config = override_config.copied().unwrap_or(self.defaults);
        if !config.enabled || is_internal_domain(domain, &self.internal_domains) {
            return Duration::ZERO;
        }

        let key = normalize_host(domain);
        let bucket = self.bucket_for(&key, config);

        // Governor runs on the real clock.
        let started = std::time::Instant::now();
        if let Some(limiter) = &bucket.per_minute {
            limiter.until_ready().await;
        }
        if let Some(limiter) = &bucket.per_second {
            limiter.until_ready().await;
        }
        let waited = started.elapsed();
        bucket.touch();

        metrics::histogram!("aegis_sync_rate_limit_wait_seconds", "domain" => key.clone())
            .record(waited.as_secs_f64());
        if waited >= Duration::from_millis(1) {
            debug!(domain = %key, waited_ms = waited.as_millis() as u64, "Rate limited call");
        }
        waited
    }

    /// Like `acquire`, keyed by the host of `url`. Unparseable URLs are not limited.
    pub async fn acquire_url(&self, url: &str, override_config: Option<&RateLimitConfig>) -> Duration {
        match url::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) {
            Some(host) => self.acquire(&host, override_config).await,
            None => Duration::ZERO,
        }
    }

    /// Drop buckets idle for longer than the TTL. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let before = self.buckets.len();
        let ttl = self.ttl;
        self.buckets.retain(|_, bucket| bucket.idle_for() <= ttl);
        let evicted = before.saturating_sub(self.buckets.len());
        metrics::gauge!("aegis_sync_rate_buckets").set(self.buckets.len() as f64);
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.buckets.contains_key(&normalize_host(domain))
    }

    /// Periodic eviction sweep, stopped by `token`
    pub fn start_sweeper(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_seconds = interval.as_secs(),
                ttl_seconds = self.ttl.as_secs(),
                "Starting rate bucket sweeper"
            );
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let evicted = self.evict_expired();
                        if evicted > 0 {
                            debug!(evicted, remaining = self.bucket_count(), "Evicted idle rate buckets");
                        }
                    }
                    _ = token.cancelled() => {
                        info!("Shutdown signal received, stopping rate bucket sweeper");
                        break;
                    }
                }
            }
        })
    }

    fn bucket_for(&self, key: &str, config: RateLimitConfig) -> Arc<RateBucket> {
        let bucket = {
            let mut entry = self
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(RateBucket::new(config)));
            // Expired buckets are recreated lazily even between sweeps.
            if entry.config != config || entry.idle_for() > self.ttl {
                *entry = Arc::new(RateBucket::new(config));
            }
            entry.touch();
            entry.clone()
        };
        metrics::gauge!("aegis_sync_rate_buckets").set(self.buckets.len() as f64);
        bucket
    }
}

/// Lowercased host with any port and trailing dot removed
fn normalize_host(domain: &str) -> String {
    let trimmed = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if let Some(rest) = trimmed.strip_prefix('[') {
        // [::1]:8080
        return rest.split(']').next().unwrap_or_default().to_string();
    }
    match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host.to_string()
        }
        _ => trimmed,
    }
}

/// Whether `domain` is a first-party endpoint that is never rate limited.
///
/// Matches loopback names and addresses, the `.internal` and `.local`
/// suffixes, and every configured suffix (exact host or any subdomain).
pub fn is_internal_domain(domain: &str, extra_suffixes: &[String]) -> bool {
    let host = normalize_host(domain);
    if host.is_empty() {
        return false;
    }
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }
    if host.ends_with(".internal") || host.ends_with(".local") {
        return true;
    }
    extra_suffixes.iter().any(|suffix| {
        let suffix = suffix.trim_start_matches('.');
        !suffix.is_empty()
            && (host == suffix
                || (host.len() > suffix.len()
                    && host.ends_with(suffix)
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'))
    })
}
