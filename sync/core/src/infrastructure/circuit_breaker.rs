// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Circuit Breaker
//!
//! Per-remote-service failure-tripped gate.
//!
//! ```text
//!   CLOSED ──threshold failures──▶ OPEN ──open_duration elapsed──▶ HALF_OPEN
//!     ▲                              ▲                                 │
//!     └────────── probe success ─────┼─────────────────────────────────┤
//!                                    └────────── probe failure ────────┘
//! ```
//!
//! State lives in atomics. The OPEN→HALF_OPEN move is a compare-and-set on
//! the status word and the single HALF_OPEN probe slot is a second
//! compare-and-set, so concurrent callers agree on exactly one probe.
//!
//! The probe slot is a lease stamped when taken. A probe whose outcome is
//! never recorded (its caller panicked or was cancelled) forfeits the slot
//! once `open_duration` has passed, and the next caller probes instead.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Fast local refusal of calls to a failing remote

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::circuit::{CircuitSnapshot, CircuitStatus};
use crate::domain::events::SyncEvent;
use crate::domain::sync_config::CircuitBreakerConfig;
use crate::infrastructure::event_bus::EventBus;

const NOT_OPENED: u64 = 0;
const NO_PROBE: u64 = 0;

pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    status: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Micros since `epoch`, plus one. Zero means unset.
    opened_at: AtomicU64,
    /// Wall-clock millis of `opened_at`, for snapshots only.
    opened_at_wall: AtomicI64,
    /// Micros since `epoch`, plus one, at which the probe was handed out.
    probe_taken_at: AtomicU64,
    epoch: Instant,
    event_bus: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            status: AtomicU8::new(CircuitStatus::Closed.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            opened_at: AtomicU64::new(NOT_OPENED),
            opened_at_wall: AtomicI64::new(0),
            probe_taken_at: AtomicU64::new(NO_PROBE),
            epoch: Instant::now(),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether a call may proceed right now.
    ///
    /// CLOSED always admits. OPEN refuses without I/O until `open_duration`
    /// has elapsed, after which the breaker moves to HALF_OPEN and admits
    /// exactly one probe until that probe's outcome is recorded or its
    /// lease runs out.
    pub fn allow_request(&self) -> bool {
        match self.load_status() {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => {
                if !self.open_elapsed() {
                    return false;
                }
                self.try_half_open();
                self.try_take_probe()
            }
            CircuitStatus::HalfOpen => self.try_take_probe(),
        }
    }

    /// Current status. An OPEN breaker that has aged past `open_duration` is
    /// observed (and moved) as HALF_OPEN; the probe slot is not consumed.
    pub fn current_state(&self) -> CircuitStatus {
        let status = self.load_status();
        if status == CircuitStatus::Open && self.open_elapsed() {
            self.try_half_open();
            return self.load_status();
        }
        status
    }

    pub fn record_success(&self) {
        let previous = CircuitStatus::from_u8(
            self.status.swap(CircuitStatus::Closed.as_u8(), Ordering::AcqRel),
        );
        let failures = self.consecutive_failures.swap(0, Ordering::AcqRel);
        self.opened_at.store(NOT_OPENED, Ordering::Release);
        self.opened_at_wall.store(0, Ordering::Release);
        self.release_probe();

        if previous != CircuitStatus::Closed {
            info!(
                provider = %self.service,
                from = %previous,
                previous_failures = failures,
                "Circuit breaker closed"
            );
            self.emit(previous, CircuitStatus::Closed, 0);
        }
    }

    pub fn record_failure(&self) {
        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);

        match self.load_status() {
            CircuitStatus::HalfOpen => {
                // Re-stamp before publishing OPEN so an aged stamp is never visible.
                self.stamp_opened();
                if self.cas_status(CircuitStatus::HalfOpen, CircuitStatus::Open) {
                    self.release_probe();
                    warn!(
                        provider = %self.service,
                        consecutive_failures = failures,
                        "Circuit breaker probe failed, re-opening"
                    );
                    self.emit(CircuitStatus::HalfOpen, CircuitStatus::Open, failures);
                }
            }
            CircuitStatus::Closed if failures >= self.config.failure_threshold => {
                if self.cas_status(CircuitStatus::Closed, CircuitStatus::Open) {
                    self.stamp_opened();
                    warn!(
                        provider = %self.service,
                        consecutive_failures = failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker tripped"
                    );
                    self.emit(CircuitStatus::Closed, CircuitStatus::Open, failures);
                }
            }
            _ => {}
        }
    }

    /// Outcome that says nothing about the remote's health (e.g. Busy).
    /// Releases a HALF_OPEN probe slot so the next caller can probe.
    pub fn record_neutral(&self) {
        if self.load_status() == CircuitStatus::HalfOpen {
            self.release_probe();
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let status = self.current_state();
        let wall = self.opened_at_wall.load(Ordering::Acquire);
        let opened_at: Option<DateTime<Utc>> = if status == CircuitStatus::Closed || wall == 0 {
            None
        } else {
            Utc.timestamp_millis_opt(wall).single()
        };

        CircuitSnapshot {
            service: self.service.clone(),
            status,
            consecutive_failures: self.consecutive_failures(),
            opened_at,
        }
    }

    fn load_status(&self) -> CircuitStatus {
        CircuitStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn cas_status(&self, from: CircuitStatus, to: CircuitStatus) -> bool {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_half_open(&self) {
        if self.cas_status(CircuitStatus::Open, CircuitStatus::HalfOpen) {
            self.release_probe();
            let failures = self.consecutive_failures();
            info!(
                provider = %self.service,
                consecutive_failures = failures,
                "Circuit breaker half-open, allowing probe"
            );
            self.emit(CircuitStatus::Open, CircuitStatus::HalfOpen, failures);
        }
    }

    fn try_take_probe(&self) -> bool {
        let now = self.now_stamp();
        let lease = self.config.open_duration().as_micros() as u64;
        let mut holder = self.probe_taken_at.load(Ordering::Acquire);
        loop {
            if holder != NO_PROBE && now.saturating_sub(holder) < lease {
                return false;
            }
            match self
                .probe_taken_at
                .compare_exchange(holder, now, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if holder != NO_PROBE {
                        warn!(
                            provider = %self.service,
                            "Circuit breaker probe lease expired without an outcome, re-offering"
                        );
                    }
                    return true;
                }
                Err(current) => holder = current,
            }
        }
    }

    fn release_probe(&self) {
        self.probe_taken_at.store(NO_PROBE, Ordering::Release);
    }

    fn now_stamp(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64 + 1
    }

    fn stamp_opened(&self) {
        self.opened_at.store(self.now_stamp(), Ordering::Release);
        self.opened_at_wall
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    fn open_elapsed(&self) -> bool {
        let stamp = self.opened_at.load(Ordering::Acquire);
        if stamp == NOT_OPENED {
            return false;
        }
        let now = self.now_stamp();
        let open_for = self.config.open_duration().as_micros() as u64;
        now.saturating_sub(stamp) >= open_for
    }

    fn emit(&self, from: CircuitStatus, to: CircuitStatus, consecutive_failures: u32) {
        metrics::counter!(
            "aegis_sync_circuit_transitions_total",
            "provider" => self.service.clone(),
            "to" => to.as_str()
        )
        .increment(1);

        if let Some(bus) = &self.event_bus {
            bus.publish(SyncEvent::CircuitTransitioned {
                provider: self.service.clone(),
                from,
                to,
                consecutive_failures,
                at: Utc::now(),
            });
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("status", &self.load_status())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

/// One breaker per named remote service, created CLOSED on first use
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
    event_bus: Option<EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return existing.clone();
        }
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(service, self.config.clone());
                Arc::new(match &self.event_bus {
                    Some(bus) => breaker.with_event_bus(bus.clone()),
                    None => breaker,
                })
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<CircuitSnapshot> =
            self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }
}
