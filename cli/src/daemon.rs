// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon wiring: builds every component from the manifest, runs the
//! pipelines and tears everything down on shutdown.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aegis_sync_core::{
    application::{
        CommitRecordProcessor, ContinuousIngestionPipeline, IssueRecordProcessor, RecordProcessor,
    },
    domain::{
        ingestion::ResourceKind,
        knowledge::KnowledgeStore,
        repository::IngestionRecordRepository,
        sync_config::{StorageBackendKind, SyncConfigManifest},
    },
    infrastructure::{
        db::Database,
        knowledge_store::{HttpKnowledgeStore, InMemoryKnowledgeStore},
        provider_transport::HttpProviderConnector,
        repositories::{InMemoryIngestionRecordRepository, PostgresIngestionRecordRepository},
        CircuitBreakerRegistry, DomainRateLimiter, EventBus, ServiceClientRegistry,
    },
};

pub async fn run(config: SyncConfigManifest) -> Result<()> {
    config
        .validate()
        .context("Configuration validation failed")?;

    info!(
        name = %config.metadata.name,
        providers = config.spec.providers.len(),
        pipelines = config.spec.pipelines.len(),
        "AEGIS sync daemon starting"
    );

    if let Some(metrics) = config.spec.observability.as_ref().and_then(|o| o.metrics.as_ref()) {
        if metrics.enabled {
            let addr = SocketAddr::from(([0, 0, 0, 0], metrics.port));
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("Failed to install Prometheus exporter")?;
            info!("Metrics exporter listening on {}", addr);
        }
    }

    let shutdown = CancellationToken::new();
    let event_bus = EventBus::with_default_capacity();

    let breakers = Arc::new(
        CircuitBreakerRegistry::new(config.spec.circuit_breaker.clone()).with_event_bus(event_bus.clone()),
    );
    let limiter = Arc::new(DomainRateLimiter::from_config(&config.spec.rate_limiter));
    let mut background = Vec::new();
    let sweep_interval = config.spec.rate_limiter.sweep_interval();
    if !sweep_interval.is_zero() {
        background.push(limiter.clone().start_sweeper(sweep_interval, shutdown.child_token()));
    }

    let registry = Arc::new(
        ServiceClientRegistry::new(
            config.spec.providers.clone(),
            Arc::new(HttpProviderConnector::new()),
            breakers,
            limiter,
        )
        .with_event_bus(event_bus.clone()),
    );
    let registered = registry.initialize().await;
    info!(
        registered,
        configured = config.spec.providers.len(),
        "Provider discovery finished"
    );

    let store: Arc<dyn KnowledgeStore> = match &config.spec.knowledge_store.endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "Using HTTP knowledge store");
            Arc::new(HttpKnowledgeStore::new(endpoint.clone()))
        }
        None => {
            warn!("No knowledge store endpoint configured, indexing into memory only");
            Arc::new(InMemoryKnowledgeStore::new())
        }
    };

    let repository: Arc<dyn IngestionRecordRepository> = match config.spec.storage.backend {
        StorageBackendKind::Postgres => {
            let connection_string = config
                .spec
                .storage
                .connection_string
                .as_deref()
                .context("storage.connection_string is required for the postgres backend")?;
            let database = Database::new(connection_string).await?;
            database.ensure_schema().await?;
            info!("Using PostgreSQL ingestion record repository");
            Arc::new(PostgresIngestionRecordRepository::new(database.get_pool().clone()))
        }
        StorageBackendKind::InMemory => {
            warn!("Using in-memory ingestion record repository, records do not survive restarts");
            Arc::new(InMemoryIngestionRecordRepository::new())
        }
    };

    let max_chunk_chars = config.spec.knowledge_store.max_chunk_chars;
    let mut pipelines = Vec::new();
    for pipeline_config in &config.spec.pipelines {
        if !pipeline_config.enabled {
            info!(resource_kind = %pipeline_config.resource_kind, "Pipeline disabled by configuration");
            continue;
        }
        let processor: Arc<dyn RecordProcessor> = match pipeline_config.resource_kind {
            ResourceKind::Issue => Arc::new(
                IssueRecordProcessor::new(registry.clone(), store.clone(), pipeline_config.provider.clone())
                    .with_max_chunk_chars(max_chunk_chars),
            ),
            ResourceKind::Commit => Arc::new(
                CommitRecordProcessor::new(registry.clone(), store.clone(), pipeline_config.provider.clone())
                    .with_max_chunk_chars(max_chunk_chars),
            ),
        };

        let pipeline = Arc::new(
            ContinuousIngestionPipeline::new(repository.clone(), processor, pipeline_config.clone())
                .with_event_bus(event_bus.clone())
                .with_shutdown_token(shutdown.child_token()),
        );
        pipelines.push(pipeline.start());
    }

    if pipelines.is_empty() {
        warn!("No ingestion pipelines enabled");
    }
    background.extend(pipelines);

    shutdown_signal().await;
    info!("Daemon shutting down");
    shutdown.cancel();

    for result in futures::future::join_all(background).await {
        if let Err(e) = result {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("Daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
