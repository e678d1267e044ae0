//! `fieldvault` daemon entry point.
//!
//! The daemon owns the key lifecycle for the encryption core: it keeps the
//! KMS keys on their rotation schedule, sweeps expired data keys out of
//! memory, and scrubs every cached key on shutdown.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise telemetry (JSON logs, optional OTLP).
//! 3. Build the KMS backend.
//! 4. Load the sensitivity registry and report misconfigured fields.
//! 5. Build the key provider and the audit pipeline.
//! 6. Spawn background tasks: cache sweeper, key rotation.
//! 7. Wait for ctrl-c, then scrub the key cache.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use fieldvault::audit::{self, AuditSink, ChannelAuditSink, FanoutAuditSink, MetricsAuditSink, TracingAuditSink};
use fieldvault::aws::{AwsClients, AwsKms};
use fieldvault::config::{Config, KmsBackend};
use fieldvault::dek::{self, KeyCache, KeyProvider, KeyRotator};
use fieldvault::kms::{KeyManagementService, LocalKms};
use fieldvault::registry::SensitivityRegistry;
use fieldvault::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    let telemetry =
        telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        kms_backend = ?cfg.kms_backend,
        otlp = telemetry.is_exporting(),
        "fieldvault starting"
    );

    // -----------------------------------------------------------------------
    // 3. KMS backend
    // -----------------------------------------------------------------------
    let key_ids = cfg.kms_key_ids();
    let kms: Arc<dyn KeyManagementService> = match cfg.kms_backend {
        KmsBackend::Aws => {
            let aws = AwsClients::init(cfg.aws_endpoint_url.as_deref()).await?;
            Arc::new(AwsKms::new(&aws))
        }
        KmsBackend::Local => {
            warn!("using in-process KMS; wrapped keys will not survive a restart");
            let local = LocalKms::new();
            for level in common::SensitivityLevel::ENCRYPTED {
                local.create_key(key_ids.for_level(level));
            }
            Arc::new(local)
        }
    };

    // -----------------------------------------------------------------------
    // 4. Sensitivity registry
    // -----------------------------------------------------------------------
    let registry = match &cfg.registry_path {
        Some(path) => {
            let (registry, warnings) = SensitivityRegistry::from_path(path)
                .with_context(|| format!("failed to load sensitivity registry from {path}"))?;
            for w in &warnings {
                warn!(warning = %w, "sensitivity registry");
            }
            registry
        }
        None => SensitivityRegistry::with_defaults(),
    };
    info!(classified_fields = registry.len(), "sensitivity registry loaded");

    // -----------------------------------------------------------------------
    // 5. Key provider and audit pipeline
    // -----------------------------------------------------------------------
    let cache = KeyCache::new(cfg.key_cache_ttl());
    let keys = Arc::new(
        KeyProvider::new(kms, key_ids)
            .with_cache(cache.clone())
            .with_kms_timeout(cfg.kms_timeout())
            .with_max_encryptions(cfg.key_max_encryptions),
    );

    let (channel, rx) = ChannelAuditSink::new(cfg.audit_channel_capacity);
    let _audit_writer = audit::forward_task(rx, Arc::new(TracingAuditSink));
    let audit_sink: Arc<dyn AuditSink> = Arc::new(FanoutAuditSink::new(vec![
        Arc::new(channel.clone()),
        Arc::new(MetricsAuditSink::new()),
    ]));

    let rotator = Arc::new(KeyRotator::new(keys.clone(), audit_sink));
    rotator.load_baseline().await;

    // -----------------------------------------------------------------------
    // 6. Background tasks
    // -----------------------------------------------------------------------
    let sweeper = dek::sweep_task(
        cache.clone(),
        Duration::from_secs(cfg.cache_sweep_interval_secs),
    );
    let rotation = dek::rotation_task(
        rotator,
        Duration::from_secs(cfg.rotation_check_interval_secs),
    );
    info!("fieldvault ready");

    // -----------------------------------------------------------------------
    // 7. Shutdown
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    sweeper.abort();
    rotation.abort();
    let scrubbed = cache.clear().await;
    info!(scrubbed, audit_dropped = channel.dropped(), "key cache scrubbed; exiting");

    telemetry.shutdown();
    Ok(())
}
