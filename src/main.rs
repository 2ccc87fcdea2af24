//! service-gateway - HTTP API gateway with hexagonal architecture
//!
//! This is the composition root that wires together all the components.

use service_gateway::adapters::inbound::{AdminServer, AdminState, GatewayServer, GatewayState};
use service_gateway::adapters::outbound::{HttpAuthenticator, HttpUpstreamClient, MetricsCollector};
use service_gateway::application::{GatewayService, LoadBalancerService, ServiceRegistry};
use service_gateway::config::load_config;
use service_gateway::domain::ports::{AllowAll, Authenticator};
use service_gateway::infrastructure::{shutdown_signal, BreakerManager, HealthMonitor, ShutdownController};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting service-gateway listen={} admin={} strategy={:?} breaker_scope={:?}",
        cfg.listen_addr,
        cfg.admin_listen_addr,
        cfg.lb_strategy,
        cfg.breaker_scope
    );

    // ===== COMPOSITION ROOT =====
    // Wire up all adapters and services

    let shutdown = ShutdownController::new();

    // 1. Create outbound adapters

    // Separate clients for probes and forwarded calls
    let registry_cfg = cfg.registry_config();
    let prober = Arc::new(HttpUpstreamClient::new(registry_cfg.health_check_timeout)?);
    let upstream = Arc::new(HttpUpstreamClient::new(Duration::from_secs(cfg.lb_timeout_secs))?);

    let authenticator: Arc<dyn Authenticator> = match &cfg.auth_verify_url {
        Some(url) => {
            tracing::info!("verifying credentials against {}", url);
            Arc::new(HttpAuthenticator::new(url.clone(), Duration::from_millis(cfg.auth_timeout_ms))?)
        }
        None => {
            tracing::warn!("no auth verify URL configured, protected routes are open");
            Arc::new(AllowAll)
        }
    };

    let metrics = Arc::new(MetricsCollector::new(cfg.metrics_config()));
    metrics.start_cleanup(&shutdown);

    // 2. Create application services
    let registry = Arc::new(ServiceRegistry::new(registry_cfg).with_prober(prober.clone()));
    for instance in &cfg.instances {
        match registry
            .register(&instance.service, instance.instance_config())
            .await
        {
            Ok(id) => tracing::info!("registered static instance {}", id),
            Err(e) => tracing::error!(
                "failed to register {}={}:{}: {}",
                instance.service,
                instance.host,
                instance.port,
                e
            ),
        }
    }

    let load_balancer = Arc::new(LoadBalancerService::new(
        registry.clone(),
        cfg.load_balancer_config(),
    ));
    let breakers = Arc::new(BreakerManager::new(cfg.breaker_config(), cfg.breaker_scope));

    let monitor = Arc::new(HealthMonitor::new(
        cfg.health_monitor_config(),
        registry.clone(),
        prober,
    ));
    monitor.start(&shutdown);

    let gateway = Arc::new(GatewayService::new(
        cfg.route_table(),
        load_balancer.clone(),
        breakers.clone(),
        upstream,
        authenticator,
        metrics.clone(),
    ));

    // 3. Create inbound adapters and run
    let admin = AdminServer::new(
        cfg.admin_listen_addr.clone(),
        AdminState {
            registry,
            load_balancer,
            breakers,
            monitor,
            metrics,
        },
    );
    let server = GatewayServer::new(
        cfg.listen_addr.clone(),
        GatewayState {
            gateway,
            shutdown: shutdown.clone(),
        },
    );

    tokio::spawn(shutdown_signal(shutdown.clone()));

    let admin_shutdown = shutdown.clone();
    let admin_task = tokio::spawn(async move {
        if let Err(e) = admin.run(admin_shutdown.clone()).await {
            tracing::error!("admin API stopped: {:?}", e);
            admin_shutdown.shutdown();
        }
    });

    let result = server.run().await;
    if result.is_err() {
        shutdown.shutdown();
    }

    if !shutdown
        .wait_for_drain(Duration::from_secs(cfg.shutdown_grace_secs))
        .await
    {
        tracing::warn!(
            "shutdown grace period elapsed with {} requests in flight",
            shutdown.in_flight()
        );
    }
    let _ = admin_task.await;

    tracing::info!("service-gateway stopped");
    result
}
