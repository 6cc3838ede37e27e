mod aggregate;
mod avglog;
mod broker;
mod calibration;
mod config;
mod errlog;
mod health;
mod http;
mod metric;
mod plant;
mod publisher;
mod records;
mod retry;
mod scheduler;
mod sensors;
mod stats;
mod store;
mod sysfs;
mod validate;

use crate::avglog::AverageLog;
use crate::broker::MqttBroker;
use crate::config::Config;
use crate::errlog::ErrorLog;
use crate::health::HostMonitor;
use crate::publisher::Publisher;
use crate::records::RecordBuilder;
use crate::retry::RetryQueue;
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::stats::NodeStats;
use crate::validate::Validator;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Instant;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,field_node=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let config = Config::from_env()?;

    let sensors = sysfs::build_slots(&config.sensors);
    if sensors.enabled_count() == 0 {
        bail!("no sensors enabled; set at least one FIELD_NODE_*_ENABLED");
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
    let stats = Arc::new(NodeStats::new());
    let error_log_path = config.data_dir.join("error_log.txt");
    let errors = match ErrorLog::open(&error_log_path, config.error_log_max_lines) {
        Ok(errors) => errors,
        Err(err) => {
            tracing::warn!(
                error = %err,
                path = %error_log_path.display(),
                "error log unusable; reporting errors through tracing only"
            );
            ErrorLog::tracing_only(config.error_log_max_lines)
        }
    };
    let errors = Arc::new(errors);
    let averages = AverageLog::open(&config.data_dir, config.average_log_max_lines)?;

    let queue = match RetryQueue::open_spool(&config.data_dir.join("retry"), config.queue_limits()) {
        Ok(queue) => queue,
        Err(err) => {
            tracing::warn!(error = %err, "retry spool unusable; queueing in memory only");
            RetryQueue::in_memory(config.queue_limits())
        }
    };
    stats.set_queue_depth(queue.len().await);

    let publisher = Publisher::new(
        MqttBroker::new(config.mqtt_settings()),
        config.backoff(),
        queue,
        stats.clone(),
        errors.clone(),
        Instant::now(),
    );
    let scheduler = Scheduler::new(
        sensors,
        Validator::new(
            config.limits.clone(),
            config.conversions,
            config.wind_calibration,
        ),
        RecordBuilder::new(
            &config.mqtt_topic_prefix,
            &config.node_name,
            &config.software_version,
        )
        .with_status_prefix(&config.mqtt_status_prefix),
        publisher,
        averages,
        errors,
        stats.clone(),
        SchedulerSettings {
            tick_period: config.tick_period,
            window_length: config.window_length,
            burst_window: config.burst_window,
            plant: config.plant,
            calibration_path: config.calibration_path.clone(),
            status_interval: config.status_interval,
            host: HostMonitor::new(&config.data_dir),
        },
        chrono::Utc::now(),
    );

    let app = http::router(http::HttpState {
        stats,
        node_name: config.node_name.clone(),
        version: config.software_version.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("bind status listener {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, node = %config.node_name, "field-node HTTP listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = scheduler.run() => {}
        _ = http_handle => {
            tracing::warn!("status listener exited");
        }
    }

    Ok(())
}
