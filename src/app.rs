use crate::config::Config;
use crate::ingest::pipeline::Ingestor;
use crate::ingest::scheduler::{Schedule, Scheduler};
use crate::ingest::worker::Worker;
use crate::openaq::OpenAqApi;
use crate::utils::fmt_duration;
use anyhow::Context;
use sqlx::ConnectOptions;
use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Main application struct containing all necessary components.
pub struct App {
    config: Config,
    db_pool: sqlx::PgPool,
    ingestor: Arc<Ingestor>,
    schedule: Schedule,
}

impl App {
    /// Create a new App instance with all necessary components initialized.
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let schedule = Schedule::from_config(&config);
        schedule.validate().context("Invalid schedule configuration")?;

        let connect_options = sqlx::postgres::PgConnectOptions::from_str(&config.database_url)
            .context("Failed to parse database URL")?
            .log_statements(tracing::log::LevelFilter::Debug)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(1));

        let db_pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(4))
            .idle_timeout(Duration::from_secs(60 * 2))
            .max_lifetime(Duration::from_secs(60 * 30))
            .connect_with(connect_options)
            .await
            .context("Failed to create database pool")?;

        info!(
            min_connections = 0,
            max_connections = 8,
            acquire_timeout = "4s",
            idle_timeout = "2m",
            max_lifetime = "30m",
            "database pool established"
        );

        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run database migrations")?;
        info!("Database migrations completed successfully");

        let api = OpenAqApi::new(config.openaq_base_url.clone(), config.openaq_api_key.clone())
            .context("Failed to create OpenAQ API client")?;

        let ingestor = Arc::new(Ingestor::new(
            Arc::new(api),
            db_pool.clone(),
            config.country_id,
        ));

        Ok(App {
            config,
            db_pool,
            ingestor,
            schedule,
        })
    }

    /// Spawn the scheduler and workers, then run until a shutdown signal
    /// arrives and all services have drained (or the drain timeout expires).
    pub async fn run(self) -> ExitCode {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut handles = Vec::new();

        let scheduler = Scheduler::new(
            self.db_pool.clone(),
            self.schedule,
            self.config.fetch_history,
        );
        let scheduler_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            scheduler.run(scheduler_rx).await;
        }));

        for worker_id in 0..self.config.worker_count {
            let worker = Worker::new(worker_id, self.db_pool.clone(), self.ingestor.clone());
            let worker_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                worker.run(worker_rx).await;
            }));
        }

        info!(workers = self.config.worker_count, "All services started");

        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, draining services");

        if shutdown_tx.send(()).is_err() {
            warn!("No services were listening for shutdown");
        }

        let drain = Duration::from_secs(self.config.shutdown_timeout);
        let all_done = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        match tokio::time::timeout(drain, all_done).await {
            Ok(()) => {
                info!("All services exited cleanly");
                ExitCode::SUCCESS
            }
            Err(_) => {
                error!(
                    timeout = fmt_duration(drain),
                    "Services did not drain in time, aborting"
                );
                ExitCode::FAILURE
            }
        }
    }
}

/// Wait for SIGINT or, on Unix, SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = ?e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
