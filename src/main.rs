// src/main.rs

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crowd_analytics::config::{AppConfig, ConfigStore};
use crowd_analytics::job::{DefaultFactory, JobContext};
use crowd_analytics::persist::{LiveSink, NullSink, SqliteSink};
use crowd_analytics::server::{self, AppState};
use crowd_analytics::snapshot::LiveState;
use crowd_analytics::supervisor::JobSupervisor;
use crowd_analytics::sync::{HttpSettingsSource, SettingsSource, SyncWorker};

#[derive(Parser, Debug)]
#[command(name = "crowd-analytics", about = "Live people counting and occupancy heatmap service")]
struct Args {
    /// YAML service configuration
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override server.bind
    #[arg(long)]
    bind: Option<String>,

    /// Start processing this video at boot
    #[arg(long)]
    video: Option<PathBuf>,

    /// Do not pull settings from the remote settings service
    #[arg(long)]
    no_sync: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("crowd_analytics=info,actix_web=info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = AppConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        cfg.server.bind = bind;
    }
    if args.no_sync {
        cfg.settings.enabled = false;
    }
    info!(config = %args.config.display(), bind = %cfg.server.bind, "starting");

    let store = Arc::new(ConfigStore::new(cfg.defaults));
    let live = Arc::new(LiveState::new(&cfg.heatmap));

    let sink: Arc<dyn LiveSink> = if cfg.persistence.enabled {
        match SqliteSink::open(&cfg.persistence.path, cfg.persistence.queue) {
            Ok(sink) => Arc::new(sink),
            Err(err) => {
                warn!("persistence disabled, could not open {}: {err:#}", cfg.persistence.path.display());
                Arc::new(NullSink)
            }
        }
    } else {
        Arc::new(NullSink)
    };

    let settings_source: Option<Arc<dyn SettingsSource>> = if cfg.settings.enabled {
        Some(Arc::new(HttpSettingsSource::new(&cfg.settings)))
    } else {
        None
    };
    let sync_worker = settings_source
        .clone()
        .map(|source| SyncWorker::spawn(source, Arc::clone(&store), cfg.settings.interval()));

    let ctx = JobContext {
        config: Arc::clone(&store),
        live: Arc::clone(&live),
        sink: Arc::clone(&sink),
        factory: Arc::new(DefaultFactory::new(cfg.detector.clone(), cfg.tracker)),
        heatmap: cfg.heatmap,
        job: cfg.job,
        target_class: cfg.detector.target_class,
    };
    let supervisor = Arc::new(JobSupervisor::new(ctx));

    if let Some(video) = args.video {
        let id = supervisor
            .submit(video.clone())
            .with_context(|| format!("starting job for {}", video.display()))?;
        info!(job = id, "boot video submitted");
    }

    let state = AppState {
        config: store,
        live,
        supervisor: Arc::clone(&supervisor),
        settings_source,
        upload_dir: cfg.server.upload_dir.clone(),
        stream_interval: Duration::from_millis(cfg.server.stream_interval_ms.max(1)),
    };
    let max_upload = cfg.server.max_upload_mb.saturating_mul(1024 * 1024);
    let served = actix_web::rt::System::new().block_on(server::run(state, &cfg.server.bind, max_upload));

    info!("shutting down");
    supervisor.shutdown();
    if let Some(worker) = sync_worker {
        worker.stop();
    }
    sink.shutdown();

    served.map_err(|err| {
        error!("HTTP server error: {err}");
        anyhow!("HTTP server error: {err}")
    })
}
