use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use vigil_monitor::config::{McpMode, MonitorConfig};
use vigil_monitor::error::{MonitorError, Result};
use vigil_monitor::inference::scheduler::InferenceScheduler;
use vigil_monitor::inference::vlm::Analyzer;
use vigil_monitor::inference::{QuestionRegistry, VlmClient};
use vigil_monitor::processing::MediaPackager;
use vigil_monitor::stats::PipelineStats;
use vigil_monitor::storage::{ResultStore, Session};
use vigil_monitor::stream::{FrameDistributor, FrameSource, TcpFrameReader};
use vigil_monitor::{api, events, inference, services, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Stream type override (only "tcp" is built in)
    #[arg(long)]
    stream_type: Option<String>,

    /// Output directory override
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable the ASR intake server
    #[arg(long)]
    no_asr: bool,

    /// Enable the TTS fan-out worker
    #[arg(long)]
    tts: bool,

    /// Start in sentry mode (camera control on every inference)
    #[arg(long)]
    sentry: bool,

    /// Disable MCP camera control entirely
    #[arg(long)]
    no_mcp: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // VIGIL_LOG_LEVEL overrides the flag.
    let log_level = std::env::var("VIGIL_LOG_LEVEL").unwrap_or_else(|_| args.log_level.clone());
    init_logging(&log_level)?;

    let config = load_config(&args)?;

    info!("Starting vigil monitor node");

    let session = Arc::new(Session::create(&config.monitoring.output_dir)?);
    let stats = Arc::new(PipelineStats::new(session.started_at));
    let distributor = Arc::new(FrameDistributor::new());
    let questions = Arc::new(QuestionRegistry::new(Duration::from_secs(
        config.question.expiry_secs,
    )));
    let store = Arc::new(ResultStore::new(
        Arc::clone(&session),
        Arc::clone(&stats),
        processor_config_snapshot(&config),
    ));
    let events = events::channel();

    let vlm = Arc::new(VlmClient::new(config.vlm.clone())?);
    let mcp = Arc::new(inference::mcp::McpBridge::new(&config.mcp)?);
    let scheduler = Arc::new(InferenceScheduler::new(
        &config.vlm,
        config.mcp.mode,
        config.mcp.sentry_prompt.clone(),
        vlm as Arc<dyn Analyzer>,
        mcp as Arc<dyn inference::mcp::ControlBridge>,
        Arc::clone(&questions),
        Arc::clone(&store),
        Arc::clone(&stats),
        events.clone(),
    ));

    let cancel = CancellationToken::new();
    let (ready_tx, ready_rx) = tokio::sync::mpsc::channel(config.video.ready_queue_capacity);

    // Reader worker: sole owner of the TCP socket and frame counter.
    let reader = TcpFrameReader::new(
        config.stream.clone(),
        Arc::clone(&distributor),
        Arc::clone(&stats),
        session.started_at,
    );
    let reader_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { reader.run(cancel).await })
    };

    // Packager worker.
    let packager = Arc::new(MediaPackager::new(
        config.clone(),
        Arc::clone(&session),
        Arc::clone(&distributor),
        Arc::clone(&stats),
        ready_tx,
    ));
    {
        let cancel = cancel.clone();
        tokio::spawn(packager.run(cancel));
    }

    // Scheduler worker.
    {
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(ready_rx, cancel).await });
    }

    // Store checkpoints.
    {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        let interval = Duration::from_secs(config.monitoring.log_checkpoint_secs);
        tokio::spawn(store.run_checkpoints(interval, cancel));
    }

    // TTS fan-out.
    if config.tts.enabled {
        let worker = services::tts::TtsWorker::new(config.tts.clone(), Arc::clone(&store))?;
        let cancel = cancel.clone();
        tokio::spawn(worker.run(cancel));
    }

    let app_state = web::Data::new(AppState {
        ws: api::ws::WsRegistry::new(config.server.ws_send_queue),
        streaming: AtomicBool::new(true),
        config: config.clone(),
        distributor: Arc::clone(&distributor),
        store: Arc::clone(&store),
        scheduler: Arc::clone(&scheduler),
        questions: Arc::clone(&questions),
        stats: Arc::clone(&stats),
        events: events.clone(),
    });

    // WebSocket broadcaster pumps.
    {
        let state = app_state.clone().into_inner();
        let cancel = cancel.clone();
        tokio::spawn(api::ws::run_broadcaster(state, cancel));
    }

    // Delivery surface.
    let server = {
        let state = app_state.clone();
        let cors_origins = config.server.cors_origins.clone();
        HttpServer::new(move || {
            let mut cors = Cors::default()
                .allowed_methods(vec!["GET", "POST", "DELETE"])
                .allowed_headers(vec!["Content-Type", "Authorization"])
                .max_age(3600);
            for origin in &cors_origins {
                cors = cors.allowed_origin(origin);
            }
            App::new()
                .app_data(state.clone())
                .wrap(cors)
                .configure(api::configure)
        })
        .bind((config.server.host.clone(), config.server.port))
        .map_err(|e| MonitorError::ConfigError(format!("server bind failed: {e}")))?
        .run()
    };
    let server_handle = server.handle();
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Delivery surface listening"
    );
    let server_task = tokio::spawn(server);

    // ASR intake on its own port.
    let asr_handle = if config.asr.enabled {
        let asr = services::asr::server(&config.asr, &config.question, Arc::clone(&questions))?;
        let handle = asr.handle();
        tokio::spawn(asr);
        Some(handle)
    } else {
        None
    };

    // Run until a shutdown signal or a fatal reader failure.
    let fatal = tokio::select! {
        _ = wait_for_shutdown() => false,
        result = reader_handle => {
            match result {
                Ok(Err(e)) => {
                    error!("Frame reader terminally failed: {e}");
                    true
                }
                _ => false,
            }
        }
    };

    info!("Shutting down vigil monitor node");
    cancel.cancel();
    server_handle.stop(true).await;
    if let Some(handle) = asr_handle {
        handle.stop(true).await;
    }
    // Give workers a moment to drain and flush the session log.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server_task.abort();

    if fatal {
        anyhow::bail!("frame reader exhausted its retry budget");
    }
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| MonitorError::ConfigError(e.to_string()))?;

    Ok(())
}

fn load_config(args: &Args) -> Result<MonitorConfig> {
    let mut config = MonitorConfig::load(args.config.as_deref())?;

    if let Some(stream_type) = &args.stream_type {
        if stream_type != "tcp" {
            return Err(MonitorError::ConfigError(format!(
                "unsupported stream type: {stream_type}"
            )));
        }
    }
    if let Some(output_dir) = &args.output_dir {
        config.monitoring.output_dir = output_dir.clone();
    }
    if args.no_asr {
        config.asr.enabled = false;
    }
    if args.tts {
        config.tts.enabled = true;
    }
    if args.no_mcp {
        config.mcp.mode = McpMode::Off;
    } else if args.sentry {
        config.mcp.mode = McpMode::Always;
    }

    Ok(config)
}

/// Configuration snapshot recorded in `experiment_log.json`. Never includes
/// credentials.
fn processor_config_snapshot(config: &MonitorConfig) -> serde_json::Value {
    serde_json::json!({
        "target_video_duration": config.video.target_duration_secs,
        "frames_per_second": config.video.frames_per_second,
        "original_fps": config.stream.fps,
        "target_frames_per_video": config.target_frames_per_video(),
        "frames_to_collect_per_video": config.frames_to_collect(),
        "inference_mode": config.vlm.mode,
        "max_concurrent_inferences": config.vlm.max_concurrent,
        "model": config.vlm.model,
    })
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
