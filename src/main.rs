//! imdash - headless dashboard runner
//!
//! Loads a dashboard file, builds the source registry and runs the frame
//! loop, logging every expression whose value changed. With `--demo`,
//! synthetic feeds are published on an in-process bus and a demo store is
//! created in the shared-memory directory.

use anyhow::Context;
use clap::Parser;
use imdash_core::{
    config::{dashboard, AppConfig, DashboardFile, LoggingConfig},
    scripting::{Expression, ExpressionEngine},
    LoopbackBus, SharedStore, SourceRegistry,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_RATE_HZ: f64 = 10.0;
const DEMO_STORE: &str = "imdash_demo";

#[derive(Parser)]
#[command(name = "imdash")]
#[command(about = "Evaluate dashboard expressions against live data sources")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to the app data directory)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Dashboard file with the expressions to evaluate
    #[arg(long, short = 'd')]
    dashboard: Option<PathBuf>,

    /// Publish synthetic feeds and create a demo store
    #[arg(long)]
    demo: bool,

    /// Frame rate (overrides the dashboard's rate)
    #[arg(long)]
    rate_hz: Option<f64>,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// Set up console logging plus an optional daily log file.
/// The returned guard must live as long as logging is needed.
fn init_logging(
    settings: &LoggingConfig,
    debug: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if debug {
        "info,imdash_core=trace,imdash=debug".to_string()
    } else {
        settings
            .filter
            .clone()
            .unwrap_or_else(|| "info,imdash_core=debug".to_string())
    };
    let env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, "imdash.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(env_filter());
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!("Cannot create log directory {:?}: {}", dir, e);
                (None, None)
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter()))
        .with(file_layer)
        .init();

    guard
}

/// Synthetic feeds for `--demo`
struct DemoPublisher {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DemoPublisher {
    fn start(bus: LoopbackBus, rate_hz: f64) -> Self {
        bus.advertise("/speed", "std_msgs/Float64");
        bus.advertise("/chatter", "std_msgs/String");
        bus.advertise("/odom", "nav_msgs/Odometry");

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let period = Duration::from_secs_f64(1.0 / rate_hz.max(1.0));

        let handle = std::thread::Builder::new()
            .name("demo-publisher".into())
            .spawn(move || {
                let start = Instant::now();
                let mut seq: u64 = 0;
                while flag.load(Ordering::Relaxed) {
                    let t = start.elapsed().as_secs_f64();
                    let secs = chrono::Utc::now().timestamp_micros() as f64 * 1e-6;
                    bus.publish("/speed", (2.0 + t.sin()).to_le_bytes().to_vec());
                    bus.publish("/chatter", format!("hello {}", seq).into_bytes());
                    bus.publish_json(
                        "/odom",
                        &json!({
                            "header": {
                                "stamp": {"sec": secs.floor(), "nanosec": secs.fract() * 1e9},
                                "frame_id": "odom"
                            },
                            "pose": {"pose": {"position": {"x": t.cos(), "y": t.sin(), "z": 0.0}}},
                            "twist": {"twist": {"linear": {"x": 1.0, "y": 0.0, "z": 0.0}}}
                        }),
                    );
                    seq += 1;
                    std::thread::sleep(period);
                }
            });

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::error!("Failed to start demo publisher: {}", e);
                None
            }
        };
        Self { running, handle }
    }

    fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Demo publisher panicked");
            }
        }
    }
}

fn demo_dashboard() -> Vec<(String, Expression)> {
    let store = format!("/stores/{}", DEMO_STORE);
    vec![
        ("speed".into(), Expression::bound("{/topics/speed}")),
        ("speed_kmh".into(), Expression::bound("3.6 * {/topics/speed}")),
        ("chatter".into(), Expression::bound("{/topics/chatter}")),
        ("position".into(), Expression::bound("{/topics/odom.pose.pose.position}")),
        (
            "scaled".into(),
            Expression::with_fallback(format!("{{{}/gain}} * alt", store), 10.0),
        ),
        ("setpoint".into(), Expression::bound(format!("2 * {{{}/setpoint}}", store))),
        ("offset".into(), Expression::literal(0.25)),
    ]
}

/// Run the frame loop until `running` clears or `max_frames` frames have
/// run. Returns the number of frames run.
fn run_frames(
    registry: &mut SourceRegistry,
    engine: &ExpressionEngine,
    expressions: &mut [(String, Expression)],
    period: Duration,
    max_frames: Option<u64>,
    running: &AtomicBool,
) -> u64 {
    let mut last_errors: Vec<Option<String>> = vec![None; expressions.len()];
    let mut frame: u64 = 0;

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        registry.begin_frame();

        for ((name, expr), last_error) in expressions.iter_mut().zip(last_errors.iter_mut()) {
            if !expr.is_stale(registry) {
                // Keep the source alive even when nothing changed
                continue;
            }
            match expr.evaluate(engine, registry) {
                Ok(value) => {
                    tracing::info!("{} = {}", name, value);
                    *last_error = None;
                }
                Err(e) => {
                    let message = e.to_string();
                    if last_error.as_deref() != Some(message.as_str()) {
                        tracing::warn!("{}: {}", name, message);
                        *last_error = Some(message);
                    }
                }
            }
        }

        let reclaimed = registry.end_frame();
        if reclaimed > 0 {
            tracing::debug!("Frame {}: reclaimed {} sources", registry.frame(), reclaimed);
        }

        frame += 1;
        if max_frames.is_some_and(|n| frame >= n) {
            break;
        }
        if let Some(rest) = period.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
    frame
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AppConfig::load_or_default(),
    };
    let _log_guard = init_logging(&config.logging, cli.debug);

    tracing::info!("Starting imdash");

    let (mut expressions, dashboard_rate) = match &cli.dashboard {
        Some(path) => {
            let dash = DashboardFile::load(path)
                .with_context(|| format!("loading dashboard {}", path.display()))?;
            tracing::info!(
                "Loaded dashboard '{}' with {} expressions",
                dash.name,
                dash.expressions.len()
            );
            (dash.expressions(&dashboard::base_dir(path)), dash.rate_hz)
        }
        None if cli.demo => (demo_dashboard(), None),
        None => anyhow::bail!("nothing to evaluate: pass --dashboard or --demo"),
    };
    let rate_hz = cli
        .rate_hz
        .or(dashboard_rate)
        .filter(|r| *r > 0.0)
        .unwrap_or(DEFAULT_RATE_HZ);

    let bus = LoopbackBus::new();
    let publisher = if cli.demo {
        if let Err(e) = SharedStore::create(
            &config.stores.shm_dir,
            DEMO_STORE,
            4096,
            &json!({"gain": 1.5, "setpoint": [0.0, 1.0, 2.0]}),
        ) {
            tracing::warn!("Demo store unavailable: {}", e);
        }
        Some(DemoPublisher::start(bus.clone(), rate_hz * 2.0))
    } else {
        None
    };

    let mut registry = SourceRegistry::new(&config, Arc::new(bus))
        .context("building the source registry")?;
    let engine = ExpressionEngine::new(&config.scripting);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received...");
        r.store(false, Ordering::SeqCst);
    })
    .context("installing the ctrl-c handler")?;

    let period = Duration::from_secs_f64(1.0 / rate_hz);
    let frames = run_frames(
        &mut registry,
        &engine,
        &mut expressions,
        period,
        cli.frames,
        &running,
    );
    tracing::info!("Ran {} frames", frames);

    tracing::info!("Shutting down...");
    registry.reinit();
    if let Some(publisher) = publisher {
        publisher.stop();
    }
    Ok(())
}
