use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pour_counter::{
    config::{ConfigLoader, ConfigOverrides},
    report::call_webhook,
    CountingEngine, Progress, ReportSummary,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

/// Pour counter: counts beers poured at a two-tap station filmed by a fixed camera
#[derive(Parser, Debug)]
#[command(name = "pour-counter")]
#[command(about = "Counts beers poured from two taps in a recorded video", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Count pours in a local video file
    Count {
        /// Input video file
        #[arg(short, long)]
        input: PathBuf,

        /// Calibration record `x,y,w,h|x,y,w,h|W,H`
        /// (env POUR_COUNTER_COORDS_FILE, default referencias/coords_dual.txt)
        #[arg(long)]
        coords: Option<PathBuf>,

        /// Directory with `<tap>_<label>.jpg` references
        /// (env POUR_COUNTER_REFS_DIR, default referencias)
        #[arg(long)]
        refs: Option<PathBuf>,

        /// Config file (.ini)
        /// Priority: command line > environment > config file > defaults
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the JSON summary here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Frames skipped before each decode while both taps are closed
        #[arg(long)]
        idle_skip_frames: Option<u32>,

        /// Frames decoded at full density after visible activity
        #[arg(long)]
        cooldown_frames: Option<u32>,

        /// Pour time that makes one beer
        #[arg(long)]
        seconds_per_beer: Option<f64>,
    },
    /// Check that a video opens and reports frame count and frame rate
    Probe {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Write a config file with every default
    InitConfig {
        #[arg(default_value = "pour-counter.ini")]
        path: PathBuf,
    },
    /// Start the HTTP service
    Serve {
        /// Listen address (default 0.0.0.0:$POUR_COUNTER_PORT, or 0.0.0.0:9000)
        #[arg(short, long)]
        bind: Option<String>,

        /// Config file (.ini)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Count {
            input,
            coords,
            refs,
            config: config_file,
            output,
            idle_skip_frames,
            cooldown_frames,
            seconds_per_beer,
        } => {
            let overrides = ConfigOverrides {
                idle_skip_frames,
                cooldown_frames,
                seconds_per_beer,
                coords_file: coords,
                refs_dir: refs,
                ..ConfigOverrides::default()
            };
            let config = ConfigLoader::load_config(config_file.as_deref(), overrides)
                .context("failed to load config")?;
            init_logging(&config.log_level);

            println!(
                "Config: idle_skip_frames={}, cooldown_frames={}, seconds_per_beer={:.1}s, refs={}",
                config.idle_skip_frames,
                config.cooldown_frames,
                config.seconds_per_beer,
                config.refs_dir.display()
            );

            let engine = CountingEngine::from_files(&config.coords_file, &config.refs_dir, config.engine())
                .with_context(|| format!("failed to load calibration {}", config.coords_file.display()))?;

            let mut bar = ProgressBar::new();
            let report = engine
                .process_video(&input, |progress| bar.update(progress))
                .with_context(|| format!("failed to count {}", input.display()))?;
            println!();

            let summary = report.summary();
            print_summary(&summary);

            if let Some(output) = output {
                summary.write_json(&output)?;
                tracing::info!("💾 [counter] summary written to {}", output.display());
            }

            if let Some(webhook_url) = &config.webhook_url {
                let input_video = input.display().to_string();
                if let Err(e) = call_webhook(webhook_url, &input_video, &summary).await {
                    tracing::warn!("⚠️  [service] webhook failed: {:#}", e);
                }
            }
        }
        Commands::Probe { input } => {
            let config = ConfigLoader::load_config(None, ConfigOverrides::default())
                .context("failed to load config")?;
            init_logging(&config.log_level);

            let health = pour_counter::probe_video(&input)
                .with_context(|| format!("failed to open {}", input.display()))?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if !health.healthy {
                anyhow::bail!("{} has no usable frame count or frame rate", input.display());
            }
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path)?;
            println!("Wrote default config to {}", path.display());
        }
        Commands::Serve { bind, config: config_file } => {
            let config = ConfigLoader::load_config(config_file.as_deref(), ConfigOverrides::default())
                .context("failed to load config")?;
            init_logging(&config.log_level);

            let bind_addr = bind.unwrap_or_else(|| {
                std::env::var("POUR_COUNTER_PORT")
                    .map(|port| format!("0.0.0.0:{}", port))
                    .unwrap_or_else(|_| "0.0.0.0:9000".to_string())
            });
            start_web_server(&bind_addr).await?;
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    let level = level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// In-place progress line on stdout, redrawn every 5 %.
struct ProgressBar {
    started: Instant,
    last_step: Option<u64>,
}

impl ProgressBar {
    const WIDTH: usize = 30;

    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_step: None,
        }
    }

    fn update(&mut self, progress: Progress) {
        let elapsed = self.started.elapsed().as_secs_f64();

        let Some(fraction) = progress.fraction() else {
            // unknown length, redraw every 500 frames
            let step = progress.frames_processed / 500;
            if self.last_step != Some(step) {
                self.last_step = Some(step);
                print!("\r   📈 progress: {} frames | elapsed: {:.1}s     ", progress.frames_processed, elapsed);
                std::io::stdout().flush().ok();
            }
            return;
        };

        let percent = (fraction * 100.0) as u64;
        let step = percent / 5;
        if self.last_step == Some(step) {
            return;
        }
        self.last_step = Some(step);

        let filled = (fraction * Self::WIDTH as f64) as usize;
        let bar = format!("{}{}", "█".repeat(filled), "░".repeat(Self::WIDTH - filled));
        let speed = if elapsed > 0.0 {
            progress.frames_processed as f64 / elapsed
        } else {
            0.0
        };
        print!(
            "\r   📈 progress: [{}] {}% ({}/{}) | elapsed: {:.1}s | speed: {:.1} frames/s     ",
            bar, percent, progress.frames_processed, progress.total_frames, elapsed, speed
        );
        std::io::stdout().flush().ok();
    }
}

fn print_summary(summary: &ReportSummary) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("🍺 Tap A: {} beer(s), {:.2}s pouring", summary.count_a, summary.seconds_a);
    println!("🍺 Tap B: {} beer(s), {:.2}s pouring", summary.count_b, summary.seconds_b);
    println!("   Total: {} beer(s) in {:.2}s of video", summary.total, summary.video_duration);
    if !summary.events.is_empty() {
        println!("   Events:");
        for event in &summary.events {
            println!(
                "     • tap {} {:>8.2}s - {:>8.2}s ({:.2}s) -> {}",
                event.tap, event.start, event.end, event.duration, event.beers
            );
        }
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

async fn start_web_server(bind: &str) -> Result<()> {
    use axum::{
        routing::{get, post},
        Router,
    };
    use pour_counter::handler;
    use tower_http::cors::CorsLayer;

    let app = Router::new()
        .route("/", get(handler::health_check))
        .route("/health", get(handler::health_check))
        .route("/count", post(handler::handle_count))
        .route("/count/query", get(handler::handle_count_query))
        .route("/probe", get(handler::handle_probe))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("failed to bind {}", bind))?;

    tracing::info!("🚀 [service] listening on http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  • health: GET  http://{}/health", bind);
    tracing::info!("  • count:  POST http://{}/count", bind);
    tracing::info!("  • query:  GET  http://{}/count/query?input=<path>", bind);
    tracing::info!("  • probe:  GET  http://{}/probe?input=<path>", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app).await.context("server stopped")?;

    Ok(())
}
