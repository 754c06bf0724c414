use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use presence_core::{parse_embedding, AttendanceMode, EuclideanMatcher, Matcher};
use presence_hw::{acquire, list_devices, CameraBackend, V4lBackend};
use presence_kiosk::{
    build_client, load_extractor, AttendanceReporter, Config, ExtractorError, GalleryLoad,
    GalleryLoader, HttpGallerySource, HttpReporter, ModelAssets,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance kiosk CLI")]
struct Cli {
    /// Config file (TOML); PRESENCE_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled faces served by the gallery endpoint
    Gallery,
    /// Match a probe embedding against the current gallery
    Match {
        /// Probe embedding as a JSON array, e.g. "[0.1, 0.2, ...]"
        #[arg(short, long)]
        probe: String,
        /// Override the configured match threshold
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Record a check-in for an employee id
    CheckIn {
        employee_id: String,
    },
    /// Record a check-out for an employee id
    CheckOut {
        employee_id: String,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics
    Test,
    /// Verify the face model files and report why loading fails
    Models,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(path = ?cli.config, gallery_url = %config.gallery_url, "configuration loaded");

    match cli.command {
        Commands::Gallery => {
            let load = load_gallery(&config).await?;
            if load.gallery.is_empty() {
                println!("No faces enrolled");
                return Ok(());
            }
            println!("{:<16} {:<32} EMBEDDING", "EMPLOYEE", "NAME");
            for face in load.gallery.iter() {
                let embedding = match &face.embedding {
                    Some(e) => format!("{}-dim", e.dim()),
                    None => "unusable".to_string(),
                };
                println!("{:<16} {:<32} {embedding}", face.employee_id, face.display_name);
            }
            println!(
                "{} entries, {} usable for matching",
                load.gallery.len(),
                load.gallery.usable_len()
            );
        }
        Commands::Match { probe, threshold } => {
            let value: serde_json::Value =
                serde_json::from_str(&probe).context("probe is not valid JSON")?;
            let probe = parse_embedding(&value, Some(config.embedding_dim))
                .context("invalid probe embedding")?;
            let threshold = threshold.unwrap_or(config.match_threshold);

            let load = load_gallery(&config).await?;
            match EuclideanMatcher.find_best_match(&probe, &load.gallery, threshold)? {
                Some(m) => println!(
                    "Match: {} ({}) distance={:.4} confidence={:.1}%",
                    m.display_name,
                    m.employee_id,
                    m.distance,
                    m.confidence()
                ),
                None => println!("No match below threshold {threshold}"),
            }
        }
        Commands::CheckIn { employee_id } => {
            report(&config, &employee_id, AttendanceMode::CheckIn).await?
        }
        Commands::CheckOut { employee_id } => {
            report(&config, &employee_id, AttendanceMode::CheckOut).await?
        }
        Commands::Devices => {
            let devices = list_devices();
            if devices.is_empty() {
                println!("No video devices found");
            }
            for dev in devices {
                println!("{}  {} [{}] {}", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Test => camera_test(&config).await?,
        Commands::Models => check_models(&config).await?,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config.redacted())?);
        }
    }

    Ok(())
}

async fn load_gallery(config: &Config) -> Result<GalleryLoad> {
    let client = build_client(config.request_timeout())?;
    let source =
        HttpGallerySource::new(client, config.gallery_url.clone(), config.api_token.clone());
    let loader =
        GalleryLoader::new(Arc::new(source), Some(config.embedding_dim), config.gallery_policy());

    let load = loader.load().await;
    if let Some(e) = &load.error {
        bail!("failed to load gallery from {}: {e}", config.gallery_url);
    }
    Ok(load)
}

async fn report(config: &Config, employee_id: &str, mode: AttendanceMode) -> Result<()> {
    let employee_id = employee_id.trim();
    if employee_id.is_empty() {
        bail!("employee id is empty");
    }
    let client = build_client(config.request_timeout())?;
    let reporter = HttpReporter::new(client, config.report_url.clone(), config.api_token.clone());
    reporter.report(employee_id, mode).await?;
    println!("Recorded {mode} for {employee_id}");
    Ok(())
}

async fn camera_test(config: &Config) -> Result<()> {
    println!("Running camera diagnostics...");
    let backend = V4lBackend::new(config.camera.device.clone());
    backend.check_environment()?;

    let stream = acquire(&backend, &config.constraints())?;
    let info = stream.info().clone();
    println!(
        "Opened {} at {}x{} ({} constraints)",
        info.device, info.width, info.height, info.level
    );

    for _ in 0..5 {
        let frame = stream.next_frame().await?;
        println!(
            "  frame #{:<4} brightness={:>6.1} dark={}",
            frame.sequence,
            frame.avg_brightness(),
            frame.is_dark
        );
    }
    stream.stop();
    println!("Camera released");
    Ok(())
}

async fn check_models(config: &Config) -> Result<()> {
    println!("Checking face models in {}...", config.model_dir.display());
    let required: Vec<&str> = config.model_files.iter().map(String::as_str).collect();
    let required = &required;
    let policy = config.model_retry_policy();

    let loaded = load_extractor(&config.model_dir, required, &policy, |assets| async move {
        model_sizes(&assets, required)
    })
    .await;

    match loaded {
        Ok(sizes) => {
            for (name, size) in sizes {
                println!("  {name:<32} {size:>10} bytes");
            }
            println!("All {} model files present", required.len());
            Ok(())
        }
        Err(e @ ExtractorError::ModelNotFound { .. }) => bail!("model files missing: {e}"),
        Err(e @ ExtractorError::UnsupportedRuntime(_)) => {
            bail!("this machine cannot run the face model: {e}")
        }
        Err(e @ ExtractorError::Network(_)) => {
            bail!("gave up after {} attempts: {e}", policy.max_attempts)
        }
        Err(e) => bail!("model check failed: {e}"),
    }
}

/// Stat every model file. Read errors are treated as transient since the
/// model directory is usually a mounted share.
fn model_sizes(assets: &ModelAssets, names: &[&str]) -> Result<Vec<(String, u64)>, ExtractorError> {
    if !cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
        return Err(ExtractorError::UnsupportedRuntime(format!(
            "no model runtime for {}",
            std::env::consts::ARCH
        )));
    }
    names
        .iter()
        .map(|name| {
            let path = assets.path(name);
            std::fs::metadata(&path)
                .map(|meta| (name.to_string(), meta.len()))
                .map_err(|e| ExtractorError::Network(format!("{}: {e}", path.display())))
        })
        .collect()
}
