use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use speech_pipeline::transcription::srt::save_srt;
use speech_pipeline::{Config, Job, JobManager, JobStatus, Transcript, TranscriptionPipeline};

fn cli() -> Command {
    Command::new("Speech Pipeline")
        .version(env!("CARGO_PKG_VERSION"))
        .author("TigreRoll")
        .about("Resilient video-to-transcript pipeline")
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("FILE")
                .help("Video or audio file to transcribe")
                .required_unless_present_any(["serve", "write-config"]),
        )
        .arg(
            Arg::new("language")
                .short('l')
                .long("language")
                .value_name("CODE")
                .help("Language hint passed to the speech service (e.g. en)"),
        )
        .arg(
            Arg::new("session")
                .short('s')
                .long("session")
                .value_name("ID")
                .help("Session key for the job (defaults to the input file name)"),
        )
        .arg(
            Arg::new("output-dir")
                .short('o')
                .long("output-dir")
                .value_name("DIR")
                .help("Output directory for transcripts")
                .default_value("./output"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (TOML)"),
        )
        .arg(
            Arg::new("write-config")
                .long("write-config")
                .value_name("FILE")
                .help("Write the effective configuration as TOML and exit"),
        )
        .arg(
            Arg::new("source-root")
                .long("source-root")
                .value_name("DIR")
                .help("Only accept sources inside this directory (required with --serve)"),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("NUM")
                .help("Maximum concurrent jobs")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("serve")
                .long("serve")
                .value_name("PORT")
                .help("Run the HTTP job API instead of a single transcription")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let verbose = matches.get_flag("verbose");

    let default_filter = if verbose {
        "speech_pipeline=debug,info"
    } else {
        "speech_pipeline=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::load_from(Path::new(path))?,
        None => Config::load().unwrap_or_else(|e| {
            warn!("Failed to load config, using defaults: {}", e);
            Config::default()
        }),
    };
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.queue.max_concurrency = *workers;
    }
    if let Some(root) = matches.get_one::<String>("source-root") {
        config.source_root = Some(PathBuf::from(root));
    }

    if let Some(path) = matches.get_one::<String>("write-config") {
        return config.save(Path::new(path));
    }

    let serve_port = matches.get_one::<u16>("serve").copied();
    if serve_port.is_some() && config.source_root.is_none() {
        return Err(anyhow!(
            "--serve needs a source root (--source-root, source_root in config, or SPEECH_PIPELINE_SOURCE_ROOT)"
        ));
    }

    config.validate()?;
    info!("{}", config.summary());

    let queue_config = config.queue.clone();
    let pipeline = TranscriptionPipeline::from_config(Arc::new(config))?;
    let manager = JobManager::new(Arc::new(pipeline), queue_config);

    if let Some(port) = serve_port {
        return serve(manager, port).await;
    }

    let input = matches
        .get_one::<String>("input")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("--input is required"))?;
    let output_dir = PathBuf::from(
        matches
            .get_one::<String>("output-dir")
            .map(String::as_str)
            .unwrap_or("./output"),
    );
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("Invalid input filename: {}", input.display()))?;
    let session = matches.get_one::<String>("session").cloned().unwrap_or_else(|| stem.clone());
    let language = matches.get_one::<String>("language").cloned();

    info!("🚀 Speech pipeline starting...");
    info!("📁 Input: {}", input.display());
    info!("📂 Output directory: {}", output_dir.display());

    let start_time = std::time::Instant::now();
    let job = manager.enqueue(&session, &input.to_string_lossy(), language);
    let progress_logger = tokio::spawn(log_progress(manager.clone(), job.clone()));

    let finished = manager
        .wait_for_terminal(job.job_id)
        .await
        .ok_or_else(|| anyhow!("Job {} vanished before finishing", job.job_id))?;
    progress_logger.abort();

    match (finished.status, finished.result) {
        (JobStatus::Complete, Some(transcript)) => {
            write_outputs(&transcript, &output_dir, &stem).await?;
            info!("🎉 Transcription completed in {:.2}s", start_time.elapsed().as_secs_f64());
            info!(
                "📝 {} segments, {} words, language {}",
                transcript.segments.len(),
                transcript.words.len(),
                transcript.language.as_deref().unwrap_or("unknown")
            );
            Ok(())
        }
        _ => {
            let message = finished.error.unwrap_or_else(|| "unknown failure".to_string());
            error!("❌ Transcription failed: {}", message);
            Err(anyhow!(message))
        }
    }
}

async fn log_progress(manager: JobManager, job: Job) {
    let mut updates = manager.subscribe();
    while let Ok(update) = updates.recv().await {
        if update.job_id == job.job_id {
            info!(
                "⏳ [{:>3}%] {} ({}/{})",
                update.progress,
                update.stage,
                update.completed_chunks.unwrap_or(0),
                update.total_chunks.unwrap_or(0)
            );
        }
    }
}

async fn write_outputs(transcript: &Transcript, output_dir: &Path, stem: &str) -> Result<()> {
    tokio::fs::create_dir_all(output_dir).await?;

    let json_path = output_dir.join(format!("{}.json", stem));
    tokio::fs::write(&json_path, serde_json::to_string_pretty(transcript)?).await?;

    let text_path = output_dir.join(format!("{}.txt", stem));
    tokio::fs::write(&text_path, &transcript.text).await?;

    let srt_path = output_dir.join(format!("{}.srt", stem));
    save_srt(transcript, &srt_path).await?;

    info!("💾 Results saved to: {}", json_path.display());
    Ok(())
}

#[cfg(feature = "api")]
async fn serve(manager: JobManager, port: u16) -> Result<()> {
    speech_pipeline::api::ApiServer::new(manager, port).start().await
}

#[cfg(not(feature = "api"))]
async fn serve(_manager: JobManager, _port: u16) -> Result<()> {
    Err(anyhow!("--serve requires building with the `api` feature"))
}
