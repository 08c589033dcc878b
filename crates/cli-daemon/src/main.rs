use anyhow::{anyhow, bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use narrator::{
    catalog::{LANGUAGES, RANDOM_VOICE, VOICE_GROUPS},
    config::NarratorConfig,
    executor::{FfmpegExecutor, TranscodeExecutor},
    job::{load_all_jobs, save_job, Job, JobStatus},
    pipeline::MediaAssemblyPipeline,
    scheduler::{drive, Scheduler},
    service::{JobService, SubmitRequest},
    speech::{CommandSynthesizer, CommandTranscriber},
    store::{FileJobStore, JobStore},
};
use chrono::Utc;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Narrated caption video daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and apply control commands until interrupted
    Serve,
    /// Queue a new job for the running daemon
    Submit(JobArgs),
    /// Show counts per status, or one job's record
    Status { id: Option<String> },
    /// List every job
    List,
    /// Cancel a queued or processing job
    Cancel { id: String },
    /// Delete a job that is not processing
    Delete { id: String },
    /// Delete every job that is not processing
    DeleteAll,
    /// Requeue failed and canceled jobs
    Requeue,
    /// Print the final video path of a completed job
    Result { id: String },
    /// Render one job in this process without a daemon
    Render(JobArgs),
    /// List supported languages, voices, video types and qualities
    Catalog,
}

#[derive(ClapArgs, Debug)]
struct JobArgs {
    /// Narration text; read from --file when omitted
    text: Option<String>,

    /// Read narration text from a file
    #[arg(short, long)]
    file: Option<PathBuf>,

    #[arg(short, long)]
    language: Option<String>,

    /// Voice name, or "random"
    #[arg(long)]
    voice: Option<String>,

    #[arg(long)]
    speech_rate: Option<String>,

    /// Quality preset name, e.g. "Full HD"
    #[arg(long)]
    quality: Option<String>,

    /// horizontal or vertical
    #[arg(long = "type")]
    video_type: Option<String>,
}

impl JobArgs {
    fn into_request(self) -> Result<SubmitRequest> {
        let text = match (self.text, &self.file) {
            (Some(text), _) => text,
            (None, Some(path)) => fs::read_to_string(path)
                .with_context(|| format!("Failed to read text file: {}", path.display()))?,
            (None, None) => bail!("Provide the narration text or --file"),
        };
        Ok(SubmitRequest {
            text,
            language: self.language,
            voice: self.voice,
            speech_rate: self.speech_rate,
            video_quality: self.quality,
            video_type: self.video_type,
        })
    }
}

/// Command file format for cross-process control
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
struct CommandFile {
    action: String,
    #[serde(default)]
    job_id: Option<String>,
    timestamp: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins unless --verbose is given
    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(log::LevelFilter::Info);
    }
    logger.format_timestamp_secs().init();

    let default_config_path = PathBuf::from("/etc/narrator/config.toml");
    let config_path = if let Some(ref path) = args.config {
        Some(path.as_path())
    } else if default_config_path.exists() {
        Some(default_config_path.as_path())
    } else {
        None
    };
    let cfg = Arc::new(
        NarratorConfig::load_config(config_path).context("Failed to load configuration")?,
    );

    match args.command {
        Command::Serve => serve(cfg).await,
        Command::Submit(job_args) => {
            let job = submit(&cfg, job_args.into_request()?)?;
            println!("{}", job.id);
            Ok(())
        }
        Command::Status { id } => status(&cfg, id.as_deref()),
        Command::List => list(&cfg),
        Command::Cancel { id } => send_command(&cfg, "cancel", Some(&id)),
        Command::Delete { id } => send_command(&cfg, "delete", Some(&id)),
        Command::DeleteAll => send_command(&cfg, "delete-all", None),
        Command::Requeue => send_command(&cfg, "requeue", None),
        Command::Result { id } => {
            let service = open_service(&cfg)?;
            let path = service.result(&id)?;
            println!("{}", path.display());
            Ok(())
        }
        Command::Render(job_args) => render(cfg, job_args.into_request()?).await,
        Command::Catalog => {
            print_catalog(&cfg);
            Ok(())
        }
    }
}

fn open_service(cfg: &Arc<NarratorConfig>) -> Result<JobService> {
    let store = Arc::new(FileJobStore::open(&cfg.store_dir)?);
    Ok(JobService::new(store, cfg.clone()))
}

fn build_pipeline(cfg: &Arc<NarratorConfig>, store: Arc<dyn JobStore>) -> Arc<MediaAssemblyPipeline> {
    let executor: Arc<dyn TranscodeExecutor> = Arc::new(FfmpegExecutor::new(&cfg.ffmpeg));
    Arc::new(MediaAssemblyPipeline::new(
        cfg.clone(),
        store,
        executor,
        Arc::new(CommandSynthesizer::new(&cfg.tts, &cfg.store_dir)),
        Arc::new(CommandTranscriber::new(&cfg.transcriber)),
    ))
}

async fn serve(cfg: Arc<NarratorConfig>) -> Result<()> {
    info!("Narrator daemon starting");
    info!("Configuration loaded:");
    info!("  Job store: {}", cfg.store_dir.display());
    info!("  Max concurrent jobs: {}", cfg.api.max_jobs);
    info!("  Background clips: {}", cfg.video.background_dir.display());
    info!("  Vertical background clips: {}", cfg.video.vertical_background_dir.display());
    info!("  Font: {}", cfg.captions.font_path.display());

    for dir in [&cfg.video.background_dir, &cfg.video.vertical_background_dir] {
        if !dir.exists() {
            warn!("Background directory does not exist: {}", dir.display());
        }
    }

    let store: Arc<dyn JobStore> = Arc::new(
        FileJobStore::open(&cfg.store_dir).context("Failed to open job store")?,
    );
    let pipeline = build_pipeline(&cfg, store.clone());
    let handle = Scheduler::start(store.clone(), pipeline, cfg.api.max_jobs)?;
    let service = JobService::new(store, cfg.clone()).with_wake(handle.notifier());

    let mut sweep = tokio::time::interval(std::time::Duration::from_secs(cfg.command_poll_secs.max(1)));
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                if let Err(e) = process_command_files(&cfg, &service) {
                    warn!("Failed to process command files: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Interrupt received, shutting down");
                break;
            }
        }
    }

    handle.shutdown().await?;
    info!("Narrator daemon stopped");
    Ok(())
}

/// Validate locally, persist the record and ask the daemon to adopt it
fn submit(cfg: &Arc<NarratorConfig>, request: SubmitRequest) -> Result<Job> {
    let service = open_service(cfg)?;
    let job = service.validate(&request)?;
    save_job(&job, &cfg.store_dir)?;
    write_command(&cfg.command_dir(), "adopt", Some(&job.id))?;
    info!("Job {}: Submitted", job.id);
    Ok(job)
}

/// Run one job to completion in this process
async fn render(cfg: Arc<NarratorConfig>, request: SubmitRequest) -> Result<()> {
    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&cfg.store_dir)?);
    let service = JobService::new(store.clone(), cfg.clone());
    let mut job = service.validate(&request)?;
    job.status = JobStatus::Processing;
    job.started_at = Some(Utc::now());
    store.set(job.clone())?;
    info!("Job {}: 🎬 Rendering in-process", job.id);

    let pipeline = build_pipeline(&cfg, store.clone());
    let id = job.id.clone();
    let done = drive(store, pipeline, job)
        .await
        .ok_or_else(|| anyhow!("Job {} vanished while rendering", id))?;

    match done.status {
        JobStatus::Completed => {
            let artifact = done.artifact.unwrap_or_default();
            println!("{}", artifact.display());
            Ok(())
        }
        status => bail!("Job {} {}: {}", id, status, done.reason.unwrap_or_default()),
    }
}

fn status(cfg: &Arc<NarratorConfig>, id: Option<&str>) -> Result<()> {
    let service = open_service(cfg)?;
    if let Some(id) = id {
        let job = service.get(id).ok_or_else(|| anyhow!("Job not found: {}", id))?;
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    let summary = service.status();
    println!(
        "queued: {}  processing: {}/{}  completed: {}  failed: {}  canceled: {}",
        summary.queued, summary.processing, summary.max_jobs, summary.completed, summary.failed, summary.canceled
    );
    Ok(())
}

fn list(cfg: &NarratorConfig) -> Result<()> {
    let jobs = load_all_jobs(&cfg.store_dir).context("Failed to load jobs")?;
    for job in jobs {
        let detail = match job.status {
            JobStatus::Failed | JobStatus::Canceled => job.reason.clone().unwrap_or_default(),
            JobStatus::Completed => job.artifact.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
            _ => job.stage.clone().unwrap_or_default(),
        };
        println!(
            "{}  {:<10}  {:<5}  {:<12}  {}  {}",
            job.id,
            job.status,
            job.language,
            job.voice,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            detail
        );
    }
    Ok(())
}

fn print_catalog(cfg: &NarratorConfig) {
    println!("Languages:");
    for (code, name) in LANGUAGES {
        println!("  {:<6} {}", code, name);
    }
    println!("Voices ({} picks an English voice):", RANDOM_VOICE);
    for (group, voices) in VOICE_GROUPS {
        println!("  {}: {}", group, voices.join(", "));
    }
    println!("Video types: Horizontal, Vertical");
    println!("Video qualities:");
    for quality in &cfg.video.qualities {
        println!("  {:<8} {}x{}", quality.name, quality.width, quality.height);
    }
}

fn send_command(cfg: &NarratorConfig, action: &str, job_id: Option<&str>) -> Result<()> {
    let path = write_command(&cfg.command_dir(), action, job_id)?;
    println!("Queued {} command: {}", action, path.display());
    Ok(())
}

/// Drop a command file for the daemon; the rename keeps it invisible until complete
fn write_command(command_dir: &Path, action: &str, job_id: Option<&str>) -> Result<PathBuf> {
    fs::create_dir_all(command_dir)
        .with_context(|| format!("Failed to create command directory: {}", command_dir.display()))?;

    let now = Utc::now();
    let cmd = CommandFile {
        action: action.to_string(),
        job_id: job_id.map(str::to_string),
        timestamp: now.to_rfc3339(),
    };
    let stem = format!(
        "{}-{}-{}",
        now.timestamp_nanos_opt().unwrap_or_default(),
        action,
        job_id.unwrap_or("all")
    );
    let tmp = command_dir.join(format!("{}.tmp", stem));
    let path = command_dir.join(format!("{}.json", stem));

    fs::write(&tmp, serde_json::to_string_pretty(&cmd)?)
        .with_context(|| format!("Failed to write command file: {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to publish command file: {}", path.display()))?;
    Ok(path)
}

fn apply_command(service: &JobService, cmd: &CommandFile) -> Result<()> {
    let job_id = || cmd.job_id.as_deref().ok_or_else(|| anyhow!("{} command without job_id", cmd.action));

    match cmd.action.as_str() {
        "adopt" => {
            service.adopt(job_id()?)?;
        }
        "cancel" => {
            service.cancel(job_id()?)?;
        }
        "delete" => {
            service.delete(job_id()?)?;
        }
        "delete-all" => {
            service.delete_all()?;
        }
        "requeue" => {
            let count = service.requeue_remaining()?;
            info!("🔄 Requeued {} job(s)", count);
        }
        other => bail!("Unknown command action: {}", other),
    }
    Ok(())
}

/// Apply and remove every command file, oldest first
fn process_command_files(cfg: &NarratorConfig, service: &JobService) -> Result<usize> {
    let command_dir = cfg.command_dir();

    if !command_dir.exists() {
        fs::create_dir_all(&command_dir)
            .with_context(|| format!("Failed to create command directory: {}", command_dir.display()))?;
    }

    let entries = match fs::read_dir(&command_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Failed to read command directory {}: {}", command_dir.display(), e);
            return Ok(0);
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut processed_count = 0;
    for path in paths {
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read command file {}: {}", path.display(), e);
                continue;
            }
        };

        match serde_json::from_str::<CommandFile>(&content) {
            Ok(cmd) => {
                debug!("Applying {:?}", cmd);
                match apply_command(service, &cmd) {
                    Ok(()) => processed_count += 1,
                    Err(e) => warn!("Command {} for {:?} failed: {:#}", cmd.action, cmd.job_id, e),
                }
            }
            Err(e) => warn!("Failed to parse command file {}: {}", path.display(), e),
        }

        fs::remove_file(&path)
            .with_context(|| format!("Failed to delete processed command file: {}", path.display()))?;
    }

    if processed_count > 0 {
        info!("✅ Processed {} command file(s)", processed_count);
    }

    Ok(processed_count)
}
