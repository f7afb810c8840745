mod cli;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use cli::{Cli, Commands};
use vf_core::config::Config;
use vf_core::{NewVideo, UserId, VideoId, VideoWithJobs};
use vidforge::{recover_stalled, AppContext, MediaStorage, SyncObserver, SyncUpdate};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick levels from the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "vidforge=trace,vf_av=trace,vf_db=debug,vf_core=debug".to_string()
        } else {
            "vidforge=info,vf_av=info,vf_db=warn,vf_core=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Upload { file, user, title } => {
            let ctx = context(config_path)?;
            block_on(upload(&ctx, &file, user, title))
        }
        Commands::Convert {
            video_id,
            fallback,
            json,
        } => {
            let ctx = context(config_path)?;
            block_on(convert(&ctx, video_id, fallback, json))
        }
        Commands::Status { video_id, json } => {
            let ctx = context(config_path)?;
            status(&ctx, video_id, json)
        }
        Commands::Watch { user_id } => {
            let ctx = context(config_path)?;
            block_on(watch(&ctx, user_id))
        }
        Commands::Recover { timeout_secs } => {
            let ctx = context(config_path)?;
            recover(&ctx, timeout_secs)
        }
        Commands::CheckTools => check_tools(config_path),
        Commands::Validate => validate_config(config_path),
    }
}

fn context(config_path: Option<&Path>) -> Result<AppContext> {
    let config = Config::load_or_default(config_path);
    for warning in config.validate() {
        tracing::warn!("config: {warning}");
    }
    Ok(AppContext::init(config)?)
}

fn block_on<F: std::future::Future<Output = Result<()>>>(fut: F) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(fut)
}

fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp4" | "m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

async fn upload(ctx: &AppContext, file: &Path, user: UserId, title: Option<String>) -> Result<()> {
    let Some(file_name) = file.file_name().and_then(|n| n.to_str()) else {
        anyhow::bail!("Input file has no usable name: {:?}", file);
    };
    let data = tokio::fs::read(file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {e}", file))?;

    let storage_path = format!("{user}/{file_name}");
    let file_size = i64::try_from(data.len())?;
    ctx.storage.store(&storage_path, Bytes::from(data)).await?;

    let title = title.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.to_string())
    });
    let created = ctx.store.create_video(NewVideo {
        user_id: user,
        title,
        original_filename: file_name.to_string(),
        mime_type: mime_type_for(file).to_string(),
        storage_path,
        file_size,
    })?;

    println!("Video: {}", created.video.id);
    for job in &created.conversion_jobs {
        println!("  {} {} ({})", job.resolution, job.id, job.status);
    }
    Ok(())
}

async fn convert(ctx: &AppContext, video_id: VideoId, fallback: bool, json: bool) -> Result<()> {
    let Some(video) = ctx.store.get_video_with_jobs(video_id)? else {
        anyhow::bail!("Video not found: {video_id}");
    };
    let pending = video.pending_jobs();
    if pending.is_empty() {
        println!("No pending conversion jobs for {video_id}");
        return Ok(());
    }

    let orchestrator = ctx.orchestrator(fallback);
    let report = orchestrator
        .run_conversion(video_id, &video.video.storage_path, &pending)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Video {} is {} (encoder: {})", report.video_id, report.status, report.encoder);
    for job in &report.jobs {
        match (&job.output_url, &job.error) {
            (Some(url), _) => println!("  ✓ {} {}", job.resolution, url),
            (_, Some(err)) => println!("  ✗ {} {}", job.resolution, err),
            _ => println!("  ? {} {}", job.resolution, job.status),
        }
    }
    Ok(())
}

fn print_video(video: &VideoWithJobs) {
    let v = &video.video;
    println!("{} [{}] {}", v.id, v.status, v.title);
    println!("  Source: {} ({} bytes, {})", v.storage_path, v.file_size, v.mime_type);
    println!("  Updated: {} (version {})", v.updated_at, v.version);
    for job in &video.conversion_jobs {
        print!("  {:>5} {:<10} {:>3}%", job.resolution, job.status, job.progress);
        if let Some(ref path) = job.output_path {
            print!("  {path}");
        }
        if let Some(ref err) = job.error_message {
            print!("  {err}");
        }
        println!();
    }
}

fn status(ctx: &AppContext, video_id: VideoId, json: bool) -> Result<()> {
    let Some(video) = ctx.store.get_video_with_jobs(video_id)? else {
        anyhow::bail!("Video not found: {video_id}");
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&video)?);
    } else {
        print_video(&video);
    }
    Ok(())
}

async fn watch(ctx: &AppContext, user_id: UserId) -> Result<()> {
    let observer = SyncObserver::spawn_with_listener(ctx.store.clone(), user_id, |update| {
        match update {
            SyncUpdate::Change { record, outcome } => println!(
                "#{} {} {} video={} ({:?})",
                record.seq,
                record.timestamp,
                record.event.kind(),
                record.event.video_id(),
                outcome
            ),
            SyncUpdate::Replayed { missed, replayed } => {
                println!("caught up on {replayed} of {missed} missed changes")
            }
            SyncUpdate::Resynced { missed } => {
                println!("resynced after missing {missed} changes")
            }
        }
    })?;

    let snapshot = observer.snapshot();
    println!("Watching {} videos for {user_id} (Ctrl-C to stop)", snapshot.len());
    for video in &snapshot {
        print_video(video);
    }

    tokio::signal::ctrl_c().await?;
    observer.shutdown().await?;
    Ok(())
}

fn recover(ctx: &AppContext, timeout_secs: Option<u64>) -> Result<()> {
    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| ctx.config.recovery.stall_timeout());
    let report = recover_stalled(ctx.store.as_ref(), timeout)?;
    if report.is_empty() {
        println!("No stalled conversion jobs");
        return Ok(());
    }
    println!("Failed {} stalled jobs", report.failed_jobs.len());
    for (video_id, status) in &report.videos {
        println!("  {video_id} -> {status}");
    }
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path);
    let registry = vf_av::ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in registry.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);
        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }
        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }
        println!();
    }

    println!();
    if all_ok {
        println!("All tools are available!");
    } else {
        println!("ffmpeg is missing; conversions will use the fallback emulator.");
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let contents = std::fs::read_to_string(p)?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Database: {}", config.database.path.display());
    println!("  Storage: {} ({})", config.storage.root.display(), config.storage.public_base_url);
    println!("  Encoder: {:?}", config.encoder.mode);

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        for warning in &warnings {
            println!("  ! {warning}");
        }
    }
    Ok(())
}
