use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vf_core::{UserId, VideoId};

#[derive(Parser)]
#[command(name = "vidforge")]
#[command(author, version, about = "Per-resolution video conversion with live job sync")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Copy a media file into storage and create its conversion jobs
    Upload {
        /// Media file to upload
        #[arg(required = true)]
        file: PathBuf,

        /// Owner of the video
        #[arg(long)]
        user: UserId,

        /// Display title (defaults to the file stem)
        #[arg(long)]
        title: Option<String>,
    },

    /// Run every pending conversion job of a video
    Convert {
        video_id: VideoId,

        /// Use the fallback emulator even if ffmpeg is available
        #[arg(long)]
        fallback: bool,

        /// Output the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a video and its conversion jobs
    Status {
        video_id: VideoId,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Follow live changes to a user's videos until Ctrl-C
    Watch { user_id: UserId },

    /// Fail conversion jobs that stopped making progress
    Recover {
        /// Idle time after which a processing job counts as stalled
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Check that ffmpeg and ffprobe are available
    CheckTools,

    /// Validate configuration file
    Validate,
}
