//! A thin CLI front-end for the engine: drives a single torrent per process
//! (spec.md §6).

use std::{io::Write as _, path::PathBuf};

use clap::Parser;
use swarmcore::{
    conf::Conf,
    engine::{Completion, Engine},
};

#[derive(Parser, Debug)]
#[clap(
    name = "swarmcore-cli",
    about = "Download (and optionally seed) a single torrent"
)]
struct Cli {
    /// Path to the .torrent file to download.
    torrent_file: PathBuf,

    /// Enable verbose (debug-level) logging. `RUST_LOG` still takes
    /// precedence if set.
    #[clap(short, long)]
    verbose: bool,

    /// Keep seeding after the download completes, until interrupted.
    #[clap(short, long)]
    seed: bool,

    /// Before starting, prompt to delete any prior download directory
    /// matching this torrent's name.
    #[clap(short, long)]
    deletetorrent: bool,
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let download_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to determine current directory: {}", e);
            std::process::exit(1);
        }
    };
    let conf = Conf::new(download_dir);

    let engine = match Engine::open(&args.torrent_file, conf, args.seed) {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("Failed to open torrent {:?}: {}", args.torrent_file, e);
            std::process::exit(1);
        }
    };

    if args.deletetorrent {
        maybe_delete_prior_download(&engine);
    }

    match engine.run().await {
        Ok(Completion::Done(stats)) => {
            log::info!(
                "Finished: {}/{} pieces, {} peer(s), {:.1}s elapsed",
                stats.complete_pieces,
                stats.total_pieces,
                stats.connected_peers,
                stats.elapsed.as_secs_f64(),
            );
            std::process::exit(0);
        }
        Ok(Completion::Interrupted(stats)) => {
            log::info!(
                "Interrupted after {}/{} pieces, {:.1}s elapsed",
                stats.complete_pieces,
                stats.total_pieces,
                stats.elapsed.as_secs_f64(),
            );
            std::process::exit(130);
        }
        Err(e) => {
            log::error!("Torrent run failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// `-d/--deletetorrent`: if a prior download for this torrent already exists
/// at the destination, ask before wiping it (spec.md §6).
fn maybe_delete_prior_download(engine: &Engine) {
    let download_path = engine.storage_path();
    if !download_path.exists() {
        return;
    }

    let prompt = format!(
        "Remove existing download at {}?",
        download_path.display()
    );
    if !confirm(&prompt) {
        log::info!("Keeping existing download at {}", download_path.display());
        return;
    }

    let result = if download_path.is_dir() {
        std::fs::remove_dir_all(&download_path)
    } else {
        std::fs::remove_file(&download_path)
    };
    match result {
        Ok(()) => log::info!("Removed {}", download_path.display()),
        Err(e) => log::error!("Failed to remove {}: {}", download_path.display(), e),
    }
}

fn confirm(prompt: &str) -> bool {
    print!("{} [y/N] ", prompt);
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}
