mod cli;
mod config;
mod error;
mod progress;

use std::process;

use clap::Parser;
use hlsgrab_engine::{DownloadOptions, HeaderMap, HlsDownloader, Playlist, build_header_map};
use mimalloc::MiMalloc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands, DownloadArgs, parse_headers};
use crate::config::AppConfig;
use crate::error::Result;
use crate::progress::spawn_progress;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("Application error: {e}");
        eprintln!("Error: {e}");
        process::exit(e.exit_code());
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = AppConfig::load(args.config.as_deref())?;

    match args.command {
        Commands::Download(download) => {
            config.apply_overrides(&download)?;
            if args.quiet {
                config.progress = false;
            }
            run_download(config, download).await
        }
        Commands::Inspect { url, headers } => {
            let headers = header_map(&headers)?;
            let downloader = HlsDownloader::new(config.engine)?;
            let playlist = downloader.inspect(&url, headers.as_ref()).await?;
            print_playlist(&url, &playlist);
            Ok(())
        }
    }
}

async fn run_download(config: AppConfig, args: DownloadArgs) -> Result<()> {
    let options = DownloadOptions {
        headers: header_map(&args.headers)?,
        save_playlist: args.save_playlist.clone(),
        include_audio: args.audio,
        audio_only: args.audio_only,
        quality: args.quality,
    };

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cleaning up");
            ctrl_c.cancel();
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let progress = spawn_progress(rx, config.progress);

    let downloader = HlsDownloader::new(config.engine)?
        .with_events(tx)
        .with_cancellation(token);
    let result = downloader.download(&args.url, &args.output, &options).await;
    // Closes the event channel so the progress task can finish.
    drop(downloader);
    let _ = progress.await;

    let report = result?;
    info!(
        output = %report.output.display(),
        segments = report.segments,
        encrypted = report.encrypted,
        audio = report.audio_merged,
        "Download finished"
    );
    match report.resolution {
        Some(resolution) => println!("{} ({resolution})", report.output.display()),
        None => println!("{}", report.output.display()),
    }
    Ok(())
}

fn header_map(raw: &[String]) -> Result<Option<HeaderMap>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let pairs = parse_headers(raw)?;
    let headers = build_header_map(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
    Ok(Some(headers))
}

fn print_playlist(url: &str, playlist: &Playlist) {
    println!("{url}");
    println!("  kind: {}", playlist.kind());

    if playlist.kind().is_master() {
        for variant in playlist.variants() {
            let resolution = variant
                .resolution
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string());
            let bandwidth = variant
                .bandwidth
                .map(|b| format!("{} kbit/s", b / 1000))
                .unwrap_or_else(|| "-".to_string());
            println!("  variant {resolution:>10} {bandwidth:>14}  {}", variant.url);
        }
        if let Some(audio) = playlist.audio_rendition() {
            let name = audio.name.as_deref().unwrap_or("-");
            let uri = audio.uri.as_deref().unwrap_or("-");
            println!("  audio   {name}  {uri}");
        }
    } else {
        println!("  segments: {}", playlist.segments().len());
        println!("  media sequence: {}", playlist.media_sequence());
        println!("  container: {}", playlist.container_hint().extension());
        for key in playlist.keys() {
            println!(
                "  key: {} {} iv={}",
                key.method,
                key.uri.as_deref().unwrap_or("-"),
                key.iv.as_deref().unwrap_or("-")
            );
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(verbose),
        )
        .init();
}
