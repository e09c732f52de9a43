use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;

use rtm_core::{AggregateEvent, Downloadable, Downloader, DownloaderConfig};

mod terminal;

use terminal::TerminalRenderer;

#[derive(Parser)]
#[command(name = "rtm", about = "Concurrent HTTP transfer engine")]
struct Args {
    /// URLs to download
    #[arg(required = true)]
    urls: Vec<String>,

    /// Directory downloads are saved into
    #[arg(short, long, default_value = "downloads")]
    output: PathBuf,

    /// Parallel transfer limit (1-5)
    #[arg(long, default_value_t = 3)]
    max_active: usize,

    /// Progress emission interval, in percent
    #[arg(long, default_value_t = 1.0)]
    progress_interval: f64,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let downloader = Downloader::new(DownloaderConfig {
        progress_interval: args.progress_interval,
        max_active: args.max_active,
        ..Default::default()
    });

    let descriptors: Vec<Downloadable> = args
        .urls
        .iter()
        .map(|url| Downloadable::new(url).with_directory(&args.output))
        .collect();

    let renderer = TerminalRenderer::new();
    let start = Instant::now();
    let mut stream = downloader.events(descriptors).await;
    let mut unit_tasks = Vec::new();
    let mut failed = false;

    while let Some(event) = stream.recv().await {
        match event {
            Ok(AggregateEvent::Start { records }) => renderer.batch_started(&records),
            Ok(AggregateEvent::Unit { index, stream }) => {
                let renderer = renderer.clone();
                unit_tasks.push(tokio::spawn(renderer.drive_unit(index, stream)));
            }
            Ok(AggregateEvent::AllCompleted { records }) => {
                renderer.batch_completed(&records);
            }
            Err(err) => {
                renderer.batch_failed(&err);
                failed = true;
            }
        }
    }

    // Let the per-unit bars drain before printing the summary.
    for task in unit_tasks {
        let _ = task.await;
    }

    if failed {
        std::process::exit(1);
    }
    println!("Finished in {:.2}s", start.elapsed().as_secs_f64());
}
