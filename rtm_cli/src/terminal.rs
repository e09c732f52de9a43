use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use rtm_core::{TransferError, TransferInfo, UnitEvent, UnitStream};

/// Renders transfer progress as indicatif terminal bars, one per unit.
/// Bars are created lazily when a unit's `Start` event arrives, so they
/// appear in the order transfers actually begin.
#[derive(Clone)]
pub struct TerminalRenderer {
    inner: Arc<Inner>,
}

struct Inner {
    multi: MultiProgress,
    bars: Mutex<HashMap<usize, ProgressBar>>,
}

impl TerminalRenderer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                multi: MultiProgress::new(),
                bars: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn batch_started(&self, records: &[TransferInfo]) {
        println!("Starting {} transfer(s)", records.len());
    }

    pub fn batch_completed(&self, records: &[TransferInfo]) {
        println!("All {} transfer(s) completed", records.len());
    }

    pub fn batch_failed(&self, error: &TransferError) {
        eprintln!("Batch failed: {}", error);
    }

    fn bar(&self, index: usize, label: &str, total: u64) -> ProgressBar {
        let mut bars = self.inner.bars.lock().unwrap();
        bars.entry(index)
            .or_insert_with(|| {
                let style = ProgressStyle::with_template(
                    "[{bar:30.cyan/blue}] {bytes}/{total_bytes} ({binary_bytes_per_sec}) ETA {eta} — {msg}",
                )
                .unwrap()
                .progress_chars("=>-");
                let pb = self.inner.multi.add(ProgressBar::new(total.max(1)));
                pb.set_style(style);
                pb.set_message(label.to_string());
                pb
            })
            .clone()
    }

    /// Consumes one unit stream to completion, driving its bar.
    pub async fn drive_unit(self, index: usize, mut stream: UnitStream) {
        while let Some(event) = stream.recv().await {
            match event {
                Ok(UnitEvent::Start { info, .. }) => {
                    let label = info
                        .destination
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| info.url.clone());
                    self.bar(index, &label, info.total_bytes);
                }
                Ok(UnitEvent::Update { current, total }) => {
                    let bar = self.bar(index, "", total);
                    bar.set_length(total.max(1));
                    bar.set_position(current);
                }
                Ok(UnitEvent::Completed { body, info }) => {
                    let bar = self.bar(index, &info.url, info.total_bytes);
                    bar.finish_with_message(format!("done ({} bytes)", body.len()));
                }
                Err(err) => {
                    let bar = self.bar(index, "", 0);
                    bar.abandon_with_message(format!("error: {}", err));
                }
            }
        }
    }
}
