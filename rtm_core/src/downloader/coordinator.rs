//! The download coordinator.
//!
//! Public methods hand control messages to a per-batch actor task; every
//! mutation of the records happens inside that actor, so callbacks arriving
//! from task drivers and commands arriving from callers are serialized onto
//! one context without locking the records themselves.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::batch::gate::ConcurrencyGate;
use crate::batch::record::{TransferJob, TransferRecord};
use crate::batch::{Batch, Command};
use crate::descriptor::Downloadable;
use crate::events::throttle::ProgressThrottle;
use crate::events::{aggregate_channel, AggregateEvent, AggregateStream, UnitStream};
use crate::http::session::{HttpSession, RequestSpec, SessionConfig};
use crate::http::task::TaskEvent;
use crate::types::TransferError;

/// Buffer for the per-batch command channel.
const COMMAND_BUFFER: usize = 8;

/// Buffer for the per-batch task-event channel.
const TASK_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Minimum whole-percent movement between progress updates.
    pub progress_interval: f64,
    /// Simultaneously running downloads, clamped to the gate's range.
    pub max_active: usize,
    pub session: SessionConfig,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            progress_interval: ProgressThrottle::DEFAULT_INTERVAL,
            max_active: 3,
            session: SessionConfig::default(),
        }
    }
}

/// Concurrent download coordinator. Owns at most one batch at a time; a new
/// `events*` call stops the previous batch first.
pub struct Downloader {
    config: DownloaderConfig,
    batch: Mutex<Option<mpsc::Sender<Command>>>,
}

impl Downloader {
    pub fn new(config: DownloaderConfig) -> Self {
        Self {
            config,
            batch: Mutex::new(None),
        }
    }

    /// Starts a batch of downloads and returns its aggregate stream. The
    /// aggregate `Start` event is already queued when this returns; `Unit`
    /// events follow in submission order.
    pub async fn events(&self, descriptors: Vec<Downloadable>) -> AggregateStream {
        let (aggregate_tx, aggregate_stream) = aggregate_channel();
        let mut batch = self.new_batch(Some(aggregate_tx));
        let mut unit_streams = Vec::with_capacity(descriptors.len());
        for (index, descriptor) in descriptors.into_iter().enumerate() {
            let (record, stream) = TransferRecord::new(index, TransferJob::Download(descriptor));
            batch.push(record);
            unit_streams.push(stream);
        }
        let records = batch.snapshots();
        batch
            .send_aggregate(AggregateEvent::Start { records })
            .await;
        self.launch(batch, unit_streams).await;
        aggregate_stream
    }

    /// Single-transfer form: a one-record batch whose unit stream is handed
    /// straight to the caller.
    pub async fn events_one(&self, descriptor: Downloadable) -> UnitStream {
        let mut batch = self.new_batch(None);
        let (record, stream) = TransferRecord::new(0, TransferJob::Download(descriptor));
        batch.push(record);
        self.launch(batch, Vec::new()).await;
        stream
    }

    /// Requests suspension of every currently running download. Records with
    /// a server-assisted resume token get a primed replacement task; the
    /// rest are suspended in place.
    pub async fn pause(&self) {
        self.send_command(Command::Pause).await;
    }

    /// Asks the gate to restart suspended records, FIFO.
    pub async fn resume(&self) {
        self.send_command(Command::Resume).await;
    }

    /// Cancels the single record whose source URL matches.
    pub async fn cancel(&self, url: impl Into<String>) {
        let url = url.into();
        self.send_command(move |ack| Command::Cancel(url, ack)).await;
    }

    /// Terminal cleanup for the current batch. Idempotent; with an error the
    /// error propagates to every still-open stream.
    pub async fn stop(&self, error: Option<TransferError>) {
        let sender = self.batch.lock().await.take();
        if let Some(sender) = sender {
            let (ack_tx, ack_rx) = oneshot::channel();
            if sender.send(Command::Stop(error, ack_tx)).await.is_ok() {
                let _ = ack_rx.await;
            }
        }
    }

    fn new_batch(&self, aggregate: Option<crate::events::AggregateSink>) -> Batch {
        Batch::new(
            ConcurrencyGate::new(self.config.max_active),
            ProgressThrottle::new(self.config.progress_interval),
            aggregate,
        )
    }

    async fn launch(&self, batch: Batch, unit_streams: Vec<UnitStream>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (task_tx, task_rx) = mpsc::channel(TASK_EVENT_BUFFER);
        let session = HttpSession::new(&self.config.session, task_tx);

        let previous = {
            let mut slot = self.batch.lock().await;
            slot.replace(cmd_tx)
        };
        if let Some(previous) = previous {
            let (ack_tx, ack_rx) = oneshot::channel();
            if previous.send(Command::Stop(None, ack_tx)).await.is_ok() {
                let _ = ack_rx.await;
            }
        }

        let actor = DownloadActor {
            session,
            batch,
            unit_streams,
            cmd_rx,
            task_rx,
        };
        tokio::spawn(actor.run());
    }

    async fn send_command(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let sender = self.batch.lock().await.clone();
        if let Some(sender) = sender {
            let (ack_tx, ack_rx) = oneshot::channel();
            if sender.send(make(ack_tx)).await.is_ok() {
                let _ = ack_rx.await;
            }
        }
    }
}

/// Per-batch actor: the serialized context all record mutations run on.
struct DownloadActor {
    session: HttpSession,
    batch: Batch,
    unit_streams: Vec<UnitStream>,
    cmd_rx: mpsc::Receiver<Command>,
    task_rx: mpsc::Receiver<TaskEvent>,
}

impl DownloadActor {
    async fn run(mut self) {
        self.init().await;
        if self.batch.settle().await {
            return;
        }
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            return;
                        }
                    }
                    // Every handle is gone; nobody can drive or observe this
                    // batch anymore.
                    None => {
                        self.batch.stop(None).await;
                        return;
                    }
                },
                event = self.task_rx.recv() => {
                    if let Some(event) = event {
                        if self.handle_task_event(event).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Builds each record's suspended task and hands out its unit stream, in
    /// submission order. A descriptor that yields no valid URL fails its
    /// record right after the stream is emitted, without a `Start` event.
    async fn init(&mut self) {
        let mut streams = std::mem::take(&mut self.unit_streams).into_iter();
        for index in 0..self.batch.records().len() {
            let spec = {
                let record = self.batch.record(index);
                let TransferJob::Download(descriptor) = &record.job else {
                    continue;
                };
                RequestSpec::parse(
                    &descriptor.url,
                    descriptor.headers.clone(),
                    descriptor.cache_policy,
                    descriptor.timeout,
                )
            };
            let failed = match spec {
                Ok(spec) => {
                    let task = self.session.download(spec);
                    self.batch.record_mut(index).task = Some(task);
                    None
                }
                Err(err) => Some(err),
            };
            if let Some(stream) = streams.next() {
                self.batch
                    .send_aggregate(AggregateEvent::Unit { index, stream })
                    .await;
            }
            if let Some(err) = failed {
                self.batch.fail_record(index, err).await;
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Pause(ack) => {
                self.pause_all().await;
                let _ = ack.send(());
                false
            }
            Command::Resume(ack) => {
                self.batch.start_ready(None).await;
                let _ = ack.send(());
                false
            }
            Command::Cancel(url, ack) => {
                let done = match self.batch.index_by_url(&url) {
                    Some(index) => {
                        if let Some(task) = &self.batch.record(index).task {
                            task.cancel();
                        }
                        self.batch
                            .fail_record(index, TransferError::Canceled)
                            .await;
                        self.batch.settle().await
                    }
                    None => false,
                };
                let _ = ack.send(());
                done
            }
            Command::Stop(error, ack) => {
                self.batch.stop(error).await;
                let _ = ack.send(());
                true
            }
        }
    }

    async fn pause_all(&mut self) {
        for index in self.batch.active_indexes() {
            let token = match &self.batch.record(index).task {
                Some(task) => task.cancel_producing_resume_token().await,
                None => continue,
            };
            match token {
                Some(token) => {
                    log::debug!("[downloader] record {} paused with resume token", index);
                    match self.session.download_from_resume(&token) {
                        Ok(task) => {
                            let record = self.batch.record_mut(index);
                            record.resume_token = Some(token);
                            record.task = Some(task);
                        }
                        Err(err) => {
                            self.batch.record_mut(index).resume_token = Some(token);
                            self.batch.fail_record(index, err).await;
                        }
                    }
                }
                None => {
                    if let Some(task) = &self.batch.record(index).task {
                        task.suspend();
                    }
                }
            }
        }
    }

    async fn handle_task_event(&mut self, event: TaskEvent) -> bool {
        match event {
            TaskEvent::DidWrite {
                task,
                total_written,
                total_expected,
                ..
            } => {
                self.batch.progress(task, total_written, total_expected);
                false
            }
            TaskEvent::DidFinishDownloading { task, bytes } => {
                let Some(index) = self.batch.index_by_task(task) else {
                    return false;
                };
                let response = self
                    .batch
                    .record(index)
                    .task
                    .as_ref()
                    .and_then(|t| t.response());
                match response {
                    Some(response) if response.is_ok() => match self.save(index, &bytes).await {
                        Ok(()) => self.batch.complete_record(index, bytes).await,
                        Err(err) => self.batch.fail_record(index, err).await,
                    },
                    Some(response) => {
                        self.batch
                            .fail_record(index, TransferError::ServerError(response.status))
                            .await;
                    }
                    None => {
                        self.batch
                            .fail_record(
                                index,
                                TransferError::NoLocalData("no response recorded".to_string()),
                            )
                            .await;
                    }
                }
                self.batch.settle().await
            }
            TaskEvent::DidComplete { task, failure } => {
                let Some(index) = self.batch.index_by_task(task) else {
                    return false;
                };
                if self.batch.record(index).finished {
                    return false;
                }
                match failure {
                    // Successful completion was already handled via
                    // `DidFinishDownloading`.
                    None => false,
                    Some(failure) => {
                        if let Some(token) = failure.resume_token {
                            // Keep the token and a primed replacement so the
                            // record could be resumed even though this
                            // attempt is over.
                            let replacement = self.session.download_from_resume(&token);
                            let record = self.batch.record_mut(index);
                            record.resume_token = Some(token);
                            if let Ok(task) = replacement {
                                record.task = Some(task);
                            }
                        }
                        self.batch.fail_record(index, failure.error).await;
                        self.batch.settle().await
                    }
                }
            }
            TaskEvent::DidReceive { .. } => false,
        }
    }

    /// Writes the downloaded bytes to the configured destination, creating
    /// missing directories and atomically replacing any existing file.
    async fn save(&self, index: usize, bytes: &Bytes) -> Result<(), TransferError> {
        let record = self.batch.record(index);
        let TransferJob::Download(descriptor) = &record.job else {
            return Ok(());
        };
        let Some(directory) = descriptor.directory.as_deref() else {
            return Ok(());
        };
        let destination = directory.join(descriptor.resolved_file_name());
        let dir_text = directory.to_string_lossy();
        if dir_text.contains("://") || descriptor.resolved_file_name().is_empty() {
            return Err(TransferError::InvalidFileUrl(dir_text.into_owned()));
        }
        tokio::fs::create_dir_all(directory).await.map_err(|err| {
            TransferError::NoLocalData(format!("creating {}: {}", directory.display(), err))
        })?;

        let staging = destination.with_file_name(format!(
            ".{}.{}.part",
            descriptor.resolved_file_name(),
            record.id
        ));
        tokio::fs::write(&staging, bytes).await.map_err(|err| {
            TransferError::NoLocalData(format!("writing {}: {}", staging.display(), err))
        })?;
        if let Err(err) = tokio::fs::rename(&staging, &destination).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(TransferError::NoLocalData(format!(
                "replacing {}: {}",
                destination.display(),
                err
            )));
        }
        log::info!("[downloader] saved {}", destination.display());
        Ok(())
    }
}
