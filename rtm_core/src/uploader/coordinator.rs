//! The upload coordinator.
//!
//! Mirrors the download coordinator's actor shape; the differences are the
//! spooled multipart body, the pre-start size gate, response-body capture,
//! and pause semantics (suspend only — there is no server-assisted upload
//! resumption).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::batch::gate::ConcurrencyGate;
use crate::batch::record::{TransferJob, TransferRecord};
use crate::batch::{Batch, Command};
use crate::descriptor::Uploadable;
use crate::events::throttle::ProgressThrottle;
use crate::events::{aggregate_channel, AggregateEvent, AggregateStream, UnitStream};
use crate::http::session::{HttpSession, RequestSpec, SessionConfig};
use crate::http::task::TaskEvent;
use crate::types::TransferError;
use crate::uploader::multipart::{default_spool_dir, merged_upload_headers, write_spool};

const COMMAND_BUFFER: usize = 8;
const TASK_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Minimum whole-percent movement between progress updates.
    pub progress_interval: f64,
    /// Simultaneously running uploads, clamped to the gate's range. Also
    /// bounds the session's per-host connection pool.
    pub max_active: usize,
    /// Where spool files live; defaults to `ConcurrencyUpload` under the
    /// system temp directory.
    pub spool_dir: Option<PathBuf>,
    /// Delete and recreate the spool directory before the first batch.
    pub reset_spool_dir: bool,
    pub session: SessionConfig,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            progress_interval: ProgressThrottle::DEFAULT_INTERVAL,
            max_active: 3,
            spool_dir: None,
            reset_spool_dir: false,
            session: SessionConfig::default(),
        }
    }
}

/// Concurrent multipart-upload coordinator. Owns at most one batch at a
/// time; a new `events*` call stops the previous batch first.
pub struct Uploader {
    config: UploaderConfig,
    batch: Mutex<Option<mpsc::Sender<Command>>>,
    reset_pending: AtomicBool,
}

impl Uploader {
    pub fn new(config: UploaderConfig) -> Self {
        let reset_pending = AtomicBool::new(config.reset_spool_dir);
        Self {
            config,
            batch: Mutex::new(None),
            reset_pending,
        }
    }

    /// Starts a batch of uploads and returns its aggregate stream.
    pub async fn events(&self, descriptors: Vec<Uploadable>) -> AggregateStream {
        let (aggregate_tx, aggregate_stream) = aggregate_channel();
        let mut batch = self.new_batch(Some(aggregate_tx));
        let mut unit_streams = Vec::with_capacity(descriptors.len());
        for (index, descriptor) in descriptors.into_iter().enumerate() {
            let (record, stream) = TransferRecord::new(index, TransferJob::Upload(descriptor));
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
    pub async fn events_one(&self, descriptor: Uploadable) -> UnitStream {
        let mut batch = self.new_batch(None);
        let (record, stream) = TransferRecord::new(0, TransferJob::Upload(descriptor));
        batch.push(record);
        self.launch(batch, Vec::new()).await;
        stream
    }

    /// Suspends every currently running upload in place.
    pub async fn pause(&self) {
        self.send_command(Command::Pause).await;
    }

    /// Asks the gate to restart suspended records, FIFO.
    pub async fn resume(&self) {
        self.send_command(Command::Resume).await;
    }

    /// Cancels the single record with the given id.
    pub async fn cancel(&self, record_id: impl Into<String>) {
        let id = record_id.into();
        self.send_command(move |ack| Command::Cancel(id, ack)).await;
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

    fn spool_dir(&self) -> PathBuf {
        self.config
            .spool_dir
            .clone()
            .unwrap_or_else(default_spool_dir)
    }

    async fn launch(&self, batch: Batch, unit_streams: Vec<UnitStream>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (task_tx, task_rx) = mpsc::channel(TASK_EVENT_BUFFER);
        let mut session_config = self.config.session.clone();
        session_config.max_connections_per_host =
            ConcurrencyGate::new(self.config.max_active).max_active();
        let session = HttpSession::new(&session_config, task_tx);

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

        let actor = UploadActor {
            session,
            batch,
            unit_streams,
            cmd_rx,
            task_rx,
            spool_dir: self.spool_dir(),
            reset_spool: self.reset_pending.swap(false, Ordering::SeqCst),
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
struct UploadActor {
    session: HttpSession,
    batch: Batch,
    unit_streams: Vec<UnitStream>,
    cmd_rx: mpsc::Receiver<Command>,
    task_rx: mpsc::Receiver<TaskEvent>,
    spool_dir: PathBuf,
    reset_spool: bool,
}

impl UploadActor {
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

    /// Spools each record's multipart body, enforces the size limit, builds
    /// the suspended task, and hands out unit streams in submission order.
    /// A record that fails preparation ends its stream without a `Start`.
    async fn init(&mut self) {
        if self.reset_spool {
            let _ = tokio::fs::remove_dir_all(&self.spool_dir).await;
        }
        if let Err(err) = tokio::fs::create_dir_all(&self.spool_dir).await {
            log::error!(
                "[uploader] cannot create spool dir {}: {}",
                self.spool_dir.display(),
                err
            );
        }

        let mut streams = std::mem::take(&mut self.unit_streams).into_iter();
        for index in 0..self.batch.records().len() {
            let failed = match self.prepare(index).await {
                Ok((spec, spool_path, spool_len)) => {
                    let task = self.session.upload(spec, spool_path, spool_len);
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

    /// Builds one record's request: URL check, spool file, size gate, merged
    /// headers.
    async fn prepare(
        &mut self,
        index: usize,
    ) -> Result<(RequestSpec, PathBuf, u64), TransferError> {
        let (id, descriptor) = {
            let record = self.batch.record(index);
            let TransferJob::Upload(descriptor) = &record.job else {
                return Err(TransferError::Failure("not an upload record".to_string()));
            };
            (record.id.clone(), descriptor.clone())
        };

        // Reject bad URLs before doing any disk work.
        RequestSpec::parse(
            &descriptor.url,
            descriptor.headers.clone(),
            descriptor.cache_policy,
            descriptor.timeout,
        )?;

        let spool_path = write_spool(
            &self.spool_dir,
            &id,
            &descriptor.payload,
            &descriptor.parameters,
        )
        .await?;
        let spool_len = tokio::fs::metadata(&spool_path)
            .await
            .map_err(|err| TransferError::Io {
                path: spool_path.to_string_lossy().into_owned(),
                message: err.to_string(),
            })?
            .len();
        if spool_len > descriptor.max_bytes {
            log::warn!(
                "[uploader] record {} spool is {} bytes, limit {}",
                index,
                spool_len,
                descriptor.max_bytes
            );
            return Err(TransferError::OverSizeLimit {
                size: spool_len,
                limit: descriptor.max_bytes,
            });
        }

        let headers = merged_upload_headers(&id, &descriptor.headers);
        let spec = RequestSpec::parse(
            &descriptor.url,
            headers,
            descriptor.cache_policy,
            descriptor.timeout,
        )?;
        Ok((spec, spool_path, spool_len))
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Pause(ack) => {
                for index in self.batch.active_indexes() {
                    if let Some(task) = &self.batch.record(index).task {
                        task.suspend();
                    }
                }
                let _ = ack.send(());
                false
            }
            Command::Resume(ack) => {
                self.batch.start_ready(None).await;
                let _ = ack.send(());
                false
            }
            Command::Cancel(id, ack) => {
                let done = match self.batch.index_by_id(&id) {
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
            TaskEvent::DidReceive { task, data } => {
                if let Some(index) = self.batch.index_by_task(task) {
                    let record = self.batch.record_mut(index);
                    if !record.finished {
                        record
                            .response_body
                            .get_or_insert_with(BytesMut::new)
                            .extend_from_slice(&data);
                    }
                }
                false
            }
            TaskEvent::DidComplete { task, failure } => {
                let Some(index) = self.batch.index_by_task(task) else {
                    return false;
                };
                if self.batch.record(index).finished {
                    return false;
                }
                match failure {
                    Some(failure) => {
                        self.batch.fail_record(index, failure.error).await;
                    }
                    None => {
                        let response = self
                            .batch
                            .record(index)
                            .task
                            .as_ref()
                            .and_then(|t| t.response());
                        match response {
                            Some(response) if response.is_ok() => {
                                let body = self
                                    .batch
                                    .record_mut(index)
                                    .response_body
                                    .take()
                                    .map(BytesMut::freeze)
                                    .unwrap_or_default();
                                self.batch.complete_record(index, body).await;
                            }
                            Some(response) => {
                                self.batch
                                    .fail_record(
                                        index,
                                        TransferError::ServerError(response.status),
                                    )
                                    .await;
                            }
                            None => {
                                self.batch
                                    .fail_record(
                                        index,
                                        TransferError::Failure(
                                            "upload finished without a response".to_string(),
                                        ),
                                    )
                                    .await;
                            }
                        }
                    }
                }
                self.batch.settle().await
            }
            TaskEvent::DidFinishDownloading { .. } => false,
        }
    }
}
