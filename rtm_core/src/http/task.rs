//! Task handles and the driver tasks behind them.
//!
//! Every transfer runs as one spawned driver. The handle side mirrors the
//! platform task model: created suspended, `resume()`/`suspend()` toggle a
//! watch flag the driver gates on between chunks, `cancel()` fires a
//! cancellation token, and `cancel_producing_resume_token()` trades a
//! known-resumable download for opaque token bytes. Drivers report back to
//! the owning coordinator over its task-event channel; progress uses
//! `try_send` so a slow consumer can never wedge a transfer, while terminal
//! callbacks are awaited sends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::http::resume::ResumeToken;
use crate::http::session::RequestSpec;
use crate::types::{TaskState, TransferError};

pub(crate) type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Write buffer for the download part file.
const WRITE_BUFFER: usize = 256 * 1024;

/// Read size for streaming the upload spool file.
const UPLOAD_CHUNK: usize = 64 * 1024;

/// Status and headers of the response carried by a task.
#[derive(Debug, Clone)]
pub(crate) struct ResponseInfo {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

impl ResponseInfo {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Why a task ended unsuccessfully. A mid-stream failure of a resumable
/// download attaches the token that would continue it.
#[derive(Debug)]
pub(crate) struct TaskFailure {
    pub error: TransferError,
    pub resume_token: Option<Vec<u8>>,
}

impl TaskFailure {
    fn plain(error: TransferError) -> Self {
        Self {
            error,
            resume_token: None,
        }
    }
}

/// Callbacks a driver delivers to its coordinator.
#[derive(Debug)]
pub(crate) enum TaskEvent {
    DidWrite {
        task: TaskId,
        written: u64,
        total_written: u64,
        total_expected: u64,
    },
    /// Downloads only. The part file's bytes are read into memory before
    /// this is sent and the part file is gone by the time it arrives.
    DidFinishDownloading { task: TaskId, bytes: Bytes },
    /// Uploads only; one per response-body chunk.
    DidReceive { task: TaskId, data: Bytes },
    DidComplete {
        task: TaskId,
        failure: Option<TaskFailure>,
    },
}

struct TaskShared {
    state: StdRwLock<TaskState>,
    response: StdRwLock<Option<ResponseInfo>>,
    resumable: StdRwLock<Option<bool>>,
    token_slot: StdMutex<Option<oneshot::Sender<Option<Vec<u8>>>>>,
}

/// Coordinator-side handle to one running transfer task.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    id: TaskId,
    shared: Arc<TaskShared>,
    control: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TaskShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskShared")
            .field("state", &*self.state.read().unwrap())
            .finish()
    }
}

impl TaskHandle {
    fn new_pair(events: mpsc::Sender<TaskEvent>) -> (Self, Driver) {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(TaskShared {
            state: StdRwLock::new(TaskState::New),
            response: StdRwLock::new(None),
            resumable: StdRwLock::new(None),
            token_slot: StdMutex::new(None),
        });
        let (control_tx, control_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let handle = Self {
            id,
            shared: Arc::clone(&shared),
            control: control_tx,
            cancel: cancel.clone(),
        };
        let driver = Driver {
            id,
            shared,
            control: control_rx,
            cancel,
            events,
        };
        (handle, driver)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        *self.shared.state.read().unwrap()
    }

    pub fn response(&self) -> Option<ResponseInfo> {
        self.shared.response.read().unwrap().clone()
    }

    pub fn resume(&self) {
        {
            let mut state = self.shared.state.write().unwrap();
            if matches!(*state, TaskState::New | TaskState::Suspended) {
                *state = TaskState::Running;
            }
        }
        let _ = self.control.send(true);
    }

    pub fn suspend(&self) {
        {
            let mut state = self.shared.state.write().unwrap();
            if *state == TaskState::Running {
                *state = TaskState::Suspended;
            }
        }
        let _ = self.control.send(false);
    }

    pub fn cancel(&self) {
        {
            let mut state = self.shared.state.write().unwrap();
            if *state != TaskState::Completed {
                *state = TaskState::Canceling;
            }
        }
        self.cancel.cancel();
    }

    /// Cancels a known-resumable download and returns the opaque token that
    /// continues it. Returns `None` without canceling when resumability is
    /// unknown or absent, so the caller can fall back to `suspend()`.
    pub async fn cancel_producing_resume_token(&self) -> Option<Vec<u8>> {
        if *self.shared.resumable.read().unwrap() != Some(true) {
            return None;
        }
        let rx = {
            let mut slot = self.shared.token_slot.lock().unwrap();
            if *self.shared.state.read().unwrap() == TaskState::Completed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            *slot = Some(tx);
            rx
        };
        {
            let mut state = self.shared.state.write().unwrap();
            if *state != TaskState::Completed {
                *state = TaskState::Canceling;
            }
        }
        self.cancel.cancel();
        rx.await.ok().flatten()
    }
}

/// Driver-side view of the shared task plumbing.
struct Driver {
    id: TaskId,
    shared: Arc<TaskShared>,
    control: watch::Receiver<bool>,
    cancel: CancellationToken,
    events: mpsc::Sender<TaskEvent>,
}

impl Driver {
    fn is_running(&mut self) -> bool {
        *self.control.borrow_and_update()
    }

    /// Parks until resumed. Returns `false` when the task was canceled (or
    /// the handle disappeared) while parked.
    async fn wait_running(&mut self) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if *self.control.borrow_and_update() {
                return true;
            }
            let cancel = self.cancel.clone();
            let closed = tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = self.control.changed() => changed.is_err(),
            };
            if closed {
                return false;
            }
        }
    }

    fn set_response(&self, info: ResponseInfo) {
        *self.shared.response.write().unwrap() = Some(info);
    }

    fn set_resumable(&self, resumable: bool) {
        *self.shared.resumable.write().unwrap() = Some(resumable);
    }

    fn take_token_request(&self) -> Option<oneshot::Sender<Option<Vec<u8>>>> {
        self.shared.token_slot.lock().unwrap().take()
    }

    /// Terminal step of every driver path. Marks the task completed before
    /// draining any pending token request so a caller racing completion gets
    /// `None` instead of hanging.
    async fn finish(self, failure: Option<TaskFailure>) {
        *self.shared.state.write().unwrap() = TaskState::Completed;
        if let Some(reply) = self.take_token_request() {
            let _ = reply.send(None);
        }
        let _ = self
            .events
            .send(TaskEvent::DidComplete {
                task: self.id,
                failure,
            })
            .await;
    }
}

pub(crate) fn spawn_download(
    client: Client,
    spec: RequestSpec,
    events: mpsc::Sender<TaskEvent>,
    resume: Option<ResumeToken>,
) -> TaskHandle {
    let (handle, driver) = TaskHandle::new_pair(events);
    tokio::spawn(run_download(driver, client, spec, resume));
    handle
}

pub(crate) fn spawn_upload(
    client: Client,
    spec: RequestSpec,
    events: mpsc::Sender<TaskEvent>,
    spool_path: PathBuf,
    spool_len: u64,
) -> TaskHandle {
    let (handle, driver) = TaskHandle::new_pair(events);
    tokio::spawn(run_upload(driver, client, spec, spool_path, spool_len));
    handle
}

fn network_failure(spec: &RequestSpec, err: &reqwest::Error) -> TransferError {
    TransferError::Network {
        url: spec.url.to_string(),
        message: err.to_string(),
    }
}

fn io_failure(path: &Path, err: &std::io::Error) -> TransferError {
    TransferError::Io {
        path: path.to_string_lossy().into_owned(),
        message: err.to_string(),
    }
}

fn response_info(response: &reqwest::Response) -> ResponseInfo {
    let headers = response
        .headers()
        .iter()
        .filter_map(|(key, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (key.as_str().to_string(), v.to_string()))
        })
        .collect();
    ResponseInfo {
        status: response.status().as_u16(),
        headers,
    }
}

/// Total size from a `Content-Range` header (`bytes 0-99/1234` -> 1234).
fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.rsplit('/').next())
        .and_then(|s| s.parse().ok())
}

async fn run_download(
    mut driver: Driver,
    client: Client,
    spec: RequestSpec,
    resume: Option<ResumeToken>,
) {
    if !driver.wait_running().await {
        if let Some(token) = &resume {
            let _ = tokio::fs::remove_file(&token.part_path).await;
        }
        return driver
            .finish(Some(TaskFailure::plain(TransferError::Canceled)))
            .await;
    }

    // Part file and prior progress. A token whose part file no longer matches
    // its recorded length restarts from zero.
    let (part_path, mut received, etag_hint) = match &resume {
        Some(token) => {
            let on_disk = tokio::fs::metadata(&token.part_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            let received = if on_disk == token.received {
                token.received
            } else {
                0
            };
            (token.part_path.clone(), received, token.etag.clone())
        }
        None => (
            std::env::temp_dir().join(format!("rtm-{}.part", Uuid::new_v4())),
            0,
            None,
        ),
    };
    let mut total_expected = resume.as_ref().map(|t| t.total_expected).unwrap_or(0);
    if resume.is_some() {
        driver.set_resumable(true);
    }

    let mut request = spec.apply(client.get(spec.url.clone()));
    if received > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={}-", received));
        if let Some(etag) = &etag_hint {
            request = request.header(reqwest::header::IF_RANGE, etag.clone());
        }
        log::debug!(
            "[task {}] resuming {} from byte {}",
            driver.id,
            spec.url,
            received
        );
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            if driver.cancel.is_cancelled() {
                return canceled_download(
                    driver,
                    &spec,
                    &part_path,
                    received,
                    total_expected,
                    etag_hint.as_deref(),
                )
                .await;
            }
            let failure = network_failure(&spec, &err);
            let _ = tokio::fs::remove_file(&part_path).await;
            return driver.finish(Some(TaskFailure::plain(failure))).await;
        }
    };

    let status = response.status();
    let resumable = status == StatusCode::PARTIAL_CONTENT
        || response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
    driver.set_resumable(resumable);
    let etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(etag_hint);
    driver.set_response(response_info(&response));

    if status == StatusCode::PARTIAL_CONTENT {
        if let Some(total) = content_range_total(&response) {
            total_expected = total;
        } else if let Some(len) = response.content_length() {
            total_expected = received + len;
        }
    } else {
        if received > 0 {
            // The server ignored our Range request; start over.
            log::debug!(
                "[task {}] server answered {} to a ranged request, restarting",
                driver.id,
                status
            );
            received = 0;
        }
        if let Some(len) = response.content_length() {
            total_expected = len;
        }
    }

    let file = if received > 0 {
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&part_path)
            .await
    } else {
        tokio::fs::File::create(&part_path).await
    };
    let file = match file {
        Ok(file) => file,
        Err(err) => {
            let failure = io_failure(&part_path, &err);
            return driver.finish(Some(TaskFailure::plain(failure))).await;
        }
    };
    let mut writer = tokio::io::BufWriter::with_capacity(WRITE_BUFFER, file);
    let mut stream = response.bytes_stream();
    let cancel = driver.cancel.clone();

    loop {
        if !driver.is_running() {
            let _ = writer.flush().await;
            if !driver.wait_running().await {
                return canceled_download(
                    driver,
                    &spec,
                    &part_path,
                    received,
                    total_expected,
                    etag.as_deref(),
                )
                .await;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = writer.flush().await;
                return canceled_download(
                    driver,
                    &spec,
                    &part_path,
                    received,
                    total_expected,
                    etag.as_deref(),
                )
                .await;
            }
            next = stream.next() => match next {
                None => break,
                Some(Ok(chunk)) => {
                    if let Err(err) = writer.write_all(&chunk).await {
                        let failure = io_failure(&part_path, &err);
                        let _ = tokio::fs::remove_file(&part_path).await;
                        return driver.finish(Some(TaskFailure::plain(failure))).await;
                    }
                    received += chunk.len() as u64;
                    let _ = driver.events.try_send(TaskEvent::DidWrite {
                        task: driver.id,
                        written: chunk.len() as u64,
                        total_written: received,
                        total_expected,
                    });
                }
                Some(Err(err)) => {
                    let _ = writer.flush().await;
                    let error = network_failure(&spec, &err);
                    // A resumable attempt with progress hands back the token
                    // that continues it; the part file stays for that case.
                    let resume_token = if resumable && received > 0 {
                        Some(
                            ResumeToken::from_attempt(
                                &spec,
                                &part_path,
                                received,
                                total_expected,
                                etag.as_deref(),
                            )
                            .encode(),
                        )
                    } else {
                        None
                    };
                    if resume_token.is_none() {
                        let _ = tokio::fs::remove_file(&part_path).await;
                    }
                    return driver
                        .finish(Some(TaskFailure {
                            error,
                            resume_token,
                        }))
                        .await;
                }
            }
        }
    }

    if let Err(err) = writer.flush().await {
        let failure = io_failure(&part_path, &err);
        let _ = tokio::fs::remove_file(&part_path).await;
        return driver.finish(Some(TaskFailure::plain(failure))).await;
    }
    drop(writer);

    // Read the bytes out before reporting: the part file is the engine's own
    // temp file and is deleted as soon as the callback is on its way.
    let bytes = match tokio::fs::read(&part_path).await {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            let failure = TransferError::NoLocalData(format!(
                "reading {} failed: {}",
                part_path.display(),
                err
            ));
            let _ = tokio::fs::remove_file(&part_path).await;
            return driver.finish(Some(TaskFailure::plain(failure))).await;
        }
    };
    let _ = tokio::fs::remove_file(&part_path).await;
    log::debug!(
        "[task {}] finished {} ({} bytes)",
        driver.id,
        spec.url,
        bytes.len()
    );
    let _ = driver
        .events
        .send(TaskEvent::DidFinishDownloading {
            task: driver.id,
            bytes,
        })
        .await;
    driver.finish(None).await;
}

/// Cancellation exit for download drivers. Answers a pending resume-token
/// request when the attempt is resumable (keeping the part file), otherwise
/// cleans up and reports a plain cancel.
async fn canceled_download(
    driver: Driver,
    spec: &RequestSpec,
    part_path: &Path,
    received: u64,
    total_expected: u64,
    etag: Option<&str>,
) {
    if let Some(reply) = driver.take_token_request() {
        let resumable = *driver.shared.resumable.read().unwrap() == Some(true);
        if resumable {
            let token =
                ResumeToken::from_attempt(spec, part_path, received, total_expected, etag).encode();
            let _ = reply.send(Some(token));
            return driver
                .finish(Some(TaskFailure::plain(TransferError::Canceled)))
                .await;
        }
        let _ = reply.send(None);
    }
    let _ = tokio::fs::remove_file(part_path).await;
    driver
        .finish(Some(TaskFailure::plain(TransferError::Canceled)))
        .await;
}

struct UploadBodyCtx {
    task: TaskId,
    file: tokio::fs::File,
    sent: u64,
    total: u64,
    control: watch::Receiver<bool>,
    cancel: CancellationToken,
    events: mpsc::Sender<TaskEvent>,
}

/// One step of the upload body stream: gate on pause/cancel, then read the
/// next spool chunk and report it as sent.
async fn read_spool_chunk(
    mut ctx: UploadBodyCtx,
) -> Option<(Result<Bytes, std::io::Error>, UploadBodyCtx)> {
    loop {
        if ctx.cancel.is_cancelled() {
            return Some((Err(std::io::Error::other("upload canceled")), ctx));
        }
        if *ctx.control.borrow_and_update() {
            break;
        }
        let cancel = ctx.cancel.clone();
        let control_closed = tokio::select! {
            _ = cancel.cancelled() => false,
            changed = ctx.control.changed() => changed.is_err(),
        };
        if ctx.cancel.is_cancelled() {
            return Some((Err(std::io::Error::other("upload canceled")), ctx));
        }
        if control_closed {
            break;
        }
    }
    let mut buf = vec![0u8; UPLOAD_CHUNK];
    match ctx.file.read(&mut buf).await {
        Ok(0) => None,
        Ok(n) => {
            buf.truncate(n);
            ctx.sent += n as u64;
            let _ = ctx.events.try_send(TaskEvent::DidWrite {
                task: ctx.task,
                written: n as u64,
                total_written: ctx.sent,
                total_expected: ctx.total,
            });
            Some((Ok(Bytes::from(buf)), ctx))
        }
        Err(err) => Some((Err(err), ctx)),
    }
}

async fn run_upload(
    mut driver: Driver,
    client: Client,
    spec: RequestSpec,
    spool_path: PathBuf,
    spool_len: u64,
) {
    if !driver.wait_running().await {
        return driver
            .finish(Some(TaskFailure::plain(TransferError::Canceled)))
            .await;
    }
    driver.set_resumable(false);

    let file = match tokio::fs::File::open(&spool_path).await {
        Ok(file) => file,
        Err(err) => {
            let failure = io_failure(&spool_path, &err);
            return driver.finish(Some(TaskFailure::plain(failure))).await;
        }
    };

    let ctx = UploadBodyCtx {
        task: driver.id,
        file,
        sent: 0,
        total: spool_len,
        control: driver.control.clone(),
        cancel: driver.cancel.clone(),
        events: driver.events.clone(),
    };
    let body_stream = futures::stream::unfold(ctx, read_spool_chunk);

    let request = spec
        .apply(client.post(spec.url.clone()))
        .header(reqwest::header::CONTENT_LENGTH, spool_len)
        .body(reqwest::Body::wrap_stream(body_stream));

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            let failure = if driver.cancel.is_cancelled() {
                TransferError::Canceled
            } else {
                network_failure(&spec, &err)
            };
            return driver.finish(Some(TaskFailure::plain(failure))).await;
        }
    };
    driver.set_response(response_info(&response));

    let mut body = response.bytes_stream();
    let cancel = driver.cancel.clone();
    loop {
        if !driver.is_running() && !driver.wait_running().await {
            return driver
                .finish(Some(TaskFailure::plain(TransferError::Canceled)))
                .await;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return driver
                    .finish(Some(TaskFailure::plain(TransferError::Canceled)))
                    .await;
            }
            next = body.next() => match next {
                None => break,
                Some(Ok(data)) => {
                    let _ = driver
                        .events
                        .send(TaskEvent::DidReceive { task: driver.id, data })
                        .await;
                }
                Some(Err(err)) => {
                    let failure = network_failure(&spec, &err);
                    return driver.finish(Some(TaskFailure::plain(failure))).await;
                }
            }
        }
    }
    log::debug!("[task {}] upload to {} finished", driver.id, spec.url);
    driver.finish(None).await;
}
