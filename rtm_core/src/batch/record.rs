use bytes::BytesMut;
use uuid::Uuid;

use crate::descriptor::{Downloadable, Uploadable};
use crate::events::{unit_channel, UnitSink, UnitStream};
use crate::http::task::TaskHandle;
use crate::types::{TaskState, TransferError, TransferInfo, TransferState};

/// The descriptor behind a record.
#[derive(Debug)]
pub(crate) enum TransferJob {
    Download(Downloadable),
    Upload(Uploadable),
}

impl TransferJob {
    pub fn url(&self) -> &str {
        match self {
            TransferJob::Download(d) => &d.url,
            TransferJob::Upload(u) => &u.url,
        }
    }
}

/// Mutable per-transfer state, owned and mutated only by the coordinator.
#[derive(Debug)]
pub(crate) struct TransferRecord {
    pub id: String,
    pub index: usize,
    pub job: TransferJob,
    pub current_bytes: u64,
    pub total_bytes: u64,
    /// Byte count of the last emitted update; the throttle measures from here.
    pub emitted_bytes: u64,
    pub error: Option<TransferError>,
    pub task: Option<TaskHandle>,
    pub resume_token: Option<Vec<u8>>,
    pub sink: Option<UnitSink>,
    /// Server response bytes, uploads only; allocated on first receipt.
    pub response_body: Option<BytesMut>,
    /// The unit `Start` event went out.
    pub started: bool,
    /// A terminal unit event went out; nothing may follow it.
    pub finished: bool,
}

impl TransferRecord {
    pub fn new(index: usize, job: TransferJob) -> (Self, UnitStream) {
        let (sink, stream) = unit_channel();
        let record = Self {
            id: Uuid::new_v4().to_string(),
            index,
            job,
            current_bytes: 0,
            total_bytes: 0,
            emitted_bytes: 0,
            error: None,
            task: None,
            resume_token: None,
            sink: Some(sink),
            response_body: None,
            started: false,
            finished: false,
        };
        (record, stream)
    }

    pub fn state(&self) -> TransferState {
        if self.finished {
            return match &self.error {
                None => TransferState::Completed,
                Some(TransferError::Canceled) => TransferState::Canceled,
                Some(_) => TransferState::Failed,
            };
        }
        match &self.task {
            None => TransferState::Pending,
            Some(task) => match task.state() {
                TaskState::New => TransferState::Pending,
                TaskState::Suspended => TransferState::Suspended,
                // A completed or canceling task whose record hasn't settled
                // yet still occupies its slot.
                TaskState::Running | TaskState::Completed | TaskState::Canceling => {
                    TransferState::Running
                }
            },
        }
    }

    /// Occupies one of the gate's active slots.
    pub fn is_active(&self) -> bool {
        self.state() == TransferState::Running
    }

    /// Eligible for the gate to start (first start or resume).
    pub fn is_startable(&self) -> bool {
        if self.finished {
            return false;
        }
        match &self.task {
            None => false,
            Some(task) => matches!(task.state(), TaskState::New | TaskState::Suspended),
        }
    }

    pub fn snapshot(&self) -> TransferInfo {
        let destination = match &self.job {
            TransferJob::Download(d) => d.destination(),
            TransferJob::Upload(_) => None,
        };
        TransferInfo {
            id: self.id.clone(),
            index: self.index,
            url: self.job.url().to_string(),
            destination,
            current_bytes: self.current_bytes,
            total_bytes: self.total_bytes,
            state: self.state(),
        }
    }
}
