//! The record set one `events(...)` call creates, plus the machinery both
//! coordinators share: unit/aggregate emission, the gate loop, progress
//! throttling, completion bookkeeping, and terminal cleanup.

pub(crate) mod gate;
pub(crate) mod record;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::batch::gate::ConcurrencyGate;
use crate::batch::record::TransferRecord;
use crate::events::throttle::ProgressThrottle;
use crate::events::{AggregateEvent, AggregateSink, UnitEvent};
use crate::http::task::TaskId;
use crate::types::{TransferError, TransferInfo};

/// Control messages a coordinator handle sends into its batch actor. Every
/// command carries an ack so the public methods suspend until the actor has
/// applied it.
#[derive(Debug)]
pub(crate) enum Command {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Cancel(String, oneshot::Sender<()>),
    Stop(Option<TransferError>, oneshot::Sender<()>),
}

pub(crate) struct Batch {
    records: Vec<TransferRecord>,
    aggregate: Option<AggregateSink>,
    gate: ConcurrencyGate,
    throttle: ProgressThrottle,
}

impl Batch {
    pub fn new(
        gate: ConcurrencyGate,
        throttle: ProgressThrottle,
        aggregate: Option<AggregateSink>,
    ) -> Self {
        Self {
            records: Vec::new(),
            aggregate,
            gate,
            throttle,
        }
    }

    pub fn push(&mut self, record: TransferRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[TransferRecord] {
        &self.records
    }

    pub fn record(&self, index: usize) -> &TransferRecord {
        &self.records[index]
    }

    pub fn record_mut(&mut self, index: usize) -> &mut TransferRecord {
        &mut self.records[index]
    }

    pub fn snapshots(&self) -> Vec<TransferInfo> {
        self.records.iter().map(TransferRecord::snapshot).collect()
    }

    pub fn index_by_task(&self, task: TaskId) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.task.as_ref().map(|t| t.id()) == Some(task))
    }

    pub fn index_by_url(&self, url: &str) -> Option<usize> {
        self.records.iter().position(|r| r.job.url() == url)
    }

    pub fn index_by_id(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    /// Indexes of records currently occupying an active slot.
    pub fn active_indexes(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_active())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn all_finished(&self) -> bool {
        self.records.iter().all(|r| r.finished)
    }

    pub async fn send_aggregate(&self, event: AggregateEvent) {
        if let Some(tx) = &self.aggregate {
            let _ = tx.send(Ok(event)).await;
        }
    }

    /// Terminates the aggregate stream with `error`. Only the first call does
    /// anything; remaining unit streams keep going.
    pub async fn fail_aggregate(&mut self, error: TransferError) {
        if let Some(tx) = self.aggregate.take() {
            let _ = tx.send(Err(error)).await;
        }
    }

    /// Fills open slots in FIFO order, preferring `preferred` for the first
    /// one. Starting means emitting the record's `Start` event (first time
    /// only) and resuming its task.
    pub async fn start_ready(&mut self, preferred: Option<usize>) {
        let mut preferred = preferred;
        while let Some(index) = self.gate.next_to_start(&self.records, preferred.take()) {
            let record = &mut self.records[index];
            if !record.started {
                record.started = true;
                let info = record.snapshot();
                if let Some(sink) = &record.sink {
                    let _ = sink.send(Ok(UnitEvent::Start { index, info })).await;
                }
            }
            if let Some(task) = &record.task {
                log::debug!("[batch] starting record {} (task {})", index, task.id());
                task.resume();
            }
        }
    }

    /// Applies one progress callback: update counters, emit an update if the
    /// delta clears the throttle. Progress sends never block the actor.
    pub fn progress(&mut self, task: TaskId, total_written: u64, total_expected: u64) {
        let Some(index) = self.index_by_task(task) else {
            log::debug!("[batch] progress from unknown task {}", task);
            return;
        };
        let record = &mut self.records[index];
        if record.finished {
            return;
        }
        record.current_bytes = total_written;
        if total_expected > 0 {
            record.total_bytes = total_expected;
        }
        if self
            .throttle
            .should_emit(record.emitted_bytes, total_written, record.total_bytes)
        {
            record.emitted_bytes = total_written;
            if let Some(sink) = &record.sink {
                let _ = sink.try_send(Ok(UnitEvent::Update {
                    current: total_written,
                    total: record.total_bytes,
                }));
            }
        }
    }

    /// Terminal success for one record: emit `Completed` and close its stream.
    pub async fn complete_record(&mut self, index: usize, body: Bytes) {
        let record = &mut self.records[index];
        if record.finished {
            return;
        }
        record.finished = true;
        record.error = None;
        record.current_bytes = record.current_bytes.max(record.total_bytes);
        let info = record.snapshot();
        log::info!("[batch] record {} completed ({} bytes)", index, body.len());
        if let Some(sink) = record.sink.take() {
            let _ = sink.send(Ok(UnitEvent::Completed { body, info })).await;
        }
    }

    /// Terminal failure for one record: the unit stream ends with the error,
    /// and the first failure in the batch also terminates the aggregate
    /// stream. Other records keep running.
    pub async fn fail_record(&mut self, index: usize, error: TransferError) {
        let record = &mut self.records[index];
        if record.finished {
            return;
        }
        record.finished = true;
        record.error = Some(error.clone());
        log::warn!("[batch] record {} failed: {}", index, error);
        if let Some(sink) = record.sink.take() {
            let _ = sink.send(Err(error.clone())).await;
        }
        self.fail_aggregate(error).await;
    }

    /// Post-terminal bookkeeping. When every record is done, emits
    /// `AllCompleted` (success only), closes the aggregate stream, and clears
    /// the records; otherwise hands the freed slot to the gate. Returns
    /// whether the batch is over.
    pub async fn settle(&mut self) -> bool {
        if !self.all_finished() {
            self.start_ready(None).await;
            return false;
        }
        let clean = self.records.iter().all(|r| r.error.is_none());
        if clean {
            let records = self.snapshots();
            self.send_aggregate(AggregateEvent::AllCompleted { records })
                .await;
        }
        self.aggregate = None;
        self.records.clear();
        true
    }

    /// Terminal cleanup: finish the aggregate stream (with `error` if given),
    /// cancel every task, finish every unit stream, drop the records.
    /// Idempotent — a second call sees an empty batch.
    pub async fn stop(&mut self, error: Option<TransferError>) {
        if let Some(tx) = self.aggregate.take() {
            if let Some(error) = &error {
                let _ = tx.send(Err(error.clone())).await;
            }
        }
        for record in &mut self.records {
            if let Some(task) = &record.task {
                task.cancel();
            }
            if let Some(sink) = record.sink.take() {
                if let Some(error) = &error {
                    let _ = sink.send(Err(error.clone())).await;
                }
            }
            record.finished = true;
            if record.error.is_none() {
                record.error = Some(error.clone().unwrap_or(TransferError::Canceled));
            }
        }
        self.records.clear();
    }
}
