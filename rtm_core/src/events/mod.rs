//! Event types for the two stream levels and their channel-backed streams.
//!
//! Each stream is the receiving half of a bounded mpsc channel; the
//! coordinator owns the sending half. An `Err` item is terminal: the
//! coordinator drops its sender right after sending one, so the stream ends.

pub mod throttle;

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::types::{TransferError, TransferInfo};

/// Buffer for per-record event channels.
pub(crate) const UNIT_EVENT_BUFFER: usize = 256;

/// Buffer for per-batch event channels.
pub(crate) const AGGREGATE_EVENT_BUFFER: usize = 64;

/// Events on one record's stream.
#[derive(Debug)]
pub enum UnitEvent {
    /// Emitted exactly once, immediately before the record's task is resumed
    /// for the first time.
    Start { index: usize, info: TransferInfo },
    /// Progress delta that passed the throttle.
    Update { current: u64, total: u64 },
    /// Terminal. For downloads `body` is the downloaded bytes; for uploads it
    /// is the accumulated server response.
    Completed { body: Bytes, info: TransferInfo },
}

/// Events on one batch's stream.
#[derive(Debug)]
pub enum AggregateEvent {
    /// Emitted once, before any `Unit` event.
    Start { records: Vec<TransferInfo> },
    /// One per record, in submission order.
    Unit { index: usize, stream: UnitStream },
    /// Emitted once, after every unit stream completed successfully.
    AllCompleted { records: Vec<TransferInfo> },
}

pub(crate) type UnitSink = mpsc::Sender<Result<UnitEvent, TransferError>>;
pub(crate) type AggregateSink = mpsc::Sender<Result<AggregateEvent, TransferError>>;

/// Receiving end of one record's event stream.
#[derive(Debug)]
pub struct UnitStream {
    rx: mpsc::Receiver<Result<UnitEvent, TransferError>>,
}

impl UnitStream {
    pub async fn recv(&mut self) -> Option<Result<UnitEvent, TransferError>> {
        self.rx.recv().await
    }
}

impl Stream for UnitStream {
    type Item = Result<UnitEvent, TransferError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Receiving end of one batch's event stream.
#[derive(Debug)]
pub struct AggregateStream {
    rx: mpsc::Receiver<Result<AggregateEvent, TransferError>>,
}

impl AggregateStream {
    pub async fn recv(&mut self) -> Option<Result<AggregateEvent, TransferError>> {
        self.rx.recv().await
    }
}

impl Stream for AggregateStream {
    type Item = Result<AggregateEvent, TransferError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub(crate) fn unit_channel() -> (UnitSink, UnitStream) {
    let (tx, rx) = mpsc::channel(UNIT_EVENT_BUFFER);
    (tx, UnitStream { rx })
}

pub(crate) fn aggregate_channel() -> (AggregateSink, AggregateStream) {
    let (tx, rx) = mpsc::channel(AGGREGATE_EVENT_BUFFER);
    (tx, AggregateStream { rx })
}
