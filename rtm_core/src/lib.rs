//! Concurrent HTTP transfer engine.
//!
//! Two coordinators — [`Downloader`] and [`Uploader`] — run batches of
//! transfers with bounded parallelism and report their lifecycle as event
//! streams: one stream per transfer, multiplexed under one stream per batch.
//! Both support pause/resume (downloads with server-assisted resume tokens
//! where the server allows it), per-record cancellation, and terminal
//! `stop`. A standalone [`reachability`] observer reports connectivity
//! changes.
//!
//! Streams are hot: calling `events(...)` starts the transfers, and the
//! returned stream must be consumed to observe them.

mod batch;
pub mod descriptor;
pub mod events;
pub mod http;
pub mod reachability;
pub mod types;

pub mod downloader;
pub mod uploader;

pub use descriptor::{Downloadable, UploadPayload, Uploadable};
pub use downloader::{Downloader, DownloaderConfig};
pub use events::{AggregateEvent, AggregateStream, UnitEvent, UnitStream};
pub use http::SessionConfig;
pub use types::{CachePolicy, TransferError, TransferInfo, TransferState};
pub use uploader::{Uploader, UploaderConfig};
