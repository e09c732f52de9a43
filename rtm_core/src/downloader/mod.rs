pub mod coordinator;

pub use coordinator::{Downloader, DownloaderConfig};
