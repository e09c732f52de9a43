pub mod download;
pub mod upload;

pub use download::Downloadable;
pub use upload::{UploadPayload, Uploadable};
