pub mod coordinator;
pub(crate) mod multipart;

pub use coordinator::{Uploader, UploaderConfig};
