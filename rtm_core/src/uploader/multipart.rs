//! multipart/form-data spool files.
//!
//! Upload bodies are written to disk before the task exists: one file per
//! record, named by the record id, which doubles as the part boundary. Text
//! parameters come first in their given order, then the payload parts, then
//! the closing boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::descriptor::UploadPayload;
use crate::types::TransferError;

/// Directory name for spooled upload bodies.
pub const SPOOL_DIR_NAME: &str = "ConcurrencyUpload";

const SPOOL_WRITE_BUFFER: usize = 64 * 1024;

pub(crate) fn default_spool_dir() -> PathBuf {
    std::env::temp_dir().join(SPOOL_DIR_NAME)
}

fn io_failure(path: &Path, err: &std::io::Error) -> TransferError {
    TransferError::Io {
        path: path.to_string_lossy().into_owned(),
        message: err.to_string(),
    }
}

/// Writes the full multipart body for one record into `dir`, returning the
/// spool file path.
pub(crate) async fn write_spool(
    dir: &Path,
    boundary: &str,
    payload: &UploadPayload,
    parameters: &[(String, String)],
) -> Result<PathBuf, TransferError> {
    let path = dir.join(boundary);
    let file = tokio::fs::File::create(&path)
        .await
        .map_err(|err| io_failure(&path, &err))?;
    let mut writer = tokio::io::BufWriter::with_capacity(SPOOL_WRITE_BUFFER, file);

    for (name, value) in parameters {
        let head = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n"
        );
        writer
            .write_all(head.as_bytes())
            .await
            .map_err(|err| io_failure(&path, &err))?;
        writer
            .write_all(value.as_bytes())
            .await
            .map_err(|err| io_failure(&path, &err))?;
        writer
            .write_all(b"\r\n")
            .await
            .map_err(|err| io_failure(&path, &err))?;
    }

    match payload {
        UploadPayload::Data {
            bytes,
            field_name,
            file_name,
            mime,
        } => {
            write_file_part(&mut writer, &path, boundary, field_name, file_name, mime, bytes)
                .await?;
        }
        UploadPayload::File {
            path: source,
            field_name,
        } => {
            write_disk_part(&mut writer, &path, boundary, field_name, source).await?;
        }
        UploadPayload::Files { paths, field_name } => {
            for source in paths {
                write_disk_part(&mut writer, &path, boundary, field_name, source).await?;
            }
        }
    }

    writer
        .write_all(format!("--{boundary}--\r\n").as_bytes())
        .await
        .map_err(|err| io_failure(&path, &err))?;
    writer.flush().await.map_err(|err| io_failure(&path, &err))?;
    log::debug!("[spool] wrote multipart body {}", path.display());
    Ok(path)
}

async fn write_disk_part(
    writer: &mut tokio::io::BufWriter<tokio::fs::File>,
    spool_path: &Path,
    boundary: &str,
    field_name: &str,
    source: &Path,
) -> Result<(), TransferError> {
    let bytes = tokio::fs::read(source)
        .await
        .map_err(|err| io_failure(source, &err))?;
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let mime = mime_for_path(source);
    write_file_part(
        writer, spool_path, boundary, field_name, &file_name, mime, &bytes,
    )
    .await
}

async fn write_file_part(
    writer: &mut tokio::io::BufWriter<tokio::fs::File>,
    spool_path: &Path,
    boundary: &str,
    field_name: &str,
    file_name: &str,
    mime: &str,
    bytes: &[u8],
) -> Result<(), TransferError> {
    let head = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{field_name}\"; \
         filename=\"{file_name}\"\r\nContent-Type: {mime}\r\n\r\n"
    );
    writer
        .write_all(head.as_bytes())
        .await
        .map_err(|err| io_failure(spool_path, &err))?;
    writer
        .write_all(bytes)
        .await
        .map_err(|err| io_failure(spool_path, &err))?;
    writer
        .write_all(b"\r\n")
        .await
        .map_err(|err| io_failure(spool_path, &err))?;
    Ok(())
}

/// Maps a file extension to a MIME type for uploaded file parts.
pub(crate) fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "png"          => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif"          => "image/gif",
        "webp"         => "image/webp",
        "svg"          => "image/svg+xml",
        "mp4"          => "video/mp4",
        "mkv"          => "video/x-matroska",
        "webm"         => "video/webm",
        "mov"          => "video/quicktime",
        "mp3"          => "audio/mpeg",
        "wav"          => "audio/wav",
        "flac"         => "audio/flac",
        "ogg"          => "audio/ogg",
        "pdf"          => "application/pdf",
        "zip"          => "application/zip",
        "gz"           => "application/gzip",
        "tar"          => "application/x-tar",
        "json"         => "application/json",
        "xml"          => "application/xml",
        "txt"          => "text/plain",
        "csv"          => "text/csv",
        "html" | "htm" => "text/html",
        _              => "application/octet-stream",
    }
}

/// The multipart `Content-Type` merged under the application's headers; an
/// application-supplied content type wins regardless of key casing.
pub(crate) fn merged_upload_headers(
    boundary: &str,
    application: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut headers = HashMap::with_capacity(application.len() + 1);
    if !application
        .keys()
        .any(|k| k.eq_ignore_ascii_case("content-type"))
    {
        headers.insert(
            "Content-Type".to_string(),
            format!("multipart/form-data; boundary={boundary}"),
        );
    }
    headers.extend(
        application
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_lookup_covers_common_extensions() {
        assert_eq!(mime_for_path(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_for_path(Path::new("a.tar")), "application/x-tar");
        assert_eq!(mime_for_path(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn generated_content_type_carries_the_boundary() {
        let headers = merged_upload_headers("rec-1", &HashMap::new());
        assert_eq!(
            headers.get("Content-Type").map(String::as_str),
            Some("multipart/form-data; boundary=rec-1")
        );
    }

    #[test]
    fn application_content_type_wins_case_insensitively() {
        let app = HashMap::from([("content-type".to_string(), "application/custom".to_string())]);
        let headers = merged_upload_headers("rec-1", &app);
        assert_eq!(headers.len(), 1);
        assert_eq!(
            headers.get("content-type").map(String::as_str),
            Some("application/custom")
        );
    }
}
