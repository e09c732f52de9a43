use std::path::{Path, PathBuf};

use bytes::Bytes;
use wiremock::matchers::{header_regex, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rtm_core::{
    AggregateEvent, TransferError, UnitEvent, UploadPayload, Uploadable, Uploader, UploaderConfig,
};

fn unique_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rtm-test-{}-{}", tag, uuid::Uuid::new_v4()))
}

fn uploader_with_spool(spool: &Path) -> Uploader {
    Uploader::new(UploaderConfig {
        spool_dir: Some(spool.to_path_buf()),
        ..Default::default()
    })
}

// ---------------------------------------------------------------
// Success with response-body capture
// ---------------------------------------------------------------

#[tokio::test]
async fn test_upload_success_delivers_server_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/up"))
        .and(header_regex("Content-Type", "multipart/form-data; boundary="))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .mount(&server)
        .await;

    let spool = unique_dir("up-ok");
    let uploader = uploader_with_spool(&spool);
    let payload = UploadPayload::Data {
        bytes: Bytes::from(vec![7u8; 1024]),
        field_name: "file".to_string(),
        file_name: "blob.bin".to_string(),
        mime: "application/octet-stream".to_string(),
    };
    let mut stream = uploader
        .events_one(Uploadable::new(format!("{}/up", server.uri()), payload))
        .await;

    match stream.recv().await.unwrap().unwrap() {
        UnitEvent::Start { index, .. } => assert_eq!(index, 0),
        other => panic!("expected Start, got {:?}", other),
    }

    let mut completed = None;
    while let Some(event) = stream.recv().await {
        match event.unwrap() {
            UnitEvent::Update { current, total } => {
                assert!(total > 0, "upload totals are known from the spool size");
                assert!(current <= total);
            }
            UnitEvent::Completed { body, info } => {
                completed = Some((body, info));
            }
            UnitEvent::Start { .. } => panic!("Start emitted twice"),
        }
    }

    let (body, info) = completed.expect("upload should complete");
    assert_eq!(&body[..], b"{\"ok\":true}");
    assert!(info.is_completed());

    let _ = std::fs::remove_dir_all(&spool);
}

// ---------------------------------------------------------------
// Multipart round trip: the spool file parses back to the field set
// ---------------------------------------------------------------

/// One parsed multipart part: (disposition line, content-type line, value).
struct Part {
    disposition: String,
    content_type: Option<String>,
    value: Vec<u8>,
}

fn parse_multipart(body: &[u8], boundary: &str) -> Vec<Part> {
    let text = body.to_vec();
    let marker = format!("--{}", boundary).into_bytes();
    let mut sections: Vec<Vec<u8>> = Vec::new();
    let mut rest = &text[..];
    loop {
        let Some(pos) = rest
            .windows(marker.len())
            .position(|w| w == &marker[..])
        else {
            break;
        };
        sections.push(rest[..pos].to_vec());
        rest = &rest[pos + marker.len()..];
    }
    sections.push(rest.to_vec());

    assert!(sections.first().is_some_and(|s| s.is_empty()), "body must open with the boundary");
    assert_eq!(sections.pop().as_deref(), Some(&b"--\r\n"[..]), "body must close with --boundary--");
    sections.remove(0);

    sections
        .into_iter()
        .map(|section| {
            let section = section
                .strip_prefix(b"\r\n")
                .expect("part must start after CRLF")
                .to_vec();
            let split = section
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .expect("part must separate headers from value");
            let headers = String::from_utf8(section[..split].to_vec()).unwrap();
            let value = section[split + 4..]
                .strip_suffix(b"\r\n")
                .expect("part value must end with CRLF")
                .to_vec();
            let mut disposition = String::new();
            let mut content_type = None;
            for line in headers.lines() {
                if let Some(rest) = line.strip_prefix("Content-Disposition: ") {
                    disposition = rest.to_string();
                } else if let Some(rest) = line.strip_prefix("Content-Type: ") {
                    content_type = Some(rest.to_string());
                }
            }
            Part {
                disposition,
                content_type,
                value,
            }
        })
        .collect()
}

#[tokio::test]
async fn test_spool_file_parses_back_to_the_original_fields_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let source_dir = unique_dir("up-src");
    std::fs::create_dir_all(&source_dir).unwrap();
    let notes = source_dir.join("notes.txt");
    let image = source_dir.join("shot.png");
    std::fs::write(&notes, b"some notes").unwrap();
    std::fs::write(&image, vec![0x89u8, b'P', b'N', b'G']).unwrap();

    let spool = unique_dir("up-rt");
    let uploader = uploader_with_spool(&spool);
    let descriptor = Uploadable::new(
        format!("{}/up", server.uri()),
        UploadPayload::Files {
            paths: vec![notes.clone(), image.clone()],
            field_name: "docs".to_string(),
        },
    )
    .add_parameter("a", "1")
    .add_parameter("b", "2");

    let mut stream = uploader.events(vec![descriptor]).await;

    let record_id = match stream.recv().await.unwrap().unwrap() {
        AggregateEvent::Start { records } => records[0].id.clone(),
        other => panic!("expected Start, got {:?}", other),
    };
    let mut unit = match stream.recv().await.unwrap().unwrap() {
        AggregateEvent::Unit { stream, .. } => stream,
        other => panic!("expected Unit, got {:?}", other),
    };
    let mut completed = false;
    while let Some(event) = unit.recv().await {
        if let UnitEvent::Completed { .. } = event.unwrap() {
            completed = true;
        }
    }
    assert!(completed);

    // The spool file is named by the record id, which is also the boundary.
    let body = std::fs::read(spool.join(&record_id)).unwrap();
    let parts = parse_multipart(&body, &record_id);
    assert_eq!(parts.len(), 4);

    assert_eq!(parts[0].disposition, "form-data; name=\"a\"");
    assert_eq!(parts[0].value, b"1");
    assert!(parts[0].content_type.is_none());

    assert_eq!(parts[1].disposition, "form-data; name=\"b\"");
    assert_eq!(parts[1].value, b"2");

    assert_eq!(
        parts[2].disposition,
        "form-data; name=\"docs\"; filename=\"notes.txt\""
    );
    assert_eq!(parts[2].content_type.as_deref(), Some("text/plain"));
    assert_eq!(parts[2].value, b"some notes");

    assert_eq!(
        parts[3].disposition,
        "form-data; name=\"docs\"; filename=\"shot.png\""
    );
    assert_eq!(parts[3].content_type.as_deref(), Some("image/png"));
    assert_eq!(parts[3].value, vec![0x89u8, b'P', b'N', b'G']);

    let _ = std::fs::remove_dir_all(&source_dir);
    let _ = std::fs::remove_dir_all(&spool);
}

// ---------------------------------------------------------------
// Size gate
// ---------------------------------------------------------------

#[tokio::test]
async fn test_oversized_spool_fails_before_any_start() {
    let spool = unique_dir("up-big");
    let uploader = uploader_with_spool(&spool);
    let payload = UploadPayload::Data {
        bytes: Bytes::from(vec![1u8; 4096]),
        field_name: "file".to_string(),
        file_name: "big.bin".to_string(),
        mime: "application/octet-stream".to_string(),
    };
    // The server is never contacted; the address just has to parse.
    let descriptor =
        Uploadable::new("http://127.0.0.1:9/up", payload).with_max_bytes(1000);
    let mut stream = uploader.events_one(descriptor).await;

    match stream.recv().await.unwrap() {
        Err(TransferError::OverSizeLimit { size, limit }) => {
            assert!(size > limit);
            assert_eq!(limit, 1000);
        }
        other => panic!("expected OverSizeLimit, got {:?}", other),
    }
    assert!(stream.recv().await.is_none(), "no events may follow the failure");

    let _ = std::fs::remove_dir_all(&spool);
}

// ---------------------------------------------------------------
// Server rejection
// ---------------------------------------------------------------

#[tokio::test]
async fn test_upload_server_error_fails_the_unit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("nope"))
        .mount(&server)
        .await;

    let spool = unique_dir("up-err");
    let uploader = uploader_with_spool(&spool);
    let payload = UploadPayload::Data {
        bytes: Bytes::from_static(b"payload"),
        field_name: "file".to_string(),
        file_name: "x.bin".to_string(),
        mime: "application/octet-stream".to_string(),
    };
    let mut stream = uploader
        .events_one(Uploadable::new(format!("{}/up", server.uri()), payload))
        .await;

    let mut outcome = None;
    while let Some(event) = stream.recv().await {
        match event {
            Ok(UnitEvent::Start { .. }) | Ok(UnitEvent::Update { .. }) => {}
            Ok(other) => panic!("unexpected event: {:?}", other),
            Err(err) => outcome = Some(err),
        }
    }
    assert_eq!(outcome, Some(TransferError::ServerError(500)));

    let _ = std::fs::remove_dir_all(&spool);
}

#[tokio::test]
async fn test_pause_without_a_batch_is_a_no_op() {
    let uploader = Uploader::new(UploaderConfig::default());
    uploader.pause().await;
    uploader.resume().await;
    uploader.stop(None).await;
}
