//! Integration tests for common batch workflows.
//!
//! Payloads are written with one driver and read back with another, so
//! these tests cover both halves of the wire format at once.

use odata_wire::prelude::*;
use odata_wire::{OperationHeaders, PayloadKind, detect_payload_kind};
use std::io::{Read, Write};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn settings() -> BatchSettings {
    BatchSettings::builder()
        .base_uri(Url::parse("http://host/service/").unwrap())
        .build()
}

fn multipart(boundary: &str) -> BatchFormat {
    BatchFormat::multipart_with_boundary(boundary).unwrap()
}

// =============================================================================
// Multipart round trips
// =============================================================================

fn write_changeset_with_reference() -> Vec<u8> {
    let mut writer = BatchWriter::new(Vec::new(), MessageKind::Request, multipart("b1"), settings());
    writer.write_start_batch().unwrap();
    assert_eq!(writer.write_start_changeset_with_id("c1").unwrap(), "c1");
    {
        let mut request = writer
            .create_operation_request_message(Method::POST, "Customers", Some("1"))
            .unwrap();
        request.set_header("Content-Type", "application/json").unwrap();
        let mut stream = request.get_stream().unwrap();
        stream.write_all(br#"{"Name":"Contoso"}"#).unwrap();
    }
    {
        let mut request = writer
            .create_operation_request_message(Method::POST, "$1/Orders", Some("2"))
            .unwrap();
        request.set_header("Content-Type", "application/json").unwrap();
        let mut stream = request.get_stream().unwrap();
        stream.write_all(br#"{"Amount":10}"#).unwrap();
    }
    writer.write_end_changeset().unwrap();
    writer.write_end_batch().unwrap();
    assert_eq!(writer.state(), WriterState::BatchCompleted);
    writer.into_inner()
}

#[test]
fn test_changeset_with_content_id_reference_round_trip() {
    let payload = write_changeset_with_reference();
    let text = String::from_utf8(payload.clone()).unwrap();
    assert!(text.starts_with("--b1\r\n"));
    assert!(text.contains("Content-Type: multipart/mixed; boundary=c1\r\n"));
    assert!(text.contains("Content-ID: 1\r\n"));
    assert!(text.contains("POST $1/Orders HTTP/1.1\r\n"));
    assert!(text.ends_with("--c1--\r\n--b1--\r\n"));

    let mut reader = BatchReader::new(payload.as_slice(), MessageKind::Request, multipart("b1"), settings());
    assert!(reader.read().unwrap());
    assert_eq!(reader.state(), ReaderState::ChangesetStart);

    assert!(reader.read().unwrap());
    {
        let mut request = reader.create_operation_request_message().unwrap();
        assert_eq!(request.method(), &Method::POST);
        assert_eq!(request.url().as_str(), "http://host/service/Customers");
        assert_eq!(request.content_id(), Some("1"));
        assert_eq!(request.group_id(), Some("c1"));
        let mut body = String::new();
        request.get_stream().unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, r#"{"Name":"Contoso"}"#);
    }

    assert!(reader.read().unwrap());
    {
        let mut request = reader.create_operation_request_message().unwrap();
        assert_eq!(request.raw_url(), "$1/Orders");
        assert_eq!(request.url().as_str(), "http://host/service/Customers/Orders");
        assert_eq!(request.content_id(), Some("2"));
        let mut body = String::new();
        request.get_stream().unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, r#"{"Amount":10}"#);
    }

    assert!(reader.read().unwrap());
    assert_eq!(reader.state(), ReaderState::ChangesetEnd);
    assert!(!reader.read().unwrap());
    assert_eq!(reader.state(), ReaderState::Completed);
}

#[test]
fn test_empty_changeset_round_trip() {
    let mut writer = BatchWriter::new(Vec::new(), MessageKind::Request, multipart("b1"), settings());
    writer.write_start_batch().unwrap();
    writer.write_start_changeset_with_id("c1").unwrap();
    writer.write_end_changeset().unwrap();
    writer.write_end_batch().unwrap();

    let payload = writer.into_inner();
    let text = String::from_utf8(payload.clone()).unwrap();
    assert!(text.contains("--c1--"));
    assert!(!text.contains("--c1\r\n"));

    let mut reader = BatchReader::new(payload.as_slice(), MessageKind::Request, multipart("b1"), settings());
    assert!(reader.read().unwrap());
    assert_eq!(reader.state(), ReaderState::ChangesetStart);
    assert!(reader.read().unwrap());
    assert_eq!(reader.state(), ReaderState::ChangesetEnd);
    assert!(!reader.read().unwrap());
}

#[test]
fn test_content_ids_are_scoped_to_their_changeset() {
    let mut writer = BatchWriter::new(Vec::new(), MessageKind::Request, multipart("b1"), settings());
    writer.write_start_batch().unwrap();
    for changeset in ["c1", "c2"] {
        writer.write_start_changeset_with_id(changeset).unwrap();
        writer
            .create_operation_request_message(Method::POST, "A", Some("1"))
            .unwrap();
        writer
            .create_operation_request_message(Method::POST, "$1/B", Some("2"))
            .unwrap();
        writer.write_end_changeset().unwrap();
    }
    writer.write_end_batch().unwrap();
    let payload = writer.into_inner();

    let mut reader = BatchReader::new(payload.as_slice(), MessageKind::Request, multipart("b1"), settings());
    let mut urls = Vec::new();
    let mut groups = Vec::new();
    while reader.read().unwrap() {
        if reader.state() == ReaderState::Operation {
            let request = reader.create_operation_request_message().unwrap();
            urls.push(request.url().to_string());
            groups.push(request.group_id().map(str::to_string));
        }
    }
    assert_eq!(
        urls,
        [
            "http://host/service/A",
            "http://host/service/A/B",
            "http://host/service/A",
            "http://host/service/A/B",
        ]
    );
    assert_eq!(
        groups,
        [
            Some("c1".to_string()),
            Some("c1".to_string()),
            Some("c2".to_string()),
            Some("c2".to_string()),
        ]
    );
}

#[test]
fn test_duplicate_content_id_in_one_changeset_is_rejected_on_read() {
    let payload = "--b1\r\n\
        Content-Type: multipart/mixed; boundary=c1\r\n\
        \r\n\
        --c1\r\n\
        Content-Type: application/http\r\n\
        Content-Transfer-Encoding: binary\r\n\
        Content-ID: 1\r\n\
        \r\n\
        POST A HTTP/1.1\r\n\
        \r\n\
        \r\n\
        --c1\r\n\
        Content-Type: application/http\r\n\
        Content-Transfer-Encoding: binary\r\n\
        Content-ID: 1\r\n\
        \r\n\
        POST B HTTP/1.1\r\n\
        \r\n\
        \r\n\
        --c1--\r\n\
        --b1--\r\n";
    let mut reader = BatchReader::new(payload.as_bytes(), MessageKind::Request, multipart("b1"), settings());
    assert!(reader.read().unwrap());
    assert_eq!(reader.state(), ReaderState::ChangesetStart);

    assert!(reader.read().unwrap());
    reader.create_operation_request_message().unwrap();

    assert!(reader.read().unwrap());
    let err = reader.create_operation_request_message().err();
    assert!(matches!(err, Some(BatchError::DuplicateContentId(ref id)) if id == "1"));
    assert_eq!(reader.state(), ReaderState::Exception);
}

#[test]
fn test_empty_batch_is_a_single_end_boundary() {
    let mut writer = BatchWriter::new(Vec::new(), MessageKind::Response, multipart("b1"), settings());
    writer.write_start_batch().unwrap();
    writer.write_end_batch().unwrap();
    let payload = writer.into_inner();
    assert_eq!(payload, b"--b1--\r\n");

    let mut reader = BatchReader::new(payload.as_slice(), MessageKind::Response, multipart("b1"), settings());
    assert!(!reader.read().unwrap());
    assert_eq!(reader.state(), ReaderState::Completed);
    assert!(!reader.read().unwrap());
}

#[test]
fn test_create_after_end_batch_is_a_state_violation() {
    let mut writer = BatchWriter::new(Vec::new(), MessageKind::Request, multipart("b1"), settings());
    writer.write_start_batch().unwrap();
    writer.write_end_batch().unwrap();

    let err = writer
        .create_operation_request_message(Method::GET, "Customers", None)
        .err()
        .unwrap();
    assert!(err.is_state_violation());
    assert_eq!(writer.state(), WriterState::Exception);
}

#[test]
fn test_get_is_rejected_inside_changeset() {
    let mut writer = BatchWriter::new(Vec::new(), MessageKind::Request, multipart("b1"), settings());
    writer.write_start_batch().unwrap();
    writer.write_start_changeset().unwrap();
    let err = writer
        .create_operation_request_message(Method::GET, "Customers", None)
        .err()
        .unwrap();
    assert!(matches!(err, BatchError::InvalidChangesetMethod(_)));
    assert_eq!(writer.state(), WriterState::Exception);
}

// =============================================================================
// Body framing
// =============================================================================

#[test]
fn test_content_length_wins_over_boundary_lookalikes() {
    let payload = "--b1\r\n\
        Content-Type: application/http\r\n\
        Content-Transfer-Encoding: binary\r\n\
        \r\n\
        HTTP/1.1 200 OK\r\n\
        Content-Length: 5\r\n\
        \r\n\
        --b1-\r\n\
        --b1\r\n\
        Content-Type: application/http\r\n\
        Content-Transfer-Encoding: binary\r\n\
        \r\n\
        HTTP/1.1 204 No Content\r\n\
        \r\n\
        abc\r\n\
        --b1--\r\n";
    let mut reader = BatchReader::new(payload.as_bytes(), MessageKind::Response, multipart("b1"), settings());

    assert!(reader.read().unwrap());
    {
        let mut response = reader.create_operation_response_message().unwrap();
        assert_eq!(response.status_code(), StatusCode::OK);
        let mut body = Vec::new();
        response.get_stream().unwrap().read_to_end(&mut body).unwrap();
        assert_eq!(body, b"--b1-");
    }

    assert!(reader.read().unwrap());
    {
        let mut response = reader.create_operation_response_message().unwrap();
        assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
        let mut buf = [0u8; 64];
        let mut stream = response.get_stream().unwrap();
        let count = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"abc");
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    assert!(!reader.read().unwrap());
}

#[test]
fn test_header_lookup_prefers_exact_case() {
    let mut headers = OperationHeaders::new();
    headers.add("Content-Type", "application/json").unwrap();
    headers.add("content-type", "text/plain").unwrap();

    assert_eq!(headers.get("Content-Type").unwrap(), Some("application/json"));
    assert_eq!(headers.get("content-type").unwrap(), Some("text/plain"));
    assert!(matches!(
        headers.get("CONTENT-TYPE"),
        Err(BatchError::AmbiguousHeader(_))
    ));
    assert!(matches!(
        headers.add("Content-Type", "text/html"),
        Err(BatchError::DuplicateHeader(_))
    ));
}

#[test]
fn test_detect_payload_kind_from_headers() {
    let mut headers = OperationHeaders::new();
    headers.add("Content-Type", "multipart/mixed; boundary=b1").unwrap();
    assert_eq!(detect_payload_kind(&headers), Some(PayloadKind::Batch));

    let format = BatchFormat::from_headers(&headers).unwrap();
    assert_eq!(format.boundary(), Some("b1"));
}

// =============================================================================
// JSON batches
// =============================================================================

#[test]
fn test_json_responses_round_trip() {
    let mut writer = BatchWriter::new(Vec::new(), MessageKind::Response, BatchFormat::json(), settings());
    writer.write_start_batch().unwrap();
    writer.write_start_changeset_with_id("g1").unwrap();
    {
        let mut response = writer.create_operation_response_message().unwrap();
        response.set_status_code(StatusCode::CREATED).unwrap();
        response.set_header("Content-Type", "application/json").unwrap();
        response.get_stream().unwrap().write_all(br#"{"ID":1}"#).unwrap();
    }
    writer.write_end_changeset().unwrap();
    {
        let mut response = writer.create_operation_response_message().unwrap();
        response.set_status_code(StatusCode::OK).unwrap();
        response.set_header("Content-Type", "text/plain").unwrap();
        response.get_stream().unwrap().write_all(b"plain text").unwrap();
    }
    writer.write_end_batch().unwrap();

    let payload = writer.into_inner();
    let document: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    let responses = document["responses"].as_array().unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["atomicityGroup"], "g1");
    assert_eq!(responses[0]["status"], 201);
    assert_eq!(responses[0]["body"]["ID"], 1);
    assert_eq!(responses[1]["body"], "plain text");

    let mut reader = BatchReader::new(payload.as_slice(), MessageKind::Response, BatchFormat::json(), settings());
    assert!(reader.read().unwrap());
    assert_eq!(reader.state(), ReaderState::ChangesetStart);
    assert!(reader.read().unwrap());
    {
        let mut response = reader.create_operation_response_message().unwrap();
        assert_eq!(response.status_code(), StatusCode::CREATED);
        assert_eq!(response.group_id(), Some("g1"));
        let mut body = String::new();
        response.get_stream().unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, r#"{"ID":1}"#);
    }
    assert!(reader.read().unwrap());
    assert_eq!(reader.state(), ReaderState::ChangesetEnd);
    assert!(reader.read().unwrap());
    {
        let mut response = reader.create_operation_response_message().unwrap();
        assert_eq!(response.status_code(), StatusCode::OK);
        let mut body = String::new();
        response.get_stream().unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "plain text");
    }
    assert!(!reader.read().unwrap());
}

#[test]
fn test_reading_requests_from_a_response_batch_fails() {
    let document = r#"{"responses": [{"id": "1", "status": 200}]}"#;
    let mut reader = BatchReader::new(document.as_bytes(), MessageKind::Response, BatchFormat::json(), settings());
    assert!(reader.read().unwrap());
    assert!(reader.create_operation_request_message().is_err());
    assert_eq!(reader.state(), ReaderState::Exception);
}

// =============================================================================
// Async drivers
// =============================================================================

#[test]
fn test_async_multipart_round_trip() {
    tokio_test::block_on(async {
        let mut writer = AsyncBatchWriter::new(Vec::new(), MessageKind::Request, multipart("b1"), settings());
        writer.write_start_batch().await.unwrap();
        {
            let mut request = writer
                .create_operation_request_message(Method::PATCH, "Customers(1)", None)
                .await
                .unwrap();
            request.set_header("Content-Type", "text/plain").unwrap();
            let mut stream = request.get_stream().unwrap();
            stream.write_all(b"async body").await.unwrap();
            stream.close().await.unwrap();
        }
        writer.write_end_batch().await.unwrap();
        let payload = writer.into_inner();

        // Hand the payload over in uneven pieces.
        let (head, tail) = payload.split_at(payload.len() / 3);
        let input = tokio_test::io::Builder::new().read(head).read(tail).build();
        let mut reader = AsyncBatchReader::new(input, MessageKind::Request, multipart("b1"), settings());

        assert!(reader.read().await.unwrap());
        {
            let mut request = reader.create_operation_request_message().unwrap();
            assert_eq!(request.method(), &Method::PATCH);
            assert_eq!(request.url().as_str(), "http://host/service/Customers(1)");
            assert_eq!(request.group_id(), None);
            let mut body = String::new();
            request.get_stream().unwrap().read_to_string(&mut body).await.unwrap();
            assert_eq!(body, "async body");
        }
        assert!(!reader.read().await.unwrap());
        assert_eq!(reader.state(), ReaderState::Completed);
    });
}
