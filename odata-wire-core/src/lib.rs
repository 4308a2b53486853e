//! Reading and writing of OData batch payloads.
//!
//! A batch groups several HTTP operations into one message, either as a
//! `multipart/mixed` body or as a JSON document. Operations that must succeed
//! or fail together are wrapped in a changeset; inside a changeset a request
//! may refer to the entity created by an earlier one through `$<Content-ID>`.
//!
//! Writers and readers are split into a sans-IO core and thin drivers. The
//! cores never touch a stream: the writer renders into a byte buffer and the
//! reader parses from one, asking for more input when it runs dry. The
//! [`BatchWriter`] and [`BatchReader`] drivers move bytes over `std::io`,
//! [`AsyncBatchWriter`] and [`AsyncBatchReader`] over `tokio::io`.

pub mod boundary;
pub mod buffer;
pub mod config;
pub mod error;
pub mod format;
pub mod headers;
pub mod logging;
pub mod message;
pub mod reader;
pub mod uri;
pub mod writer;

pub use buffer::ensure_array_size;
pub use config::{BatchSettings, BatchSettingsBuilder, EnvLoader, MessageQuotas};
pub use error::{BatchError, Result};
pub use format::{BatchFormat, PayloadKind, detect_payload_kind};
pub use headers::OperationHeaders;
pub use logging::{LogConfig, LogFormat, LogLevel, LogOutput};
pub use message::{
    MessageKind, ODataRequestMessage, ODataResponseMessage, OperationHost, OperationMessage,
    OperationRequestMessage, OperationResponseMessage, OperationStage, RequestLine,
};
pub use reader::ReaderState;
pub use reader::blocking::{BatchReader, OperationReadStream, ReadHost};
pub use reader::nonblocking::{AsyncBatchReader, AsyncOperationReadStream, AsyncReadHost};
pub use uri::{
    ContentIdScope, PayloadUriConverter, PayloadUriOption, SharedUriConverter,
    create_operation_request_uri,
};
pub use writer::WriterState;
pub use writer::blocking::{BatchWriter, OperationWriteStream, WriteHost};
pub use writer::nonblocking::{AsyncBatchWriter, AsyncOperationWriteStream, AsyncWriteHost};
