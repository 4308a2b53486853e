// odata-wire - OData batch payloads for Rust
//
// This library reads and writes OData batch requests and responses in the
// multipart/mixed and JSON formats, over blocking or async streams.

// Re-export core functionality
pub use odata_wire_core::*;

// Re-export the types that appear in the public API
pub use http::{Method, StatusCode};
pub use url::Url;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        AsyncBatchReader,
        AsyncBatchWriter,
        BatchError,
        BatchFormat,
        BatchReader,
        BatchSettings,
        BatchWriter,
        ContentIdScope,
        MessageKind,
        // Message traits
        ODataRequestMessage,
        ODataResponseMessage,
        OperationHeaders,
        OperationRequestMessage,
        OperationResponseMessage,
        PayloadUriOption,
        ReaderState,
        Result,
        WriterState,
    };
    pub use http::{Method, StatusCode};
    pub use url::Url;
}
