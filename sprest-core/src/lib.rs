// Core of the fluent SharePoint / Graph client: URL and query composition,
// raw request/response values, OData response parsing and hydration.

pub mod error;
pub mod hydrate;
pub mod ids;
pub mod parser;
pub mod query;
pub mod response;
pub mod url;

pub use error::{Error, ODataError, Result};
pub use hydrate::{
    entity_url, hydrate, Entity, EntityArrayParser, EntityFactory, EntityParser,
    MetadataConvention,
};
pub use ids::{BatchId, RequestSeq, SequenceAllocator};
pub use parser::{
    check_status, normalize_odata, Blob, BlobParser, BufferParser, ContentKind, DefaultParser,
    JsonParser, LambdaParser, ODataParser, Payload, ResponseParser, TextParser, ValueParser,
};
pub use query::Composer;
pub use response::{HttpRequest, RawResponse};

// Re-exported so downstream crates share one `http` version for methods and headers.
pub use http;
