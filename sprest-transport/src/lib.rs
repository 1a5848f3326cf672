pub mod batch_codec;
#[cfg(feature = "reqwest-transport")]
pub mod http_client;
pub mod mock;
pub mod throttle;
pub mod transport;

pub use batch_codec::{BatchFormat, BatchFormatKind, CodecError, GraphBatchFormat, SharePointBatchFormat};
#[cfg(feature = "reqwest-transport")]
pub use http_client::ReqwestTransport;
pub use mock::MockTransport;
pub use throttle::{retry_after, send_with_retry, BackoffStrategy, RetryConfig};
pub use transport::{HttpTransport, TransportError};
