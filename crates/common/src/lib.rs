pub mod http;
pub mod sha256;
pub mod shutdown;
pub mod types;

pub use types::RequestId;
