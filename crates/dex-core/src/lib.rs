pub mod error;
pub mod fakes;
pub mod stores;
pub mod tools;
pub mod traits;
pub mod types;

pub use error::{GatewayError, UpstreamError};
pub use traits::*;
pub use types::*;
