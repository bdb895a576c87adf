pub mod classify;
pub mod client;
pub mod credential_pool;
pub mod fingerprint;
pub mod openai_compat;
pub mod response_cache;
pub mod retry;

pub use classify::{DefaultClassifier, ErrorClass, ErrorClassifier};
pub use client::LanguageModelClient;
pub use credential_pool::{CredentialPool, FailureKind, Lease, PoolEvent, PoolSettings, PoolStats};
pub use openai_compat::OpenAiCompatBackend;
pub use response_cache::{CacheTtls, ResponseCache};
pub use retry::RetryPolicy;
