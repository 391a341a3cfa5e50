//! Small value types shared across modules.

mod retry_policy;

pub use retry_policy::RetryPolicy;
