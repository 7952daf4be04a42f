/// Small shared helpers
pub mod backoff;
pub mod query;

pub use backoff::Backoff;
