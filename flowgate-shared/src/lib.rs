//! Types shared across flowgate crates.

pub mod errors;

pub use errors::{BoxError, FlowgateError, FlowgateResult};
