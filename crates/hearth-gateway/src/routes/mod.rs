//! REST route modules mounted by the request/reply adapter.

pub mod scheduler;
