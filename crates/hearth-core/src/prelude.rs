//! Convenience re-exports for downstream crates.
//!
//! ```rust,ignore
//! use hearth_core::prelude::*;
//! ```

pub use crate::client::{ClientInfo, Principal};
pub use crate::context::{Protocol, RequestContext};
pub use crate::envelope::{EnvelopeMetadata, MessageEnvelope};
pub use crate::error::{ApiError, ErrorKind};
pub use crate::version::{SERVER_NAME, VERSION};
