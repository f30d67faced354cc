//! Shared types for the Hearth gateway runtime.
//!
//! This crate holds the vocabulary every other Hearth crate speaks:
//! the per-request [`RequestContext`] that travels through the plugin
//! pipeline, the [`ApiError`] taxonomy surfaced to clients, the typed
//! [`MessageEnvelope`] published on the event bus, and client identity
//! types.
//!
//! It deliberately has no I/O and no async dependencies so that every
//! layer (adapters, plugins, scheduler, storage) can depend on it
//! without pulling in a runtime.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod client;
pub mod context;
pub mod envelope;
pub mod error;
pub mod prelude;
pub mod version;

pub use client::{ClientInfo, Principal};
pub use context::{Protocol, RequestContext};
pub use envelope::{EnvelopeMetadata, MessageEnvelope};
pub use error::{ApiError, ErrorKind};
pub use version::{SERVER_NAME, VERSION};
