//! Types exchanged between a relaylet node and its relay, and between the
//! relay and the backend sidecar.
//!
//! Everything here is plain JSON over HTTP. Field names follow the relay's
//! established wire format, so they are not always idiomatic Rust names.

#![warn(missing_docs)]

pub mod create;
pub mod logs;
pub mod session;
pub mod status;

#[doc(inline)]
pub use create::{CreateRequest, CreateResponse, RetrievedContainer, RetrievedPodData};
#[doc(inline)]
pub use logs::{ContainerLogOpts, LogRequest, ValidationError};
#[doc(inline)]
pub use status::{PodIdentity, PodStatus};
