//! # Clique Network
//!
//! Transport layer for the clique cluster runtime: signed JSON frames over
//! length-prefixed TCP, per-peer connection management with reconnect and
//! idle tracking, a kernel implementing the tagged call/cast protocol over
//! chunked streams, and the handler runtime that reassembles streams into
//! events.
//!
//! ## Architecture
//!
//! - **Frame**: the wire unit. A logical message is a stream of frames
//!   sharing a stream id, closed by a `done` frame.
//! - **Connection**: one task per known peer owning the outbound socket, a
//!   send queue for downtime, and the set of in-flight streams.
//! - **NetKernel**: owns sinks and sources, signs and verifies frames, and
//!   routes inbound traffic to reply listeners or handler mailboxes.
//! - **Handler**: per-service runtime accumulating streams and dispatching
//!   decoded `{event, data}` jobs to an [`EventHandler`].

// Module declarations
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod frame;
pub mod handler;
pub mod kernel;

// Re-exports
pub use config::{HandlerConfig, KernelConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{NetworkError, NetworkResult};
pub use events::{KernelEvent, SkipKind};
pub use frame::{ErrorPayload, Frame, Payload, StreamHeader};
pub use handler::{decode_job_value, EventHandler, Handler, Job, Target};
pub use kernel::{InboundFrame, NetKernel, Origin};
