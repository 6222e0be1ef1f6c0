//! # hubbridge-core
//!
//! Connection registry and event routing for the hubbridge host bridge.
//!
//! This crate owns every named hub connection and funnels everything they
//! produce into one ordered outbound stream:
//!
//! - **Registry** - creates, looks up and tears down connections by id
//! - **Router** - turns transport signals and server pushes into envelopes
//! - **Invocation** - correlates a server call with its single outcome
//! - **Sink** - the serialized channel the host consumes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Router    │────▶│    Sink     │────▶ host
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                                       ▲
//!        │            ┌─────────────┐            │
//!        └────────────│  Registry   │────────────┘
//!                     └─────────────┘   (replies)
//! ```

pub mod envelope;
pub mod error;
pub mod handle;
pub mod invocation;
pub mod registry;
pub mod router;
pub mod sink;

pub use envelope::{Envelope, Outbound, Reply, NO_DATA};
pub use error::BridgeError;
pub use handle::{ConnectionHandle, LifecycleState};
pub use invocation::{Invocation, InvocationBridge};
pub use registry::{ConnectParams, ConnectionRegistry, RegistryConfig, RegistryStats};
pub use router::EventRouter;
pub use sink::{OutboundSink, OutboundStream};
