//! # hubbridge-protocol
//!
//! Types that cross the boundary between the bridge and its host application.
//!
//! The host talks to the bridge through a single duplex channel of frames:
//!
//! - `request` - a command addressed to one connection id
//! - `reply` - the single outcome of a request
//! - `event` - a connection status change or a server-pushed hub message
//!
//! Every structured payload is a [`Value`], a closed interchange type that
//! maps onto MessagePack on the host side and onto JSON on the hub side.
//!
//! ## Example
//!
//! ```rust
//! use hubbridge_protocol::{codec, Command, Frame};
//!
//! let command = Command::Stop { id: "c1".to_string() };
//! let frame = Frame::request(7, &command);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod command;
pub mod frames;
pub mod value;

pub use codec::{decode, encode, ProtocolError};
pub use command::{Command, CommandError, ConnectRequest};
pub use frames::{ErrorCode, EventKind, Frame, Outcome};
pub use value::Value;
