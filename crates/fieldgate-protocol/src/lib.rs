//! Protocol handler abstraction and wire codecs for the Fieldgate gateway.
//!
//! A [`ProtocolHandler`] is the codec/transport implementation for one wire
//! protocol. Handlers are stateless and safe to share across devices; all
//! per-connection state lives in the [`ProtocolSession`] a handler returns
//! from `connect`. The engine owns each session exclusively between pool
//! checkout and release, so implementations may assume calls on one session
//! are serialized.
//!
//! The reference format is a length-prefixed framed TCP protocol (see
//! [`frame`]); [`sim`] provides an in-process simulator used by tests and
//! demo deployments.

pub mod frame;
pub mod handler;
pub mod sim;
pub mod tcp;

pub use frame::{Frame, FrameCodec, OpCode, MAX_PAYLOAD_LEN};
pub use handler::{HandlerRegistry, ProtocolHandler, ProtocolSession};
pub use sim::{SimDevice, SimResponse, SimulatedHandler};
pub use tcp::FramedTcpHandler;
