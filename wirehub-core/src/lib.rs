//! # wirehub-core
//!
//! Engine for bidirectional network services.
//!
//! This crate contains:
//! - **Status**: `StatusWaiter`, the observable starting → started → stopping → stopped lifecycle
//! - **Task**: `TaskScheduler` for tracked tasks, request/response correlation and periodic jobs
//! - **File**: `ManagedFile` / `FileRegistry`, one serialized writer per path
//! - **Message / Codec**: `Message`, `MessageContext`, the `Codec` contract and `JsonCodec`
//! - **Action / Requester**: server-side handlers and client-side call tables
//! - **Adaptor**: `ReceiverAdaptor` and `SenderAdaptor`, the per-connection pipeline
//! - **Network**: `ProtocolFactory`, `ConnectionRegistry`, `TcpServer`, `TcpClient`
//! - **Error**: `WireError`, a typed `thiserror`-based error enum

pub mod action;
pub mod adaptor;
pub mod codec;
pub mod error;
pub mod file;
pub mod message;
pub mod network;
pub mod requester;
pub mod status;
pub mod task;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use action::{
    Action, BufferedFileStorage, EchoAction, JsonRpcEcho, PreAction, RawBuffer, RecordedPacket,
    Recording, read_recording,
};
pub use adaptor::{Adaptor, AdaptorCore, ReceiverAdaptor, SenderAdaptor};
pub use codec::{Codec, JsonCodec};
pub use error::{Result, WireError};
pub use file::{FileOptions, FileRegistry, ManagedFile, WriteMode};
pub use message::{Message, MessageContext, RequestId};
pub use network::{
    ClientConnection, ConnectionHandle, ConnectionRegistry, ExpiryConfig, FactoryConfig,
    PeerAdaptor, ProtocolFactory, TcpClient, TcpServer,
};
pub use requester::{JsonRpcRequester, MethodFn, MethodTable, Requester};
pub use status::{Status, StatusWaiter};
pub use task::{TaskScheduler, TrackedTask, get_next_time, get_start_interval};
pub use transport::{ChannelTransport, Outbound, Transport};
