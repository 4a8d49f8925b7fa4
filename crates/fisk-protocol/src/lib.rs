//! fisk wire protocol.
//!
//! Length-prefixed frames over TCP, a JSON handshake, typed JSON messages and
//! binary payloads whose length is declared by the preceding message.

pub mod assembler;
pub mod connection;
pub mod error;
pub mod frame;
pub mod headers;
pub mod message;

pub use assembler::{Inbound, PayloadAssembler};
pub use connection::{
    Connection, ConnectionError, ConnectionState, FrameSender, Handshake, Role,
};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameCodec, FrameError};
pub use headers::{BuilderHeaders, ClientHeaders, JobHeaders};
pub use message::{
    BuilderMessage, BuilderReply, BuilderSummary, ClientIdentity, ClientMessage, JobReport,
    JobResponse, JobStart, JobSummary, MonitorEvent, OutputEntry, Placement, SchedulerMessage,
    SchedulerReply,
};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest binary frame a sender produces when streaming a payload.
pub const PAYLOAD_CHUNK_SIZE: usize = 32 * 1024;
