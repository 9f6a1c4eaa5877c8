//! Wire protocol spoken between the chat bridge and its worker processes.
//!
//! Commands are written to the worker's stdin as one JSON object per line.
//! The worker answers on stdout with either a single reply object (buffered
//! commands) or a sequence of stream frames (`stream_chat`). Every message may
//! carry the request `id` it belongs to; workers that do not echo ids are still
//! supported by the bridge's FIFO fallback.
//!
//! The client-facing [`StreamEvent`] type also lives here so the bridge and the
//! HTTP layer share one serialization.

pub mod codec;
pub mod command;
pub mod events;
pub mod message;

pub use codec::{DEFAULT_MAX_FRAME_BYTES, JsonObjectCodec};
pub use command::{CommandKind, WorkerCommand};
pub use events::StreamEvent;
pub use message::{FrameBody, HistoryEntry, StreamFrame, WorkerMessage, WorkerReply};
