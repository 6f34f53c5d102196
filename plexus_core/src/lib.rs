pub mod config;
pub mod error;
pub mod isolate;
pub mod runtime;
pub mod transfer;

pub use config::RuntimeConfig;
pub use error::{PlexusError, TransferError};
pub use isolate::{Isolate, Proto, ProtoBuilder, Value};
pub use runtime::{ChannelKind, Code, ProcessId, Runtime, RuntimeBuilder};
pub use transfer::{HandleHooks, HookContext};
