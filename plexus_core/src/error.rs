use std::io;

use thiserror::Error;

/// Failure while copying a value between isolates.
///
/// Cloneable because a failed synchronous transfer is reported to both the
/// sending and the receiving process.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TransferError {
    #[error("failed to send value of unsupported type '{kind}' as a {position}")]
    UnsupportedValueKind { kind: &'static str, position: &'static str },

    #[error("number of nesting levels not supported (limit {limit})")]
    NestingLimitExceeded { limit: usize },

    #[error("- {name} - module must be loaded in the receiver process")]
    ModuleNotFound { name: String },

    #[error("function '{name}' is not available in the receiver process")]
    NativeNotFound { name: String },

    #[error("handle type '{type_name}' is not registered in the receiver process")]
    HandleTypeNotFound { type_name: String },

    #[error("cannot transfer a handle without a type name")]
    UntypedHandle,

    #[error("trying to transfer a handle already transferred")]
    HandleAlreadyTransferred,

    #[error("transfer hook for handle type '{type_name}' broke the stack protocol: {detail}")]
    TransferProtocolViolation { type_name: String, detail: String },

    #[error("transfer hook for handle type '{type_name}' failed: {message}")]
    HookFailed { type_name: String, message: String },

    #[error("error serializing function: {0}")]
    Serialize(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),
}

#[derive(Debug, Error)]
pub enum PlexusError {
    #[error("{0}")]
    Configuration(String),

    #[error("channel '{name}' already exists")]
    NameConflict { name: String },

    #[error("channel '{name}' does not exist")]
    ChannelNotFound { name: String },

    #[error("asynchronous channel '{name}' still stores messages")]
    MailboxNotEmpty { name: String },

    #[error("channel '{name}' destroyed while waiting for {peer}")]
    ChannelDestroyed { name: String, peer: &'static str },

    #[error("no senders waiting on channel '{name}'")]
    NoWaitingPeer { name: String },

    #[error("handle type '{type_name}' already registered")]
    HookConflict { type_name: String },

    #[error("failed to create worker")]
    WorkerSpawn(#[source] io::Error),

    #[error("error loading code: {0}")]
    Load(String),

    #[error("cannot use '{kind}' to create a new process")]
    InvalidCode { kind: &'static str },

    #[error("{0}")]
    Process(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl PlexusError {
    /// Copy of this error for a second recipient. I/O errors keep their kind and text.
    pub fn duplicate(&self) -> PlexusError {
        match self {
            PlexusError::Configuration(m) => PlexusError::Configuration(m.clone()),
            PlexusError::NameConflict { name } => PlexusError::NameConflict { name: name.clone() },
            PlexusError::ChannelNotFound { name } => PlexusError::ChannelNotFound { name: name.clone() },
            PlexusError::MailboxNotEmpty { name } => PlexusError::MailboxNotEmpty { name: name.clone() },
            PlexusError::ChannelDestroyed { name, peer } => PlexusError::ChannelDestroyed {
                name: name.clone(),
                peer: *peer,
            },
            PlexusError::NoWaitingPeer { name } => PlexusError::NoWaitingPeer { name: name.clone() },
            PlexusError::HookConflict { type_name } => PlexusError::HookConflict {
                type_name: type_name.clone(),
            },
            PlexusError::WorkerSpawn(e) => PlexusError::WorkerSpawn(io::Error::new(e.kind(), e.to_string())),
            PlexusError::Load(m) => PlexusError::Load(m.clone()),
            PlexusError::InvalidCode { kind } => PlexusError::InvalidCode { kind: *kind },
            PlexusError::Process(m) => PlexusError::Process(m.clone()),
            PlexusError::Transfer(e) => PlexusError::Transfer(e.clone()),
        }
    }
}

pub type Result<T, E = PlexusError> = std::result::Result<T, E>;
