#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("out of memory, pool space or quota")]
    NoMemory,

    #[error("no such entry")]
    NoSuchEntry,

    #[error("supplied names differ from the registered names")]
    NamesDiffer,

    #[error("name already claimed in this domain")]
    NameExists,

    #[error("name too long")]
    NameTooLong,

    #[error("peer is already connected")]
    AlreadyConnected,

    #[error("peer is not connected")]
    NotConnected,

    #[error("peer or domain is shut down")]
    Shutdown,

    #[error("permission denied")]
    PermissionDenied,

    #[error("no message queued")]
    Again,

    #[error("fault accessing caller memory")]
    Fault,

    #[error("unknown command code {0}")]
    NoSuchIoctl(u32),

    #[error("malformed names buffer")]
    Malformed,
}

impl From<cmd_proto::DeserializeError> for Error {
    fn from(_: cmd_proto::DeserializeError) -> Self {
        Error::InvalidArgument
    }
}

pub type Result<T> = core::result::Result<T, Error>;
