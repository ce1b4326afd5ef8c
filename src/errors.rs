use thiserror::Error;

use crate::resp::Frame;

/// Every user-visible failure a command can produce. The `Display` form is
/// exactly what goes on the wire after the leading `-`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("WRONGTYPE Key is not a valid HyperLogLog string value.")]
    InvalidHll,

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR value is not a valid float")]
    NotFloat,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR index out of range")]
    IndexOutOfRange,

    #[error("MOVED {0} {1}")]
    Moved(u16, String),

    #[error("ASK {0} {1}")]
    Ask(u16, String),

    #[error("WRONGPASS invalid username-password pair or user is disabled.")]
    WrongPass,

    #[error("NOAUTH Authentication required.")]
    NoAuth,

    #[error("READONLY You can't write against a read only replica.")]
    ReadOnly,

    #[error("EXECABORT Transaction discarded because of previous errors.")]
    ExecAbort,

    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    #[error("ERR {0}")]
    Other(String),

    /// Already carries its own error class prefix (BUSYKEY, NOGROUP,
    /// BUSYGROUP, NOPROTO, TSDB:, ...).
    #[error("{0}")]
    Raw(String),

    #[error("ERR internal: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn other(msg: impl Into<String>) -> ServerError {
        ServerError::Other(msg.into())
    }

    pub fn raw(msg: impl Into<String>) -> ServerError {
        ServerError::Raw(msg.into())
    }

    pub fn to_frame(&self) -> Frame {
        Frame::Error(self.to_string())
    }
}

impl From<sled::Error> for ServerError {
    fn from(e: sled::Error) -> Self {
        ServerError::Internal(e.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_forms() {
        assert_eq!(
            ServerError::WrongArity("get".into()).to_string(),
            "ERR wrong number of arguments for 'get' command"
        );
        assert_eq!(
            ServerError::Moved(7000, "10.0.0.2:6379".into()).to_string(),
            "MOVED 7000 10.0.0.2:6379"
        );
        assert_eq!(
            ServerError::WrongType.to_string(),
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        );
    }
}
