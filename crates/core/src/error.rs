use std::fmt;

use crate::copy::CopyError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote control error: {message}")]
    Remote { message: String },

    #[error("archive error: {message}")]
    Archive { message: String },

    #[error("copy error: {0}")]
    Copy(#[from] CopyError),

    #[error("transfer aborted: {message}")]
    TransferAborted { message: String },

    #[error("still have {} items failed after {rounds} rounds: {}", .items.len(), FailedList(.items))]
    BatchFailed { rounds: u32, items: Vec<FailedItem> },
}

impl Error {
    pub(crate) fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    pub(crate) fn archive(message: impl Into<String>) -> Self {
        Self::Archive {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    pub index: u64,
    pub path: String,
    pub error: String,
}

struct FailedList<'a>(&'a [FailedItem]);

impl fmt::Display for FailedList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "#{} {} ({})", item.index, item.path, item.error)?;
        }
        f.write_str("]")
    }
}
