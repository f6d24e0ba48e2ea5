#![forbid(unsafe_code)]

use autonous_core::LimitError;
use autonous_storage::StoreError;

use crate::commander::CommanderError;
use crate::provider::ProviderError;

/// Worker-level failures. The `Display` text is what gets classified,
/// stored on the inbox row and (truncated) sent back to the chat.
#[derive(Debug)]
pub enum WorkerError {
    Store(StoreError),
    Commander(CommanderError),
    Provider(ProviderError),
    Limit(LimitError),
    Validation(String),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Commander(err) => write!(f, "{err}"),
            Self::Provider(err) => write!(f, "{err}"),
            Self::Limit(err) => write!(f, "{err}"),
            Self::Validation(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<StoreError> for WorkerError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<CommanderError> for WorkerError {
    fn from(value: CommanderError) -> Self {
        Self::Commander(value)
    }
}

impl From<ProviderError> for WorkerError {
    fn from(value: ProviderError) -> Self {
        Self::Provider(value)
    }
}

impl From<LimitError> for WorkerError {
    fn from(value: LimitError) -> Self {
        Self::Limit(value)
    }
}
