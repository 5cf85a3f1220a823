use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::{ErrorKind, LifecycleError, ParseIdError};
use crate::ports::{BagError, BrokerError, PartnerError, RegistryError, StorageError};

#[derive(Debug, Error)]
pub enum CuratorError {
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("partner: {0}")]
    Partner(#[from] PartnerError),

    #[error("bag: {0}")]
    Bag(#[from] BagError),

    #[error("lifecycle: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("bad message: {0}")]
    InvalidMessage(#[from] ParseIdError),

    #[error("saved state is unreadable: {0}")]
    State(#[from] serde_json::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),
}

impl CuratorError {
    /// Classification used by pipelines when recording this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CuratorError::Storage(StorageError::NotFound { .. })
            | CuratorError::Registry(RegistryError::NotFound(_))
            | CuratorError::Partner(PartnerError::NotFound { .. }) => ErrorKind::Fatal,
            CuratorError::Bag(BagError::Invalid(_))
            | CuratorError::InvalidMessage(_)
            | CuratorError::State(_)
            | CuratorError::Validation(_) => ErrorKind::Validation,
            CuratorError::Lifecycle(_) | CuratorError::Config(_) => ErrorKind::Fatal,
            _ => ErrorKind::Transient,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}
