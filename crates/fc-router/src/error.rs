use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Queue error: {0}")]
    Queue(#[from] fc_queue::QueueError),

    #[error("Store error: {0}")]
    Store(#[from] fc_store::StoreError),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Manager is not running")]
    ManagerStopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}
