use thiserror::Error;

#[derive(Error, Debug)]
pub enum ViewError {
    #[error("Structural violation: {0}")]
    StructuralViolation(String),

    #[error("View type '{0}' is not registered")]
    UnknownViewType(String),

    #[error("Attribute index {index} out of range for view type '{view_type}'")]
    AttributeOutOfRange { view_type: String, index: usize },

    #[error("Attribute '{0}' not found in view type '{1}'")]
    AttributeNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Node {0} is not part of this graph")]
    NodeDetached(String),

    #[error("Concurrent modification of '{view_type}' with id {id}")]
    ConcurrencyConflict { view_type: String, id: String },

    #[error("Listener failed in {phase} phase: {source}")]
    ListenerFailure {
        phase: String,
        #[source]
        source: Box<ViewError>,
    },

    #[error("Provider write failed: {0}")]
    ProviderWriteFailure(String),

    #[error("Transaction already completed as {0}")]
    TransactionCompleted(String),
}

pub type Result<T> = std::result::Result<T, ViewError>;
