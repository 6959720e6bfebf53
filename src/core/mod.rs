pub mod error;
pub mod types;
pub mod value;

pub use error::{Result, ViewError};
pub use types::{AttributeIndex, ViewTypeName};
pub use value::Value;
