pub mod error;
pub mod value;

pub use error::{Result, RouterError};
pub use value::Value;
