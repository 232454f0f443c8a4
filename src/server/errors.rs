pub use crate::errors::ApiError;
