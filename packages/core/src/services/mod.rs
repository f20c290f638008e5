//! Business Services
//!
//! - `TreeService` - page and block operations over a `NodeStore`: argument
//!   and type checks, conflict retries, deadlines
//!
//! Services coordinate between the storage layer and callers; every write
//! they issue is a single atomic store call.

pub mod error;
pub mod tree_service;


pub use error::{ServiceResult, TreeServiceError};
pub use tree_service::TreeService;
