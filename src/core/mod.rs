pub mod error;
pub mod types;

pub use error::{Result, StageError};
pub use types::{EntryState, HandleAllocator, StageHandle};
