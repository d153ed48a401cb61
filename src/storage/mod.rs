pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use memory::MemoryMutationLog;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMutationLog;
pub use traits::MutationLog;
