pub mod memory;

pub use memory::{Entry, MemoryStore};
