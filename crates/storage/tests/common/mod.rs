pub mod memory;

#[allow(unused_imports)]
pub use memory::MemoryStore;
