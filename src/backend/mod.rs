//! Terminal backends are out of scope for the core (§1): this module only
//! ships the minimal reference backend the rest of the crate is tested
//! against.

pub mod memory;

pub use memory::MemoryBlobStore;
