mod remote_store_memory;

pub use remote_store_memory::*;
