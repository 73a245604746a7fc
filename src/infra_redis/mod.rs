mod remote_store_redis;

pub use remote_store_redis::*;
