mod config;
mod health_monitor;
mod local_cache;
mod pending_sync;
mod remote_health;
mod store;
mod store_fake;
mod sync;

pub use config::*;
pub(crate) use health_monitor::*;
pub use local_cache::*;
pub use pending_sync::*;
pub use remote_health::*;
pub use store::*;
pub use store_fake::*;
pub use sync::*;
