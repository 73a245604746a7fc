mod remote_store;
mod token_store;

pub use remote_store::*;
pub use token_store::*;
