mod clock;
mod context;
mod id;
mod key;
mod token;
mod user;

pub use clock::*;
pub use context::*;
pub use id::*;
pub use key::*;
pub use token::*;
pub use user::*;
