//! Settings file plus `TOKENSTORE__*` environment overrides, and the
//! command line of the operator binary.

mod cli;
pub use clap::Parser;
pub use cli::*;

mod settings;
pub use settings::*;
