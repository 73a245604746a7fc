use super::Parser;
use clap::Subcommand;

#[derive(Parser, Debug)]
#[command(name = "tokenstore", about = "Tiered JWT token store")]
pub struct Cli {
    #[arg(long)]
    pub settings: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the store and its health monitor until Ctrl-C.
    Serve,
    /// Invalidate every refresh token of a user.
    RevokeUser {
        #[arg(long)]
        user_id: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_revoke_user() {
        let cli = Cli::parse_from(["tokenstore", "--settings", "x.toml", "revoke-user", "--user-id", "42"]);
        assert_eq!(cli.settings.as_deref(), Some("x.toml"));
        assert!(matches!(cli.command, Command::RevokeUser { user_id: 42 }));
    }
}
