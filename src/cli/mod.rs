pub(crate) mod protocol;

use clap::{Parser, Subcommand};

/// Restores database backups dropped into a watch directory or named on stdin.
#[derive(Parser)]
#[command(name = "backup-ingest", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Option<Mode>,

    /// Mode used when no subcommand is given.
    #[arg(long, env = "TOOL_MODE", default_value = "monitor", value_parser = ["monitor", "cli"], ignore_case = true)]
    pub tool_mode: String,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Poll the watch directory and restore every stable backup that appears.
    Monitor,
    /// Read one JSON command from stdin, run it, and report JSON lines on stdout.
    Restore,
}

impl Cli {
    pub fn resolved_mode(&self) -> Mode {
        match self.mode {
            Some(mode) => mode,
            None if self.tool_mode.eq_ignore_ascii_case("cli") => Mode::Restore,
            None => Mode::Monitor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subcommand_wins_over_tool_mode() {
        let cli = Cli::parse_from(["backup-ingest", "--tool-mode", "cli", "monitor"]);
        assert_eq!(cli.resolved_mode(), Mode::Monitor);
    }

    #[test]
    fn test_tool_mode_selects_restore() {
        let cli = Cli::parse_from(["backup-ingest", "--tool-mode", "CLI"]);
        assert_eq!(cli.resolved_mode(), Mode::Restore);
    }

    #[test]
    fn test_unknown_tool_mode_is_rejected() {
        assert!(Cli::try_parse_from(["backup-ingest", "--tool-mode", "daemon"]).is_err());
    }
}
