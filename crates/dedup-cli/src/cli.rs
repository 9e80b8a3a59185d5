use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Args, CommandFactory, FromArgMatches, Parser};
use dedup_store::StoreConfig;
use dedup_types::{BLOCK_SIZE, DIGEST_ALGORITHM};

#[derive(Parser, Debug)]
#[command(
    name = "dedup",
    about = "Deduplicating block store: ingest stdin under a name, or reconstruct a stored stream to stdout",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub mode: Mode,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Store root directory (overrides the configuration file)
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

/// Exactly one of read or write.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct Mode {
    /// Reconstruct stream NAME to standard output
    #[arg(short = 'r', long = "read", value_name = "NAME")]
    pub read: Option<String>,

    /// Store standard input as stream NAME
    #[arg(short = 'w', long = "write", value_name = "NAME")]
    pub write: Option<String>,
}

/// What the invocation asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Read(String),
    Write(String),
}

impl Cli {
    pub fn operation(&self) -> Option<Operation> {
        match (&self.mode.read, &self.mode.write) {
            (Some(name), None) => Some(Operation::Read(name.clone())),
            (None, Some(name)) => Some(Operation::Write(name.clone())),
            _ => None,
        }
    }
}

/// Default store parameters, shown at the end of `--help`.
pub fn parameters() -> String {
    let defaults = StoreConfig::default();
    format!(
        "Parameters:\n  \
         read buffer size:   {} bytes\n  \
         block size:         {} bytes\n  \
         digest algorithm:   {}\n  \
         max segment size:   {} bytes\n  \
         store root:         {}",
        defaults.read_buffer_size,
        BLOCK_SIZE,
        DIGEST_ALGORITHM,
        defaults.max_segment_size,
        defaults.root.display(),
    )
}

/// Parse arguments, with the parameter listing attached to the help text.
pub fn try_parse_from<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut matches = Cli::command()
        .after_help(parameters())
        .try_get_matches_from(args)?;
    Cli::from_arg_matches_mut(&mut matches)
}

pub fn parse() -> Cli {
    try_parse_from(std::env::args_os()).unwrap_or_else(|e| e.exit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn parse_write() {
        let cli = try_parse_from(["dedup", "-w", "a"]).unwrap();
        assert_eq!(cli.operation(), Some(Operation::Write("a".into())));
        assert!(!cli.verbose);
    }

    #[test]
    fn parse_read_with_options() {
        let cli = try_parse_from(["dedup", "-v", "--root", "/srv/d", "-r", "logs/a"]).unwrap();
        assert_eq!(cli.operation(), Some(Operation::Read("logs/a".into())));
        assert_eq!(cli.root, Some(PathBuf::from("/srv/d")));
        assert!(cli.verbose);
    }

    #[test]
    fn mode_is_required() {
        let err = try_parse_from(["dedup"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn modes_are_exclusive() {
        let err = try_parse_from(["dedup", "-r", "a", "-w", "b"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn repeated_mode_is_rejected() {
        assert!(try_parse_from(["dedup", "-w", "a", "-w", "b"]).is_err());
    }

    #[test]
    fn name_is_required() {
        assert!(try_parse_from(["dedup", "-w"]).is_err());
    }

    #[test]
    fn help_lists_parameters() {
        let err = try_parse_from(["dedup", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        let help = err.to_string();
        assert!(help.contains("block size:         16 bytes"));
        assert!(help.contains("sha256"));
        assert!(help.contains("65536"));
    }
}
