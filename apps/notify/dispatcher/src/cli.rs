use clap::Parser;

/// Multi-channel notification dispatcher.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "notify_dispatcher", version, about)]
pub struct Cli {
    /// Exit with status 0 once no job is due and in-flight jobs finished (delayed jobs stay queued)
    #[arg(long)]
    pub drain: bool,

    /// Number of worker loops (overrides WORKER_CONCURRENCY)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: Option<u16>,

    /// Do not run the retry sweeper
    #[arg(long)]
    pub no_sweeper: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["notify_dispatcher"]).unwrap();
        assert!(!cli.drain);
        assert!(!cli.no_sweeper);
        assert_eq!(cli.workers, None);
    }

    #[test]
    fn test_flags() {
        let cli =
            Cli::try_parse_from(["notify_dispatcher", "--drain", "--workers", "8", "--no-sweeper"]).unwrap();
        assert!(cli.drain);
        assert!(cli.no_sweeper);
        assert_eq!(cli.workers, Some(8));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(Cli::try_parse_from(["notify_dispatcher", "--workers", "0"]).is_err());
    }
}
