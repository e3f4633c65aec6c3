use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "prep",
    about = "Versioned dataset preparations: edit, run, preview and cache",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Directory holding the store, the cache and the datasets
    #[arg(long, global = true, default_value = ".prep")]
    pub root: PathBuf,

    /// Configuration file (defaults to <root>/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a preparation over a dataset
    Create(CreateArgs),
    /// Append an action to a preparation
    Append(AppendArgs),
    /// Show a preparation's steps
    History(HistoryArgs),
    /// Move the head back one step
    Undo(PreparationArgs),
    /// Move the head to any step of the preparation
    Redo(RedoArgs),
    /// Execute a preparation and print the result envelope
    Run(RunArgs),
    /// Show the diff between two steps
    Preview(PreviewArgs),
    /// Show the schema a step produces
    Metadata(MetadataArgs),
    /// Delete a preparation and its cached results
    Delete(PreparationArgs),
    /// Inspect and maintain the result cache
    Cache(CacheArgs),
}

#[derive(Args)]
pub struct CreateArgs {
    pub dataset: String,
    pub name: String,
    #[arg(long, default_value = "anonymous")]
    pub author: String,
    /// Import this JSON envelope as the dataset
    #[arg(long)]
    pub data: Option<PathBuf>,
}

#[derive(Args)]
pub struct AppendArgs {
    pub preparation: String,
    pub action: String,
    /// Action parameter as key=value; repeatable
    #[arg(short = 'p', long = "param", value_parser = parse_key_value)]
    pub parameters: Vec<(String, String)>,
}

#[derive(Args)]
pub struct HistoryArgs {
    pub preparation: String,
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

#[derive(Args)]
pub struct PreparationArgs {
    pub preparation: String,
}

#[derive(Args)]
pub struct RedoArgs {
    pub preparation: String,
    pub step: String,
}

#[derive(Args)]
pub struct RunArgs {
    pub preparation: String,
    #[arg(long, default_value = "head")]
    pub step: String,
    /// Only process the first N rows
    #[arg(long)]
    pub sample: Option<u64>,
    #[arg(long)]
    pub user: Option<String>,
    /// Write the envelope here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct PreviewArgs {
    pub preparation: String,
    #[arg(long, default_value = "origin")]
    pub reference: String,
    #[arg(long, default_value = "head")]
    pub candidate: String,
    /// Restrict to these row ids
    #[arg(long = "rows", value_delimiter = ',')]
    pub rows: Vec<u64>,
    #[arg(long)]
    pub sample: Option<u64>,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct MetadataArgs {
    pub preparation: String,
    #[arg(long, default_value = "head")]
    pub step: String,
    #[arg(long)]
    pub user: Option<String>,
}

#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// Delete expired and evicted entries once
    Sweep,
    /// Invalidate every entry below a dataset, preparation or step
    Evict {
        dataset: String,
        #[arg(long)]
        preparation: Option<String>,
        #[arg(long, requires = "preparation")]
        step: Option<String>,
    },
    /// Sweep periodically until interrupted
    Janitor {
        /// Seconds between sweeps (defaults to the configured period)
        #[arg(long)]
        period: Option<u64>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_create() {
        let cli = Cli::try_parse_from(["prep", "create", "customers", "cleanup"]).unwrap();
        if let Command::Create(args) = cli.command {
            assert_eq!(args.dataset, "customers");
            assert_eq!(args.name, "cleanup");
            assert_eq!(args.author, "anonymous");
            assert!(args.data.is_none());
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_append_with_parameters() {
        let cli = Cli::try_parse_from([
            "prep", "append", "p1", "uppercase", "-p", "column_id=0000", "--param", "x=y=z",
        ])
        .unwrap();
        if let Command::Append(args) = cli.command {
            assert_eq!(args.action, "uppercase");
            assert_eq!(
                args.parameters,
                vec![
                    ("column_id".to_string(), "0000".to_string()),
                    ("x".to_string(), "y=z".to_string())
                ]
            );
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn malformed_parameter_is_rejected() {
        assert!(Cli::try_parse_from(["prep", "append", "p1", "trim", "-p", "nokey"]).is_err());
        assert!(Cli::try_parse_from(["prep", "append", "p1", "trim", "-p", "=v"]).is_err());
    }

    #[test]
    fn parse_run_defaults_to_head() {
        let cli = Cli::try_parse_from(["prep", "run", "p1"]).unwrap();
        if let Command::Run(args) = cli.command {
            assert_eq!(args.step, "head");
            assert!(args.sample.is_none());
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_preview_rows() {
        let cli = Cli::try_parse_from(["prep", "preview", "p1", "--rows", "1,4,9"]).unwrap();
        if let Command::Preview(args) = cli.command {
            assert_eq!(args.reference, "origin");
            assert_eq!(args.candidate, "head");
            assert_eq!(args.rows, vec![1, 4, 9]);
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_cache_evict() {
        let cli =
            Cli::try_parse_from(["prep", "cache", "evict", "ds", "--preparation", "p1"]).unwrap();
        if let Command::Cache(CacheArgs {
            action: CacheAction::Evict { dataset, preparation, step },
        }) = cli.command
        {
            assert_eq!(dataset, "ds");
            assert_eq!(preparation.as_deref(), Some("p1"));
            assert!(step.is_none());
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn evict_step_requires_preparation() {
        assert!(Cli::try_parse_from(["prep", "cache", "evict", "ds", "--step", "abc"]).is_err());
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::try_parse_from([
            "prep", "--verbose", "--format", "json", "--root", "/tmp/p", "history", "p1",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.format, OutputFormat::Json));
        assert_eq!(cli.root, PathBuf::from("/tmp/p"));
    }
}
