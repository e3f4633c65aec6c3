use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use prep_cache::{CacheKey, ContentCache, FileSystemContentCache, Janitor, Sample};
use prep_engine::{ExecuteRequest, PreparationEngine, PreviewRequest};
use prep_store::FileSystemRepository;
use prep_types::{Action, StepRef};

use crate::actions::builtin_registry;
use crate::cli::*;
use crate::config::CliConfig;
use crate::datasets::FileDatasets;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let ws = Workspace::open(&cli.root, cli.config.as_deref())?;
    let json = matches!(cli.format, OutputFormat::Json);
    match cli.command {
        Command::Create(args) => cmd_create(&ws, args, json),
        Command::Append(args) => cmd_append(&ws, args, json),
        Command::History(args) => cmd_history(&ws, args, json),
        Command::Undo(args) => cmd_undo(&ws, args),
        Command::Redo(args) => cmd_redo(&ws, args),
        Command::Run(args) => cmd_run(&ws, args),
        Command::Preview(args) => cmd_preview(&ws, args),
        Command::Metadata(args) => cmd_metadata(&ws, args, json),
        Command::Delete(args) => cmd_delete(&ws, args),
        Command::Cache(args) => cmd_cache(&ws, args),
    }
}

struct Workspace {
    engine: PreparationEngine,
    cache: Arc<FileSystemContentCache>,
    datasets: Arc<FileDatasets>,
    config: CliConfig,
}

impl Workspace {
    fn open(root: &Path, config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| CliConfig::default_path(root));
        let config = CliConfig::load(&config_path)?;

        let store_path = config.store_path(root);
        let repository = FileSystemRepository::open(&store_path)
            .with_context(|| format!("failed to open store at {}", store_path.display()))?;
        let cache_path = config.cache_path(root);
        let cache = Arc::new(
            FileSystemContentCache::open(&cache_path)
                .with_context(|| format!("failed to open cache at {}", cache_path.display()))?,
        );
        let datasets = Arc::new(FileDatasets::open(config.datasets_path(root))?);

        let engine = PreparationEngine::new(
            Arc::new(repository),
            cache.clone(),
            builtin_registry(),
            datasets.clone(),
            config.engine.clone(),
        )?;
        Ok(Self {
            engine,
            cache,
            datasets,
            config,
        })
    }
}

fn step_ref(s: &str) -> anyhow::Result<StepRef> {
    s.parse()
        .with_context(|| format!("expected head, origin or a step id, got {s:?}"))
}

fn sample(rows: Option<u64>) -> Sample {
    rows.map_or(Sample::Full, Sample::Rows)
}

fn emit(output: Option<&PathBuf>, bytes: &[u8]) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("{} Wrote {} bytes to {}", "✓".green().bold(), bytes.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(bytes)?;
            writeln!(stdout)?;
        }
    }
    Ok(())
}

fn cmd_create(ws: &Workspace, args: CreateArgs, json: bool) -> anyhow::Result<()> {
    if let Some(data) = &args.data {
        let rows = ws.datasets.import(&args.dataset, data)?;
        if !json {
            println!("Imported {} rows into dataset {}", rows, args.dataset.bold());
        }
    }
    let prep = ws
        .engine
        .create_preparation(&args.dataset, &args.name, &args.author)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&prep)?);
    } else {
        println!("{} Created preparation {}", "✓".green().bold(), args.name.bold());
        println!("  Id: {}", prep.id.yellow());
        println!("  Dataset: {}", prep.dataset_id);
        println!("  Head: {}", prep.head.short_hex().dimmed());
    }
    Ok(())
}

fn cmd_append(ws: &Workspace, args: AppendArgs, json: bool) -> anyhow::Result<()> {
    let action = args
        .parameters
        .into_iter()
        .fold(Action::new(args.action), |action, (k, v)| action.with_parameter(k, v));
    let head = ws
        .engine
        .append_actions(&args.preparation, vec![action.clone()])?;
    if json {
        println!("{}", serde_json::json!({ "head": head, "action": action }));
    } else {
        println!(
            "{} Appended {} at {}",
            "✓".green().bold(),
            action.name.cyan(),
            head.short_hex().yellow()
        );
    }
    Ok(())
}

fn cmd_history(ws: &Workspace, args: HistoryArgs, json: bool) -> anyhow::Result<()> {
    let history = ws.engine.history(&args.preparation, args.limit)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }
    let prep = ws.engine.preparation(&args.preparation)?;
    println!("{} ({})", prep.name.bold(), prep.dataset_id);
    for step in &history {
        let marker = if step.id == prep.head { "*".green().bold() } else { " ".normal() };
        let added = if step.added.is_empty() {
            "(root)".dimmed().to_string()
        } else {
            step.added
                .iter()
                .map(|a| {
                    let params: Vec<String> =
                        a.parameters.iter().map(|(k, v)| format!("{k}={v}")).collect();
                    format!("{}({})", a.name.cyan(), params.join(", "))
                })
                .collect::<Vec<_>>()
                .join(" ")
        };
        println!("{marker} {}  {added}", step.id.to_hex().yellow());
    }
    Ok(())
}

fn cmd_undo(ws: &Workspace, args: PreparationArgs) -> anyhow::Result<()> {
    let head = ws.engine.undo(&args.preparation)?;
    println!("{} Head moved back to {}", "✓".green().bold(), head.short_hex().yellow());
    Ok(())
}

fn cmd_redo(ws: &Workspace, args: RedoArgs) -> anyhow::Result<()> {
    let head = ws.engine.set_head(&args.preparation, step_ref(&args.step)?)?;
    println!("{} Head moved to {}", "✓".green().bold(), head.short_hex().yellow());
    Ok(())
}

fn cmd_run(ws: &Workspace, args: RunArgs) -> anyhow::Result<()> {
    let mut request = ExecuteRequest::head(&args.preparation)
        .at(step_ref(&args.step)?)
        .sample(sample(args.sample));
    request.user_id = args.user;
    let execution = ws.engine.execute(&request)?;
    tracing::info!(
        step = %execution.step_id.short_hex(),
        cached = execution.cached,
        bytes = execution.content.len(),
        "run finished"
    );
    emit(args.output.as_ref(), &execution.content)
}

fn cmd_preview(ws: &Workspace, args: PreviewArgs) -> anyhow::Result<()> {
    let mut request = PreviewRequest::new(
        &args.preparation,
        step_ref(&args.reference)?,
        step_ref(&args.candidate)?,
    );
    request.sample = sample(args.sample);
    if !args.rows.is_empty() {
        request = request.rows(args.rows);
    }
    let content = ws.engine.preview_steps(&request)?;
    emit(args.output.as_ref(), &content)
}

fn cmd_metadata(ws: &Workspace, args: MetadataArgs, json: bool) -> anyhow::Result<()> {
    let schema = ws
        .engine
        .metadata(&args.preparation, step_ref(&args.step)?, args.user.as_deref())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }
    for column in schema.columns() {
        println!("{}  {}  {}", column.id.yellow(), column.name.bold(), column.column_type.dimmed());
    }
    Ok(())
}

fn cmd_delete(ws: &Workspace, args: PreparationArgs) -> anyhow::Result<()> {
    let report = ws.engine.delete_preparation(&args.preparation)?;
    println!("{} Deleted preparation {}", "✓".green().bold(), args.preparation.yellow());
    println!(
        "  GC: {} steps, {} contents removed",
        report.steps_removed, report.contents_removed
    );
    Ok(())
}

fn cmd_cache(ws: &Workspace, args: CacheArgs) -> anyhow::Result<()> {
    match args.action {
        CacheAction::Sweep => {
            let report = ws.cache.sweep();
            let status = if report.failed == 0 { "✓".green().bold() } else { "!".red().bold() };
            println!(
                "{status} Swept {} entries: {} deleted, {} failed",
                report.scanned, report.deleted, report.failed
            );
            Ok(())
        }
        CacheAction::Evict {
            dataset,
            preparation,
            step,
        } => {
            let mut key = CacheKey::dataset(dataset);
            if let Some(preparation) = preparation {
                key = key.preparation(preparation);
            }
            if let Some(step) = step {
                key = key.step(step);
            }
            let evicted = ws.cache.evict(&key)?;
            println!("{} Evicted {} entries under {}", "✓".green().bold(), evicted, key);
            Ok(())
        }
        CacheAction::Janitor { period } => {
            let period = period
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| ws.config.engine.janitor_period());
            let cache: Arc<dyn ContentCache> = ws.cache.clone();
            println!(
                "Cache janitor running every {}s on {} (Ctrl-C to stop)",
                period.as_secs(),
                ws.cache.root().display().to_string().bold()
            );
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async move {
                let handle = Janitor::spawn(cache, period);
                let stopped = tokio::signal::ctrl_c().await;
                handle.shutdown().await;
                stopped.context("failed to listen for Ctrl-C")
            })?;
            println!("{} Janitor stopped.", "✓".green().bold());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    struct Env {
        dir: tempfile::TempDir,
    }

    impl Env {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(
                dir.path().join("customers.json"),
                r#"{"records":[{"A":" x "},{"A":""},{"A":"y"}],"metadata":{"columns":[{"id":"A","name":"A"}]}}"#,
            )
            .unwrap();
            Self { dir }
        }

        fn run(&self, args: &[&str]) -> anyhow::Result<()> {
            let root = self.dir.path().join("root");
            let mut argv = vec!["prep", "--root", root.to_str().unwrap()];
            argv.extend_from_slice(args);
            run_command(Cli::try_parse_from(argv).unwrap())
        }

        fn workspace(&self) -> Workspace {
            Workspace::open(&self.dir.path().join("root"), None).unwrap()
        }

        fn path(&self, name: &str) -> String {
            self.dir.path().join(name).to_str().unwrap().to_string()
        }

        fn read(&self, name: &str) -> String {
            std::fs::read_to_string(self.dir.path().join(name)).unwrap()
        }
    }

    fn only_preparation(ws: &Workspace) -> String {
        let all = ws
            .engine
            .chain()
            .repository()
            .get_by_dataset("customers")
            .unwrap();
        assert_eq!(all.len(), 1);
        all[0].id.clone()
    }

    #[test]
    fn create_append_run_and_preview() {
        let env = Env::new();
        let data = env.path("customers.json");
        env.run(&["create", "customers", "cleanup", "--data", &data])
            .unwrap();
        let prep = only_preparation(&env.workspace());

        env.run(&["append", &prep, "trim", "-p", "column_id=A"]).unwrap();
        env.run(&["append", &prep, "delete_empty", "-p", "column_id=A"])
            .unwrap();
        env.run(&["append", &prep, "uppercase", "-p", "column_id=A"])
            .unwrap();

        let out = env.path("out.json");
        env.run(&["run", &prep, "-o", &out]).unwrap();
        assert_eq!(
            env.read("out.json"),
            r#"{"records":[{"A":"X","__rowId":0},{"A":"Y","__rowId":2}],"metadata":{"columns":[{"id":"A","name":"A","type":"string","domain":""}]}}"#
        );

        let diff = env.path("diff.json");
        env.run(&["preview", &prep, "--rows", "1", "-o", &diff]).unwrap();
        let json: serde_json::Value = serde_json::from_str(&env.read("diff.json")).unwrap();
        assert_eq!(json["records"][0]["__rowDiff"], "delete");
        assert_eq!(json["records"][0]["__rowId"], 1);
    }

    #[test]
    fn undo_redo_and_delete() {
        let env = Env::new();
        let data = env.path("customers.json");
        env.run(&["create", "customers", "p", "--data", &data]).unwrap();
        let prep = only_preparation(&env.workspace());
        env.run(&["append", &prep, "uppercase", "-p", "column_id=A"])
            .unwrap();
        let head = env.workspace().engine.preparation(&prep).unwrap().head;

        env.run(&["undo", &prep]).unwrap();
        assert_ne!(env.workspace().engine.preparation(&prep).unwrap().head, head);
        env.run(&["redo", &prep, &head.to_hex()]).unwrap();
        assert_eq!(env.workspace().engine.preparation(&prep).unwrap().head, head);

        env.run(&["run", &prep, "-o", &env.path("out.json")]).unwrap();
        env.run(&["delete", &prep]).unwrap();
        assert!(env.workspace().engine.preparation(&prep).is_err());
        assert!(env.run(&["undo", &prep]).is_err());
    }

    #[test]
    fn unknown_action_is_refused() {
        let env = Env::new();
        env.run(&["create", "customers", "p"]).unwrap();
        let prep = only_preparation(&env.workspace());
        assert!(env.run(&["append", &prep, "frobnicate"]).is_err());
    }

    #[test]
    fn cache_evict_and_sweep() {
        let env = Env::new();
        let data = env.path("customers.json");
        env.run(&["create", "customers", "p", "--data", &data]).unwrap();
        let prep = only_preparation(&env.workspace());
        env.run(&["run", &prep, "-o", &env.path("out.json")]).unwrap();

        env.run(&["cache", "evict", "customers", "--preparation", &prep])
            .unwrap();
        env.run(&["cache", "sweep"]).unwrap();

        let ws = env.workspace();
        let scope = CacheKey::dataset("customers").preparation(&prep);
        assert_eq!(ws.cache.evict(&scope).unwrap(), 0);
    }

    #[test]
    fn bad_step_reference_is_an_error() {
        let env = Env::new();
        env.run(&["create", "customers", "p"]).unwrap();
        let prep = only_preparation(&env.workspace());
        assert!(env.run(&["run", &prep, "--step", "not-a-step"]).is_err());
    }
}
