//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use specextract_core::{
    Checkpointer, FanoutObserver, LangfuseObserver, Observer, RunReport, Workflow, WorkflowEvent,
    collect_inputs, process_batch, process_document,
};
use specextract_llm::Oracles;
use specextract_shared::{
    AppConfig, ConfigOverrides, RuntimeConfig, config_file_path, expand_home, init_config,
    load_config,
};
use specextract_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// specextract — structured item lists from procurement specifications.
#[derive(Parser)]
#[command(
    name = "specextract",
    version,
    about = "Extract structured item lists from procurement technical specifications.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Model backend: google or mistral.
    #[arg(long, env = "LLM_PROVIDER", global = true)]
    pub provider: Option<String>,

    /// Model id (defaults to GOOGLE_MODEL / MISTRAL_MODEL, then the config file).
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Run the extractor/reviewer refinement loop before extraction.
    #[arg(
        long,
        env = "ENABLE_REVIEWER",
        global = true,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = clap::builder::BoolishValueParser::new(),
    )]
    pub refine: Option<bool>,

    /// Turn budget shared by both refinement roles.
    #[arg(long, global = true)]
    pub max_turns: Option<u32>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process one HTML document.
    Run {
        /// HTML rendering of the specification.
        input: PathBuf,

        /// Artifact root (defaults to `defaults.output_dir`).
        output_dir: Option<PathBuf>,
    },

    /// Process every `*.html` file in a directory.
    Batch {
        /// Directory with HTML documents.
        input_dir: PathBuf,

        /// Artifact root (defaults to `defaults.output_dir`).
        output_dir: Option<PathBuf>,

        /// Documents processed concurrently.
        #[arg(short, long)]
        jobs: Option<u32>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Inspect stored refinement checkpoints.
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show the config file contents (defaults when absent).
    Show,
}

/// Checkpoint subcommands.
#[derive(Subcommand)]
pub(crate) enum CheckpointAction {
    /// List interrupted refinement sessions.
    List,
    /// Delete all stored checkpoints.
    Clear,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "specextract=info",
        1 => "specextract=debug",
        _ => "specextract=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let overrides = ConfigOverrides {
        provider: cli.provider.clone(),
        model: cli.model.clone(),
        refine: cli.refine,
        max_refine_turns: cli.max_turns,
        concurrency: None,
    };

    match cli.command {
        Command::Run { input, output_dir } => cmd_run(&overrides, &input, output_dir).await,
        Command::Batch {
            input_dir,
            output_dir,
            jobs,
        } => {
            let overrides = ConfigOverrides {
                concurrency: jobs,
                ..overrides
            };
            cmd_batch(&overrides, &input_dir, output_dir).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
        Command::Checkpoints { action } => match action {
            CheckpointAction::List => cmd_checkpoints_list().await,
            CheckpointAction::Clear => cmd_checkpoints_clear().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Processing commands
// ---------------------------------------------------------------------------

/// Everything a processing command needs, built once at startup.
struct Session {
    runtime: RuntimeConfig,
    workflow: Arc<Workflow>,
    progress: Arc<CliProgress>,
    langfuse: Option<Arc<LangfuseObserver>>,
}

impl Session {
    async fn start(overrides: &ConfigOverrides) -> Result<Self> {
        // Configuration errors are fatal before any document is touched
        let config: AppConfig = load_config()?;
        let runtime = config.resolve(overrides)?;
        let oracles = Oracles::from_settings(&runtime.provider)?;

        let progress = Arc::new(CliProgress::new());
        let mut observer = FanoutObserver::new().with(progress.clone());

        let langfuse = match &runtime.langfuse {
            Some(settings) => {
                match LangfuseObserver::auth_check(settings).await {
                    Ok(true) => info!(host = %settings.host, "Langfuse auth check passed"),
                    Ok(false) => warn!(host = %settings.host, "Langfuse auth check failed, check the keys"),
                    Err(e) => warn!(error = %e, "Langfuse unreachable"),
                }
                let lf = Arc::new(LangfuseObserver::spawn(settings.clone())?);
                observer = observer.with(lf.clone());
                Some(lf)
            }
            None => None,
        };

        let mut builder = Workflow::builder(oracles)
            .configure(&runtime)
            .observer(Arc::new(observer));

        if runtime.refine && runtime.checkpoints {
            let storage = Storage::open(&runtime.checkpoint_db).await?;
            let checkpointer: Arc<dyn Checkpointer> = Arc::new(storage);
            builder = builder.checkpointer(checkpointer);
        }

        let workflow = Arc::new(builder.build()?);
        info!(
            provider = runtime.provider.kind.as_str(),
            model = %runtime.provider.model,
            mode = %workflow.mode(),
            "workflow ready"
        );

        Ok(Self {
            runtime,
            workflow,
            progress,
            langfuse,
        })
    }

    fn output_root(&self, explicit: Option<PathBuf>) -> PathBuf {
        explicit.unwrap_or_else(|| self.runtime.output_dir.clone())
    }

    async fn finish(&self) {
        self.progress.finish();
        if let Some(lf) = &self.langfuse {
            lf.shutdown().await;
        }
    }
}

async fn cmd_run(overrides: &ConfigOverrides, input: &Path, output_dir: Option<PathBuf>) -> Result<()> {
    let session = Session::start(overrides).await?;
    let output_root = session.output_root(output_dir);
    session.progress.expect_documents(1);

    let result = process_document(&session.workflow, input, &output_root).await;
    session.finish().await;

    let report = result?;
    print_report(&report);
    Ok(())
}

async fn cmd_batch(
    overrides: &ConfigOverrides,
    input_dir: &Path,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    let session = Session::start(overrides).await?;
    let output_root = session.output_root(output_dir);

    let inputs = collect_inputs(input_dir)?;
    if inputs.is_empty() {
        return Err(eyre!("no .html files found in '{}'", input_dir.display()));
    }
    session.progress.expect_documents(inputs.len());
    info!(documents = inputs.len(), jobs = session.runtime.concurrency, "starting batch");

    let report = process_batch(
        session.workflow.clone(),
        inputs,
        &output_root,
        session.runtime.concurrency,
    )
    .await;
    session.finish().await;

    println!();
    for doc in &report.documents {
        match &doc.outcome {
            Ok(run) => println!(
                "  ok      {}  ({} items)",
                doc.input.display(),
                run.item_count().unwrap_or(0)
            ),
            Err(e) => println!("  FAILED  {}  [{}] {e}", doc.input.display(), e.kind()),
        }
    }
    println!();
    println!(
        "  Succeeded: {}  Failed: {}  Time: {:.1}s",
        report.succeeded(),
        report.failed(),
        report.elapsed.as_secs_f64()
    );
    println!("  Output:    {}", output_root.display());
    println!();

    if report.failed() > 0 {
        return Err(eyre!(
            "{} of {} documents failed",
            report.failed(),
            report.documents.len()
        ));
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    println!("  Document processed.");
    println!("  Key:    {}", report.output_key);
    println!("  Model:  {}", report.model);
    println!("  Mode:   {}", report.mode);
    if let Some(refinement) = &report.refinement {
        println!(
            "  Refine: {} after {} turns",
            refinement.status.as_str(),
            refinement.turns
        );
    }
    println!("  Items:  {}", report.item_count().unwrap_or(0));
    for artifact in &report.artifacts {
        println!("  Wrote:  {}", artifact.path.display());
    }
    println!("  Time:   {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Workflow observer drawing an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    total: AtomicUsize,
    finished: AtomicUsize,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self {
            spinner,
            total: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    fn expect_documents(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn counter(&self) -> String {
        format!(
            "[{}/{}]",
            self.finished.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed)
        )
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl Observer for CliProgress {
    fn on_event(&self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::RunStarted { document, .. } => {
                self.spinner
                    .set_message(format!("{} Processing {document}", self.counter()));
            }
            WorkflowEvent::StageStarted { stage, .. } => {
                self.spinner.set_message(format!("{} {stage}", self.counter()));
            }
            WorkflowEvent::SwarmTurn { role, turn, .. } => {
                self.spinner.set_message(format!(
                    "{} refine: turn {turn} ({})",
                    self.counter(),
                    role.as_str()
                ));
            }
            WorkflowEvent::RunFinished { document, error, .. } => {
                self.finished.fetch_add(1, Ordering::Relaxed);
                if let Some(error) = error {
                    self.spinner.println(format!("  {document}: {error}"));
                }
            }
            WorkflowEvent::StageFinished { .. } | WorkflowEvent::RefinementFinished { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Config & checkpoint commands
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("# {}", config_file_path()?.display());
    println!("{toml_str}");
    Ok(())
}

async fn open_checkpoints() -> Result<Storage> {
    let config = load_config()?;
    let path = expand_home(&config.defaults.checkpoint_db);
    Ok(Storage::open(&path).await?)
}

async fn cmd_checkpoints_list() -> Result<()> {
    let storage = open_checkpoints().await?;
    let rows = storage.list_checkpoints().await?;
    if rows.is_empty() {
        println!("No stored checkpoints.");
        return Ok(());
    }
    for row in rows {
        let messages = serde_json::from_str::<serde_json::Value>(&row.transcript_json)
            .ok()
            .and_then(|v| v.as_array().map(|a| a.len()))
            .unwrap_or(0);
        println!(
            "{}  {}  {}  next={}  turns={}  messages={}  updated={}",
            &row.session_id[..12.min(row.session_id.len())],
            row.document_key,
            row.model_id,
            row.active_role,
            row.turns,
            messages,
            row.updated_at
        );
    }
    Ok(())
}

async fn cmd_checkpoints_clear() -> Result<()> {
    let storage = open_checkpoints().await?;
    let removed = storage.clear_checkpoints().await?;
    println!("Removed {removed} checkpoint(s).");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use specextract_core::PipelineState;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_with_bare_refine_flag() {
        let cli = Cli::try_parse_from(["specextract", "run", "spec.html", "out", "--refine"]).unwrap();
        assert_eq!(cli.refine, Some(true));
        match cli.command {
            Command::Run { input, output_dir } => {
                assert_eq!(input, PathBuf::from("spec.html"));
                assert_eq!(output_dir, Some(PathBuf::from("out")));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn batch_with_jobs_and_globals() {
        let cli = Cli::try_parse_from([
            "specextract",
            "--provider",
            "mistral",
            "--max-turns",
            "4",
            "batch",
            "docs",
            "--jobs",
            "3",
            "--refine=no",
        ])
        .unwrap();
        assert_eq!(cli.provider.as_deref(), Some("mistral"));
        assert_eq!(cli.max_turns, Some(4));
        assert_eq!(cli.refine, Some(false));
        assert!(matches!(
            cli.command,
            Command::Batch { jobs: Some(3), output_dir: None, .. }
        ));
    }

    #[test]
    fn progress_counts_finished_documents() {
        let progress = CliProgress::new();
        progress.expect_documents(2);
        progress.on_event(&WorkflowEvent::RunFinished {
            run_id: PipelineState::new("", "out", "a").run_id,
            document: "a".into(),
            elapsed: std::time::Duration::ZERO,
            error: None,
        });
        assert_eq!(progress.counter(), "[1/2]");
        progress.finish();
    }
}
