//! The `run` subcommand.

use std::num::NonZeroUsize;

use batch_proofer::{
    async_utils::io::read_jsonl_or_csv,
    config::{BatchSettings, ExecutionPolicy},
    engines::{CheckerKind, CollaboratorOpts, Language, RecognizerKind, collaborators_for},
    export::{ExportFormat, export_records},
    prelude::*,
    rate_limit::RateLimit,
    scheduler::BatchEngine,
};
use clap::Args;
use futures::StreamExt as _;

use crate::ui::Ui;

/// Options for the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// Files to process.
    #[clap(value_name = "FILE")]
    files: Vec<PathBuf>,

    /// A CSV or JSONL file listing more inputs, one per row, in a `path`
    /// column.
    #[clap(long = "input", value_name = "LIST")]
    input_path: Option<PathBuf>,

    /// Load settings from a TOML or JSON file. Flags override the file.
    #[clap(long = "config", value_name = "FILE")]
    config_path: Option<PathBuf>,

    /// Process one file at a time, in order.
    #[clap(long, conflicts_with = "job_count")]
    sequential: bool,

    /// Max number of files to process at a time.
    #[clap(short = 'j', long = "jobs")]
    job_count: Option<NonZeroUsize>,

    /// Maximum automatic retries per file.
    #[clap(long)]
    max_retries: Option<u32>,

    /// Don't retry failed files automatically.
    #[clap(long)]
    no_auto_retry: bool,

    /// Delay before an automatic retry, in seconds.
    #[clap(long, value_name = "SECS")]
    retry_delay: Option<f64>,

    /// Apply the first suggestion for each grammar issue.
    #[clap(long)]
    auto_correct: bool,

    /// How to extract text.
    #[clap(long = "engine", value_enum, default_value_t)]
    recognizer: RecognizerKind,

    /// How to check grammar.
    #[clap(long = "grammar", value_enum, default_value_t)]
    checker: CheckerKind,

    /// Language code for OCR and grammar checking.
    #[clap(long, default_value = "en-US")]
    language: Language,

    /// Rate limit for remote services, like "10/s" or "100/m".
    #[clap(long)]
    rate_limit: Option<RateLimit>,

    /// Base URL of the OCR backend.
    #[clap(long, env = "BACKEND_URL")]
    backend_url: Option<String>,

    /// Base URL of a LanguageTool server.
    #[clap(long, env = "LANGUAGETOOL_URL")]
    languagetool_url: Option<String>,

    /// Export failed files as well as completed ones.
    #[clap(long)]
    include_failed: bool,

    /// Output format. Defaults to CSV for `.csv` files, JSONL otherwise.
    #[clap(long, value_enum)]
    format: Option<ExportFormat>,

    /// What portion of inputs should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    allowed_failure_rate: f32,

    /// Where to write results. Use "-" or omit for standard output.
    #[clap(short = 'o', long = "out")]
    output_path: Option<PathBuf>,
}

impl RunOpts {
    /// The output file, or `None` for standard output.
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path
            .as_deref()
            .filter(|path| *path != Path::new("-"))
    }

    /// Apply our flags on top of `settings`.
    fn apply_to(&self, settings: &mut BatchSettings) {
        if self.sequential {
            settings.policy = ExecutionPolicy::Sequential;
        } else if let Some(max_parallel_jobs) = self.job_count {
            settings.policy = ExecutionPolicy::Parallel { max_parallel_jobs };
        }
        if let Some(max_retries) = self.max_retries {
            settings.max_retries = max_retries;
        }
        if self.no_auto_retry {
            settings.auto_retry = false;
        }
        if let Some(secs) = self.retry_delay {
            settings.retry_delay_ms = (secs.max(0.0) * 1000.0).round() as u64;
        }
        if self.auto_correct {
            settings.auto_correct = true;
        }
    }

    fn collaborator_opts(&self) -> CollaboratorOpts {
        CollaboratorOpts {
            recognizer: self.recognizer,
            checker: self.checker,
            backend_url: self.backend_url.clone(),
            languagetool_url: self.languagetool_url.clone(),
            language: self.language.clone(),
            rate_limit: self.rate_limit.clone(),
        }
    }
}

/// One row of an `--input` list.
#[derive(Debug, Deserialize)]
struct InputRow {
    path: PathBuf,
}

/// Read the paths listed in a CSV or JSONL file.
async fn read_input_list(path: &Path) -> Result<Vec<PathBuf>> {
    let mut rows = read_jsonl_or_csv(path).await?;
    let mut paths = vec![];
    while let Some(row) = rows.next().await {
        let row = serde_json::from_value::<InputRow>(row?)
            .with_context(|| format!("bad input row in {}", path.display()))?;
        paths.push(row.path);
    }
    Ok(paths)
}

/// The `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, opts: &RunOpts) -> Result<()> {
    let mut settings = match &opts.config_path {
        Some(path) => BatchSettings::load(path).await?,
        None => BatchSettings::default(),
    };
    opts.apply_to(&mut settings);
    debug!(?settings, "using settings");

    let collaborators = collaborators_for(&opts.collaborator_opts())?;
    let engine = BatchEngine::new(collaborators, settings);

    let mut paths = opts.files.clone();
    if let Some(input_path) = &opts.input_path {
        paths.extend(read_input_list(input_path).await?);
    }
    if paths.is_empty() {
        bail!("no input files given");
    }
    engine.add_paths(paths);

    let bar = ui.run_progress(engine.snapshot().len());

    engine.start()?;
    let mut changes = engine.changes();
    let wait = engine.wait();
    tokio::pin!(wait);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    loop {
        tokio::select! {
            result = &mut wait => {
                result?;
                break;
            }
            Ok(()) = changes.changed() => {
                bar.update(&engine.progress().counters);
            }
            _ = &mut ctrl_c, if !interrupted => {
                warn!("interrupted, stopping batch run");
                interrupted = true;
                if let Err(err) = engine.stop() {
                    debug!(%err, "batch run had already stopped");
                }
            }
        }
    }
    let counters = engine.progress().counters;
    bar.finish(&counters, interrupted);

    // Summarize.
    let stats = engine.statistics();
    ui.display_message("📊", &stats.to_string());
    if let Some(confidence) = stats.avg_confidence {
        ui.display_message(
            "📝",
            &format!(
                "{} words, {} grammar issues, {:.0}% mean confidence",
                stats.total_words,
                stats.total_grammar_errors,
                confidence * 100.0
            ),
        );
    }

    // Export.
    let output_path = opts.output_path();
    let format = opts
        .format
        .unwrap_or_else(|| ExportFormat::from_path(output_path));
    let records = engine.snapshot();
    let exported =
        export_records(&records, output_path, format, opts.include_failed).await?;
    if let Some(path) = output_path {
        ui.display_message(
            "💾",
            &format!("Exported {} records to {}", exported, path.display()),
        );
    }

    if interrupted {
        bail!("batch run was interrupted");
    }
    let finished = stats.completed + stats.failed;
    let failure_rate = if finished > 0 {
        stats.failed as f32 / finished as f32
    } else {
        0.0
    };
    if failure_rate > opts.allowed_failure_rate {
        Err(anyhow!(
            "{}/{} ({:.2}%) of files failed, but only {:.2}% were allowed",
            stats.failed,
            finished,
            failure_rate * 100.0,
            opts.allowed_failure_rate * 100.0
        ))
    } else {
        if stats.failed > 0 {
            ui.display_message(
                "❌",
                &format!("{} files could not be processed", stats.failed),
            );
        }
        Ok(())
    }
}
