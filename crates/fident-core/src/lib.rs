pub mod analytics;
pub mod apply;
pub mod control;
pub mod convert;
pub mod error;
pub mod inspect;
pub mod ledger;
pub mod logdoc;
pub mod pipeline;
pub mod policy;
pub mod record;
pub mod registry;
pub mod relocate;
pub mod tools;

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

pub use control::CancellationToken;
pub use convert::PolicyTest;
pub use error::{Error, Result};
pub use ledger::Diagnostic;
pub use pipeline::{Pipeline, RunPaths, Settings};
pub use policy::{PolicyEntry, PolicyFile, Tool};
pub use record::{FileRecord, Status};
pub use registry::FormatRegistry;
pub use tools::Toolbox;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// Directory (or single file) to process.
    pub root: PathBuf,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub policies_path: Option<PathBuf>,
    /// Log document location, `<root>_log.json` when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// External format name/extension table replacing the built-in one.
    #[serde(default)]
    pub format_table: Option<PathBuf>,
    #[serde(default)]
    pub blank: bool,
    #[serde(default)]
    pub extend: bool,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub remove_original: bool,
    #[serde(default = "default_true")]
    pub inspect: bool,
    #[serde(default = "default_true")]
    pub apply: bool,
    /// Retry conversion of records left pending by an earlier run.
    #[serde(default)]
    pub convert: bool,
    #[serde(default = "default_true")]
    pub relocate: bool,
    #[serde(default)]
    pub test_policies: bool,
    #[serde(default)]
    pub test_format: Option<String>,
}

impl RunOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            work_dir: None,
            policies_path: None,
            log_path: None,
            format_table: None,
            blank: false,
            extend: false,
            strict: false,
            verbose: false,
            remove_original: false,
            inspect: true,
            apply: true,
            convert: false,
            relocate: true,
            test_policies: false,
            test_format: None,
        }
    }
}

/// How a format is covered by the policy-of-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyState {
    Accepted,
    Convert(Tool),
    /// Synthesized blank entry that wants review.
    Blank,
    Missing,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatRow {
    pub format: String,
    pub name: String,
    pub count: usize,
    pub total_size: u64,
    pub policy: PolicyState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub formats: Vec<FormatRow>,
    pub duplicates: Vec<Vec<PathBuf>>,
    pub identifier_errors: Vec<(PathBuf, String)>,
    pub diagnostics: Vec<(Diagnostic, Vec<PathBuf>)>,
    pub policy_tests: Vec<PolicyTest>,
    pub removed: usize,
    pub pending: usize,
    pub added: usize,
    pub converted: usize,
    pub relocated: usize,
    pub errors: Vec<(PathBuf, String)>,
    pub policies_path: PathBuf,
    pub log_path: PathBuf,
}

impl RunSummary {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Control options for a run.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel_token: Option<CancellationToken>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// Progress callback: `(stage, current, total, message)`.
pub type ProgressCallback<'a> = dyn Fn(&str, u64, u64, &str) + Send + Sync + 'a;

/// Throttled progress reporter, emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback<'a>,
    last_emit: std::sync::Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback<'a>) -> Self {
        Self {
            inner,
            last_emit: std::sync::Mutex::new(Instant::now() - std::time::Duration::from_secs(1)),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let Ok(mut last) = self.last_emit.lock() else {
                return;
            };
            if last.elapsed().as_millis() < 200 {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }
}

/// Run the pipeline with progress reporting.
pub fn run(options: &RunOptions, tools: &Toolbox, progress_callback: &ProgressCallback<'_>) -> anyhow::Result<RunSummary> {
    run_with_control(options, tools, &RunControl::default(), progress_callback)
}

/// Run the pipeline with progress reporting and cancellation. On cancellation
/// the log document is still written before `Error::Cancelled` is returned.
pub fn run_with_control(
    options: &RunOptions,
    tools: &Toolbox,
    control: &RunControl,
    progress_callback: &ProgressCallback<'_>,
) -> anyhow::Result<RunSummary> {
    let tp = ThrottledProgress::new(progress_callback);
    if let Some(ref token) = control.cancel_token {
        token.check()?;
    }

    let registry = match &options.format_table {
        Some(path) => FormatRegistry::load(path)?,
        None => FormatRegistry::builtin()?,
    };
    let settings = Settings {
        strict: options.strict,
        verbose: options.verbose,
        remove_original: options.remove_original,
    };
    let mut paths = RunPaths::new(&options.root, options.work_dir.as_deref());
    if let Some(log) = &options.log_path {
        paths.log = log.clone();
    }
    let mut pipeline = Pipeline::new(paths, settings, registry, tools, &tp, control.cancel_token.as_ref());

    pipeline.load()?;
    pipeline.manage_policies(options.policies_path.as_deref(), options.blank, options.extend)?;

    let mut summary = RunSummary {
        formats: format_rows(&pipeline),
        duplicates: pipeline.analytics.duplicates(&pipeline.records),
        identifier_errors: pipeline
            .analytics
            .identifier_errors()
            .iter()
            .map(|&i| (pipeline.records[i].relative_path.clone(), pipeline.records[i].errors.clone()))
            .collect(),
        policies_path: pipeline.paths.policies.clone(),
        log_path: pipeline.paths.log.clone(),
        ..Default::default()
    };

    match run_stages(&mut pipeline, options, &mut summary) {
        Ok(()) => {}
        Err(Error::Cancelled) => {
            pipeline.write_log()?;
            return Err(Error::Cancelled.into());
        }
        Err(e) => return Err(e.into()),
    }
    pipeline.write_log()?;

    summary.diagnostics = pipeline
        .ledger
        .categories()
        .map(|(kind, _)| {
            let paths = pipeline
                .ledger
                .diagnostics(kind)
                .iter()
                .map(|&i| pipeline.records[i].relative_path.clone())
                .collect();
            (kind, paths)
        })
        .collect();
    summary.errors = pipeline
        .ledger
        .errors()
        .iter()
        .map(|(entry, i)| (pipeline.records[*i].relative_path.clone(), entry.msg.clone()))
        .collect();
    summary.removed = pipeline.count(Status::Removed);
    summary.pending = pipeline.count(Status::Pending);
    summary.added = pipeline.count(Status::Added);
    info!(
        removed = summary.removed,
        pending = summary.pending,
        converted = summary.converted,
        errors = summary.errors.len(),
        "run finished"
    );
    Ok(summary)
}

fn run_stages(pipeline: &mut Pipeline<'_>, options: &RunOptions, summary: &mut RunSummary) -> Result<()> {
    // applying converts everything pending anyway
    if options.convert && !options.apply {
        summary.converted += pipeline.convert()?;
    }
    if options.inspect {
        pipeline.inspect()?;
    }
    if options.test_policies || options.test_format.is_some() {
        summary.policy_tests = pipeline.test_policies(options.test_format.as_deref())?;
    }
    if options.apply {
        pipeline.apply_policies()?;
        summary.converted += pipeline.convert()?;
    }
    if options.relocate {
        summary.relocated = pipeline.relocate()?;
    }
    Ok(())
}

fn format_rows(pipeline: &Pipeline<'_>) -> Vec<FormatRow> {
    pipeline
        .analytics
        .totals(&pipeline.records)
        .into_iter()
        .map(|totals| {
            let policy = match pipeline.policies.get(&totals.format) {
                None => PolicyState::Missing,
                Some(_) if pipeline.non_default.contains(&totals.format) => PolicyState::Blank,
                Some(p) if p.accepted => PolicyState::Accepted,
                Some(p) => PolicyState::Convert(p.bin),
            };
            FormatRow {
                name: pipeline.registry.name(&totals.format).to_string(),
                format: totals.format,
                count: totals.count,
                total_size: totals.total_size,
                policy,
            }
        })
        .collect()
}
