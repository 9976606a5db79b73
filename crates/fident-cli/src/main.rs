mod logging;
mod progress;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fident_core::{
    CancellationToken, Error, PolicyState, RunControl, RunOptions, RunSummary, Toolbox,
};
use tracing::warn;

use crate::progress::StageBars;

#[derive(Parser)]
#[command(
    name = "fident",
    version,
    about = "Identify file formats, probe their integrity and normalize them according to policies"
)]
struct Cli {
    /// Directory or single file to process
    root: PathBuf,

    /// Probe the files for corruption and fix mismatching extensions
    #[arg(short, long)]
    inspect: bool,

    /// Apply the policies and convert the pending files
    #[arg(short, long)]
    apply: bool,

    /// Retry the conversion of files left pending by an earlier run
    #[arg(long)]
    convert: bool,

    /// Move converted files next to their originals and clean the working directory
    #[arg(short = 'r', long = "remove-tmp")]
    relocate: bool,

    /// Policy file to use instead of the generated one
    #[arg(short, long = "policies-path")]
    policies_path: Option<PathBuf>,

    /// Generate blank policies from the formats found
    #[arg(short, long)]
    blank: bool,

    /// Add formats missing from the given policies
    #[arg(short, long = "extend-policies")]
    extend: bool,

    /// Test all conversions of the policies with a sample of the directory
    #[arg(short, long = "test")]
    test_policies: bool,

    /// Test the conversion of one format id (e.g. fmt/5)
    #[arg(long = "test-filetype")]
    test_format: Option<String>,

    /// Quarantine originals after a verified conversion
    #[arg(short = 'x', long)]
    remove_original: bool,

    /// Quarantine files whose format has no policy; skip blank policies when generating
    #[arg(short, long)]
    strict: bool,

    /// Deeper probing of video and image files, debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Only print warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Log document to resume from and write (default: <root>_log.json)
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Working directory (default: <root>_WORKINGDIR)
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// JSON table of format names and extensions replacing the built-in one
    #[arg(long)]
    format_table: Option<PathBuf>,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init_logger(cli.quiet, cli.verbose);
    let t_total = std::time::Instant::now();

    let options = RunOptions {
        root: cli.root,
        work_dir: cli.work_dir,
        policies_path: cli.policies_path,
        log_path: cli.log_path,
        format_table: cli.format_table,
        blank: cli.blank,
        extend: cli.extend,
        strict: cli.strict,
        verbose: cli.verbose,
        remove_original: cli.remove_original,
        inspect: cli.inspect,
        apply: cli.apply,
        convert: cli.convert,
        relocate: cli.relocate,
        test_policies: cli.test_policies,
        test_format: cli.test_format,
    };

    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, finishing the current file...");
        handler_token.cancel();
    })?;

    let bars = StageBars::new(cli.quiet);
    let tools = Toolbox::external();
    let control = RunControl::new().with_cancel_token(token);
    let result = fident_core::run_with_control(&options, &tools, &control, &|stage, current, total, message| {
        bars.update(stage, current, total, message)
    });
    bars.finish();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::Cancelled)) => {
            warn!("cancelled, progress was written to the log");
            return Ok(ExitCode::from(130));
        }
        Err(e) => return Err(e),
    };

    print_summary(&summary, cli.quiet, cli.verbose);
    eprintln!("Done! ({:.2}s)", t_total.elapsed().as_secs_f64());

    Ok(if summary.has_errors() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_summary(summary: &RunSummary, quiet: bool, verbose: bool) {
    if !quiet {
        println!("\n{:<12} {:>6} {:>10}  {:<18} name", "format", "files", "size (MB)", "policy");
        for row in &summary.formats {
            let policy = match row.policy {
                PolicyState::Accepted => "accepted".to_string(),
                PolicyState::Convert(tool) => format!("convert ({})", tool.as_str()),
                PolicyState::Blank => "blank (review)".to_string(),
                PolicyState::Missing => "missing".to_string(),
            };
            println!(
                "{:<12} {:>6} {:>10.2}  {:<18} {}",
                row.format,
                row.count,
                row.total_size as f64 / 1_000_000.0,
                policy,
                row.name
            );
        }

        if !summary.duplicates.is_empty() {
            println!("\n{} duplicate group(s):", summary.duplicates.len());
            for group in &summary.duplicates {
                let paths: Vec<String> = group.iter().map(|p| p.display().to_string()).collect();
                println!("  {}", paths.join(", "));
            }
        }

        for (kind, paths) in &summary.diagnostics {
            println!("\n{}: {} file(s)", kind.label(), paths.len());
            if verbose {
                for path in paths {
                    println!("  {}", path.display());
                }
            }
        }

        for test in &summary.policy_tests {
            println!("\n{} sample {}", test.format, test.sample.display());
            println!("  {}", test.command);
            if test.verified {
                println!("  you find the file with the log in {}", test.target.parent().unwrap_or(&test.target).display());
            } else {
                println!("  {}", test.message);
            }
        }
    }

    if !summary.identifier_errors.is_empty() {
        eprintln!("\n{} file(s) with identifier errors:", summary.identifier_errors.len());
        for (path, error) in &summary.identifier_errors {
            eprintln!("  {}: {}", path.display(), error);
        }
    }
    if !summary.errors.is_empty() {
        eprintln!("\n{} processing error(s):", summary.errors.len());
        for (path, msg) in &summary.errors {
            eprintln!("  {}: {}", path.display(), msg);
        }
    }

    if !quiet {
        println!(
            "\n{} removed, {} pending, {} added, {} converted, {} relocated",
            summary.removed, summary.pending, summary.added, summary.converted, summary.relocated
        );
        println!("policies: {}", summary.policies_path.display());
        println!("log: {}", summary.log_path.display());
    }
}
