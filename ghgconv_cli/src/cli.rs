use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{command, Args, Parser, Subcommand};
use enum_dispatch::enum_dispatch;
use futures::future::join_all;
use ghgconv::config::Config;
use ghgconv::conversion_spec::ConversionSpec;
use ghgconv::mapping::MappingMode;
use ghgconv::pipeline::StageSummary;
use ghgconv::report::Report;
use ghgconv::{Conversion, Converter};
use log::{debug, info};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use spinners::{Spinner, Spinners};

use crate::display::{display_batch, display_report, display_stage_summary};
use crate::error::CliResult;

const DEFAULT_PROGRESS_SPINNER: Spinners = Spinners::Dots;
const COMPLETE_PROGRESS_STRING: &str = "✔";
const RUNNING_TAIL_STRING: &str = "...";

/// Reads a conversion specification, as TOML if the file has a `.toml` extension and as JSON
/// otherwise.
fn read_spec(path: &Path) -> CliResult<ConversionSpec> {
    let contents = std::fs::read_to_string(path).with_context(|| {
        format!(
            "Failed to read conversion spec from file: {}",
            path.display()
        )
    })?;
    let spec = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&contents)?,
        _ => serde_json::from_str(&contents)?,
    };
    Ok(spec)
}

/// Reads every column as a string so that codes such as `1.10` survive unchanged.
fn read_table(path: &Path) -> CliResult<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()
        .with_context(|| format!("Failed to read input table: {}", path.display()))?;
    debug!("{df:#?}");
    Ok(df)
}

fn write_table(mut df: DataFrame, path: &Path) -> CliResult<()> {
    let mut file = File::create(path).context("Failed to write output")?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut df)?;
    Ok(())
}

fn write_report(report: &Report, path: &Path) -> CliResult<()> {
    let file = File::create(path).context("Failed to write report")?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

/// One conversion: a specification applied to an input table.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Job {
    #[serde(default)]
    pub name: Option<String>,
    pub spec: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default)]
    pub report: Option<PathBuf>,
}

impl Job {
    fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.input.display().to_string())
    }

    /// Makes relative paths relative to `base`.
    fn relative_to(mut self, base: &Path) -> Self {
        for path in [&mut self.spec, &mut self.input, &mut self.output] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        if let Some(report) = self.report.as_mut().filter(|p| p.is_relative()) {
            *report = base.join(&*report);
        }
        self
    }

    fn run(&self, config: &Config, strict: bool) -> CliResult<(Conversion, Vec<StageSummary>)> {
        let mut spec = read_spec(&self.spec)?;
        if strict {
            spec.mapping_mode = Some(MappingMode::Strict);
        }
        if let Some(document) = &spec.provenance.document {
            info!("Converting {} from '{document}'", self.input.display());
        }
        let converter = Converter::new_with_config(config.clone());
        // Validate before reading the input
        converter.plan(&spec)?;
        let (out, conversion, summary) =
            converter.convert_dataframe_with_summary(&spec, &read_table(&self.input)?)?;

        write_table(out, &self.output)?;
        if let Some(report) = &self.report {
            write_report(&conversion.report, report)?;
        }
        Ok((conversion, summary))
    }
}

/// Result of one job of a batch.
#[derive(Debug)]
pub struct JobOutcome {
    pub name: String,
    pub rows: usize,
    pub result: Result<Report, String>,
}

/// Trait that defines what to run when a given subcommand is invoked.
#[enum_dispatch]
pub trait RunCommand {
    async fn run(&self, config: Config) -> CliResult<()>;
}

/// The `validate` command checks a conversion specification without converting anything.
#[derive(Args, Debug)]
pub struct ValidateCommand {
    #[arg(index = 1, help = "Conversion specification (JSON, or TOML with .toml extension)")]
    spec_file: PathBuf,
}

impl RunCommand for ValidateCommand {
    async fn run(&self, config: Config) -> CliResult<()> {
        info!("Running `validate` subcommand");
        let spec = read_spec(&self.spec_file)?;
        let pipeline = Converter::new_with_config(config).plan(&spec)?;
        let unknown = spec.unknown_source_codes();
        if !unknown.is_empty() {
            println!(
                "Mapping sources outside the source taxonomy: {}",
                unknown.into_iter().collect::<Vec<_>>().join(", ")
            );
        }
        println!(
            "{COMPLETE_PROGRESS_STRING} {} is valid: {}",
            self.spec_file.display(),
            pipeline.stage_names().join(" -> ")
        );
        Ok(())
    }
}

/// The `convert` command converts one input table.
#[derive(Args, Debug)]
pub struct ConvertCommand {
    #[arg(index = 1, help = "Conversion specification (JSON, or TOML with .toml extension)")]
    spec_file: PathBuf,
    #[arg(short = 'i', long, help = "Input CSV in long format")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output CSV")]
    output: PathBuf,
    #[arg(long, help = "Write the findings, warnings and conflicts to this JSON file")]
    report: Option<PathBuf>,
    #[arg(
        long,
        help = "Fail on source codes that have no mapping and are not target codes"
    )]
    strict: bool,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for ConvertCommand {
    async fn run(&self, config: Config) -> CliResult<()> {
        info!("Running `convert` subcommand");
        let sp = (!self.quiet).then(|| {
            Spinner::with_timer(
                DEFAULT_PROGRESS_SPINNER,
                "Converting".to_string() + RUNNING_TAIL_STRING,
            )
        });
        let job = Job {
            name: None,
            spec: self.spec_file.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            report: self.report.clone(),
        };
        let strict = self.strict;
        let (conversion, summary) =
            tokio::task::spawn_blocking(move || job.run(&config, strict)).await??;
        if let Some(mut s) = sp {
            s.stop_with_symbol(COMPLETE_PROGRESS_STRING);
        }
        if !self.quiet {
            display_stage_summary(&summary);
            display_report(&conversion.report);
        }
        Ok(())
    }
}

/// The `batch` command runs independent conversions listed in a JSON file concurrently.
#[derive(Args, Debug)]
pub struct BatchCommand {
    #[arg(
        index = 1,
        help = "JSON list of jobs ({name?, spec, input, output, report?}); relative paths are \
                relative to this file"
    )]
    jobs_file: PathBuf,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for BatchCommand {
    async fn run(&self, config: Config) -> CliResult<()> {
        info!("Running `batch` subcommand");
        let contents = std::fs::read_to_string(&self.jobs_file).with_context(|| {
            format!("Failed to read jobs from file: {}", self.jobs_file.display())
        })?;
        let base = self
            .jobs_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let jobs: Vec<Job> = serde_json::from_str::<Vec<Job>>(&contents)?
            .into_iter()
            .map(|job| job.relative_to(&base))
            .collect();

        let sp = (!self.quiet).then(|| {
            Spinner::with_timer(
                DEFAULT_PROGRESS_SPINNER,
                format!("Running {} conversions", jobs.len()) + RUNNING_TAIL_STRING,
            )
        });
        let handles = jobs.iter().cloned().map(|job| {
            let config = config.clone();
            tokio::task::spawn_blocking(move || job.run(&config, false))
        });
        let results = join_all(handles).await;
        if let Some(mut s) = sp {
            s.stop_with_symbol(COMPLETE_PROGRESS_STRING);
        }

        let outcomes = jobs
            .iter()
            .zip(results)
            .map(|(job, result)| {
                let result = match result {
                    Ok(inner) => inner,
                    Err(err) => Err(err.into()),
                };
                match result {
                    Ok((conversion, _)) => JobOutcome {
                        name: job.name(),
                        rows: conversion.table.len(),
                        result: Ok(conversion.report),
                    },
                    Err(err) => JobOutcome {
                        name: job.name(),
                        rows: 0,
                        result: Err(err.to_string()),
                    },
                }
            })
            .collect::<Vec<_>>();
        if !self.quiet {
            display_batch(&outcomes);
        }
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        if failed > 0 {
            return Err(anyhow!("{failed} of {} conversions failed", outcomes.len()).into());
        }
        Ok(())
    }
}

/// The entrypoint for the CLI.
#[derive(Parser, Debug)]
#[command(version, about="Convert GHG emissions inventories between category taxonomies", long_about = None, name="ghgconv")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    #[arg(
        short = 'q',
        long = "quiet",
        help = "\
            Do not print progress bar or summaries to stdout. Logs (when `RUST_LOG`\n\
            is set) will still be printed.",
        global = true
    )]
    quiet: bool,
}

/// Commands contains the list of subcommands avaliable for use in the CLI.
/// Each command should implmement the RunCommand trait and specify the list
/// of required args for that command.
#[derive(Subcommand, Debug)]
#[enum_dispatch(RunCommand)]
pub enum Commands {
    /// Check a conversion specification
    Validate(ValidateCommand),
    /// Convert one input table
    Convert(ConvertCommand),
    /// Run several conversions concurrently
    Batch(BatchCommand),
}

#[cfg(test)]
mod tests {
    use ghgconv::observation::ObservationTable;
    use tempfile::{tempdir, NamedTempFile};

    use super::*;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(format!("{}/../{name}", env!("CARGO_MANIFEST_DIR")))
    }

    #[tokio::test]
    async fn test_validate_command() {
        let validate_command = ValidateCommand {
            spec_file: fixture("test_conversion.json"),
        };
        assert!(validate_command.run(Config::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_convert_command() -> anyhow::Result<()> {
        let output = NamedTempFile::new()?;
        let report = NamedTempFile::new()?;
        let convert_command = ConvertCommand {
            spec_file: fixture("test_conversion.json"),
            input: fixture("test_input.csv"),
            output: output.path().to_path_buf(),
            report: Some(report.path().to_path_buf()),
            strict: false,
            quiet: true,
        };
        convert_command.run(Config::default()).await?;

        let report: Report = serde_json::from_reader(File::open(report.path())?)?;
        assert_eq!(report.failures().count(), 1);
        assert!(report.downscale_warnings.is_empty());

        let df = read_table(output.path())?;
        let (table, _) = ObservationTable::from_dataframe(&df)?;
        assert!(table
            .iter()
            .all(|(key, _)| key.category != "M.MEMO" && key.category != "4.A"));
        assert!(table
            .iter()
            .any(|(key, _)| key.category == "1.A.1" && key.time == 2001));
        Ok(())
    }

    #[tokio::test]
    async fn strict_convert_rejects_unmapped_codes() -> anyhow::Result<()> {
        let output = NamedTempFile::new()?;
        let convert_command = ConvertCommand {
            spec_file: fixture("test_conversion.json"),
            input: fixture("test_input.csv"),
            output: output.path().to_path_buf(),
            report: None,
            strict: true,
            quiet: true,
        };
        // `X.9` in the input has no mapping and is not a target code
        assert!(convert_command.run(Config::default()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_command() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let jobs = vec![
            Job {
                name: Some("first".into()),
                spec: fixture("test_conversion.json"),
                input: fixture("test_input.csv"),
                output: "first.csv".into(),
                report: Some("first.json".into()),
            },
            Job {
                name: None,
                spec: fixture("test_conversion.json"),
                input: fixture("test_input.csv"),
                output: "second.csv".into(),
                report: None,
            },
        ];
        let jobs_file = dir.path().join("jobs.json");
        serde_json::to_writer(File::create(&jobs_file)?, &jobs)?;
        BatchCommand {
            jobs_file,
            quiet: true,
        }
        .run(Config::default())
        .await?;
        for name in ["first.csv", "first.json", "second.csv"] {
            assert!(dir.path().join(name).exists());
        }
        Ok(())
    }

    #[test]
    fn relative_job_paths_are_resolved() {
        let job: Job = serde_json::from_str(
            r#"{"spec": "spec.json", "input": "/data/in.csv", "output": "out.csv"}"#,
        )
        .unwrap();
        let job = job.relative_to(Path::new("/jobs"));
        assert_eq!(job.spec, PathBuf::from("/jobs/spec.json"));
        assert_eq!(job.input, PathBuf::from("/data/in.csv"));
        assert_eq!(job.output, PathBuf::from("/jobs/out.csv"));
        assert_eq!(job.report, None);
    }

    #[test]
    fn cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
