//! `imagesmith`: build golden images from templates.
//!
//! `imagesmith build` runs one build per template, concurrently, and prints
//! the stage-tagged progress log to stdout. Diagnostics go to stderr through
//! `tracing`. The process exits with the code of the first failed build, in
//! argument order.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use imagesmith::cancellation::CancellationToken;
use imagesmith::config::{validate, BuildConfig, TemplateLoader};
use imagesmith::coordinator::BuildCoordinator;
use imagesmith::core::BuildJob;
use imagesmith::errors::{BuildError, EXIT_OK};
use imagesmith::events::{ConsoleEventSink, FanoutEventSink, LoggingEventSink};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "imagesmith", version, about = "Build hardened golden machine images")]
struct Cli {
    /// Diagnostic log format on stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run builds, one per template, concurrently.
    Build(BuildOpts),
    /// Load a template and run the pre-flight checks only.
    Validate(ValidateOpts),
}

/// Variable sources shared by both commands.
#[derive(Args)]
struct VariableOpts {
    /// JSON object of variable values; may be repeated, later files win.
    #[arg(long = "var-file", value_name = "FILE")]
    var_files: Vec<PathBuf>,

    /// A single variable value; applied after the var files.
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,

    /// Vault-style JSON object whose values are all sensitive.
    #[arg(long, value_name = "FILE")]
    credentials_file: Option<PathBuf>,
}

impl VariableOpts {
    fn loader(&self) -> TemplateLoader {
        let mut loader = TemplateLoader::new();
        for file in &self.var_files {
            loader = loader.with_var_file(file);
        }
        for var in &self.vars {
            loader = loader.with_var(var);
        }
        if let Some(ref creds) = self.credentials_file {
            loader = loader.with_credentials_file(creds);
        }
        loader
    }
}

#[derive(Args)]
struct BuildOpts {
    /// Build templates.
    #[arg(required = true, value_name = "TEMPLATE")]
    templates: Vec<PathBuf>,

    #[command(flatten)]
    variables: VariableOpts,

    /// Manifest to append to, overriding the templates' own.
    #[arg(long, value_name = "PATH")]
    manifest: Option<PathBuf>,
}

#[derive(Args)]
struct ValidateOpts {
    /// Build template.
    #[arg(value_name = "TEMPLATE")]
    template: PathBuf,

    #[command(flatten)]
    variables: VariableOpts,
}

/// Install the tracing subscriber.
///
/// Logs go to stderr, filtered by `RUST_LOG` (default `info`), so stdout
/// carries only the progress log.
fn install_tracing(format: LogFormat) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter_layer);

    match format {
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    install_tracing(cli.log_format);

    let code = match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "imagesmith failed");
            1
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(command: Commands) -> anyhow::Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Init tokio runtime")?;
    match command {
        Commands::Build(opts) => Ok(runtime.block_on(build(opts))),
        Commands::Validate(opts) => Ok(check(&opts)),
    }
}

async fn build(opts: BuildOpts) -> i32 {
    let mut loader = opts.variables.loader();
    if let Some(ref manifest) = opts.manifest {
        loader = loader.with_manifest(manifest);
    }

    // Every template must load before any build starts.
    let mut jobs = Vec::with_capacity(opts.templates.len());
    for path in &opts.templates {
        match loader.load(path) {
            Ok(config) => jobs.push(BuildJob::new(config)),
            Err(e) => {
                error!(template = %path.display(), error = %e, "Template rejected");
                return BuildError::Configuration(e).exit_code();
            }
        }
    }

    let cancel = Arc::new(CancellationToken::new());
    tokio::spawn(cancel_on_signal(Arc::clone(&cancel)));

    let sink = FanoutEventSink::new()
        .with_sink(Arc::new(ConsoleEventSink::stdout()))
        .with_sink(Arc::new(LoggingEventSink::new(Level::DEBUG)));
    let coordinator = BuildCoordinator::new().with_event_sink(Arc::new(sink));

    info!(builds = jobs.len(), "Starting builds");
    let results = coordinator.run_many(jobs, cancel).await;

    let mut exit = EXIT_OK;
    for (path, result) in opts.templates.iter().zip(&results) {
        match result {
            Ok(report) => info!(
                template = %path.display(),
                artifact_id = %report.artifact.id,
                duration_s = report.duration_ms / 1000.0,
                "Build succeeded"
            ),
            Err(failure) => {
                error!(
                    template = %path.display(),
                    build_id = %failure.build_id,
                    state = %failure.state,
                    kind = failure.error.kind(),
                    "Build failed"
                );
                for teardown in &failure.teardown.failures {
                    warn!(build_id = %failure.build_id, error = %teardown, "Resource may have leaked");
                }
                if exit == EXIT_OK {
                    exit = failure.exit_code();
                }
            }
        }
    }
    exit
}

fn check(opts: &ValidateOpts) -> i32 {
    match load_and_validate(&opts.variables.loader(), &opts.template) {
        Ok((config, steps)) => {
            println!(
                "{}: ok (guest {}, {steps} boot steps, build {})",
                opts.template.display(),
                config.template.source.guest_name,
                config.build_id
            );
            EXIT_OK
        }
        Err(e) => {
            error!(template = %opts.template.display(), error = %e, "Template rejected");
            e.exit_code()
        }
    }
}

fn load_and_validate(loader: &TemplateLoader, path: &Path) -> Result<(BuildConfig, usize), BuildError> {
    let config = loader.load(path)?;
    let preflight = validate(&config)?;
    Ok((config, preflight.boot_sequence.len()))
}

/// Cancels `cancel` on SIGINT or SIGTERM. Builds then tear down and return.
async fn cancel_on_signal(cancel: Arc<CancellationToken>) {
    let signal = wait_for_signal().await;
    warn!(signal, "Cancelling builds; tearing down");
    cancel.cancel(format!("received {signal}"));
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            return interrupt().await;
        }
    };
    tokio::select! {
        name = interrupt() => name,
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    interrupt().await
}

async fn interrupt() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "SIGINT",
        Err(e) => {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_arguments() {
        let cli = Cli::parse_from([
            "imagesmith",
            "build",
            "rhel9.json",
            "alma9.json",
            "--var-file",
            "site.json",
            "--var",
            "guest_name=rhel9-nightly",
            "--manifest",
            "out/manifest.json",
            "--log-format",
            "json",
        ]);
        assert!(matches!(cli.log_format, LogFormat::Json));
        match cli.command {
            Commands::Build(opts) => {
                assert_eq!(opts.templates.len(), 2);
                assert_eq!(opts.variables.var_files, vec![PathBuf::from("site.json")]);
                assert_eq!(opts.variables.vars, vec!["guest_name=rhel9-nightly"]);
                assert_eq!(opts.manifest, Some(PathBuf::from("out/manifest.json")));
            }
            Commands::Validate(_) => panic!("expected build"),
        }
    }

    #[test]
    fn test_build_requires_a_template() {
        assert!(Cli::try_parse_from(["imagesmith", "build"]).is_err());
    }

    #[test]
    fn test_validate_reports_configuration_exit_code() {
        let opts = ValidateOpts {
            template: PathBuf::from("/nonexistent/template.json"),
            variables: VariableOpts {
                var_files: Vec::new(),
                vars: Vec::new(),
                credentials_file: None,
            },
        };
        assert_eq!(check(&opts), 2);
    }
}
