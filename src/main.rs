use anyhow::{Context, Result};
use ovfbuild::cli::commands::{BuildCommand, HistoryCommand, ValidateCommand};
use ovfbuild::cli::output::*;
use ovfbuild::cli::{Cli, Command};
use ovfbuild::core::{BuildConfig, ConfigError, ExecutionStatus, Ui};
use ovfbuild::execution::{BuildError, Builder, RunnerEvent};
use ovfbuild::persistence::{BuildRecord, InMemoryPersistence, PersistenceBackend};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Build(cmd) => run_build(cmd, cli.verbose).await?,
        Command::Validate(cmd) => validate_build(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

async fn open_store(ephemeral: bool) -> Result<Arc<dyn PersistenceBackend>> {
    if ephemeral {
        return Ok(Arc::new(InMemoryPersistence::new()));
    }
    history_store().await
}

#[cfg(feature = "sqlite")]
async fn history_store() -> Result<Arc<dyn PersistenceBackend>> {
    let store = ovfbuild::persistence::SqliteBuildStore::with_default_path().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn history_store() -> Result<Arc<dyn PersistenceBackend>> {
    warn!("Built without sqlite support, build history is not kept");
    Ok(Arc::new(InMemoryPersistence::new()))
}

fn print_config_error(err: &ConfigError) {
    println!("{} Build configuration is invalid:", CROSS);
    match err {
        ConfigError::Invalid(invalid) => {
            for message in &invalid.errors {
                println!("  * {}", style(message).red());
            }
            for message in &invalid.warnings {
                println!("  {} {}", WARN, style(message).yellow());
            }
        }
        other => println!("  {}", style(other).red()),
    }
}

async fn run_build(cmd: &BuildCommand, verbose: bool) -> Result<()> {
    let mut config = BuildConfig::from_file(&cmd.file)
        .with_context(|| format!("Failed to load build config {}", cmd.file))?;
    if cmd.force {
        config.force = true;
    }

    let (mut builder, warnings) = match Builder::prepare(config).await {
        Ok(prepared) => prepared,
        Err(e) => {
            print_config_error(&e);
            std::process::exit(1);
        }
    };
    for message in &warnings {
        println!("{} {}", WARN, style(message).yellow());
    }

    let build_name = builder.config().build_name.clone();
    println!("{} Starting build {}", ROCKET, style(&build_name).bold());

    let store = open_store(cmd.no_history).await?;
    let mut record = BuildRecord::start(&build_name, &builder.config().vm_name);
    store.save_build(&record).await?;

    if verbose {
        let total = builder.steps().len();
        let position = AtomicUsize::new(0);
        builder.add_event_handler(move |event| {
            if let RunnerEvent::StepStarted { .. } = event {
                position.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(line) = format_runner_event(event, position.load(Ordering::SeqCst), total) {
                println!("{}", line);
            }
        });
    }

    let signal = builder.cancel_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("{} Interrupt received, cancelling build...", WARN);
            signal.cancel();
        }
    });

    let ui: Arc<dyn Ui> = Arc::new(ConsoleUi::new(&build_name));
    let result = builder.run(ui).await;

    match &result {
        Ok(artifact) => {
            record.finish(ExecutionStatus::Completed);
            record.artifact_dir = Some(artifact.dir.clone());
        }
        Err(e) => {
            let status = match e {
                BuildError::Cancelled => ExecutionStatus::Cancelled,
                BuildError::Halted => ExecutionStatus::Halted,
                _ => ExecutionStatus::Failed,
            };
            record.finish(status);
            record.error = Some(e.to_string());
        }
    }

    if let Err(e) = store.save_build(&record).await {
        warn!("Failed to save build history: {:#}", e);
    } else if !cmd.no_history {
        println!(
            "\n{} Build saved to history (ID: {})",
            INFO,
            style(&record.build_id.to_string()[..8]).dim()
        );
    }

    match result {
        Ok(artifact) => {
            println!(
                "\n{} {} completed {}",
                CHECK,
                style(&build_name).bold(),
                style("successfully").green()
            );
            println!("  {}", artifact);
            for file in &artifact.files {
                println!("    {}", style(file.display()).dim());
            }
            Ok(())
        }
        Err(e) => {
            println!("\n{} {} {}", CROSS, style(&build_name).bold(), style("failed").red());
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn validate_build(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating build configuration...", INFO);

    let mut config = match BuildConfig::from_file(&cmd.file) {
        Ok(config) => config,
        Err(e) => {
            print_config_error(&e);
            std::process::exit(1);
        }
    };

    match config.prepare().await {
        Ok(warnings) => {
            println!("{} Build configuration is valid!", CHECK);
            println!("  Build: {}", style(&config.build_name).bold());
            println!("  Source: {}", style(&config.source_path).cyan());
            println!("  VM name: {}", style(&config.vm_name).cyan());
            println!("  Output: {}", style(config.output_directory.display()).cyan());
            for message in &warnings {
                println!("  {} {}", WARN, style(message).yellow());
            }

            if cmd.json {
                let data = serde_json::json!({ "config": config, "warnings": warnings });
                println!("\n{}", serde_json::to_string_pretty(&data)?);
            }
            Ok(())
        }
        Err(e) => {
            print_config_error(&e);
            std::process::exit(1);
        }
    }
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_store(false).await?;

    if let Some(id) = &cmd.build_id {
        let build_id = uuid::Uuid::parse_str(id).context("Invalid build ID format")?;
        match store.load_build(build_id).await? {
            Some(record) => print_build_details(&record, cmd.json)?,
            None => println!("{} Build not found", WARN),
        }
        return Ok(());
    }

    let mut builds = match &cmd.build {
        Some(name) => store.list_builds(name).await?,
        None => {
            let mut all = Vec::new();
            for name in store.list_build_names().await? {
                all.extend(store.list_builds(&name).await?);
            }
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all
        }
    };
    builds.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "builds": builds });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if builds.is_empty() {
        println!("{} No builds found", INFO);
        return Ok(());
    }

    println!("{} Build history (showing latest {}):", INFO, cmd.limit);
    for record in &builds {
        println!("  {}", format_build_record(record));
    }

    Ok(())
}

fn print_build_details(record: &BuildRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }

    println!("{} Build Details", INFO);
    println!("  ID: {}", style(record.build_id).cyan());
    println!("  Build: {}", style(&record.build_name).bold());
    println!("  VM: {}", style(&record.vm_name).bold());
    println!("  Status: {}", format_status(record.status));
    println!("  Started: {}", style(record.started_at.to_rfc3339()).dim());
    if let Some(completed) = record.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(record.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    if let Some(dir) = &record.artifact_dir {
        println!("  Artifact: {}", style(dir.display()).cyan());
    }
    if let Some(error) = &record.error {
        println!("  Error: {}", style(error).red());
    }

    Ok(())
}
