use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::info;
use std::process::Stdio;

use paratask::{create_sample_config, load_config, ConditionPoller, ParataskConfig, TaskGroup};

fn cli() -> Command {
    Command::new("paratask")
        .version(paratask::VERSION)
        .about("Run shell commands in parallel under a deadline, or poll one until it succeeds")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true)
                .default_value("paratask.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (error, warn, info, debug, trace)")
                .global(true),
        )
        .subcommand(
            Command::new("run")
                .about("Run every command concurrently; each must exit 0")
                .arg(
                    Arg::new("cmd")
                        .short('x')
                        .long("cmd")
                        .value_name("COMMAND")
                        .help("Shell command to run (repeatable)")
                        .action(ArgAction::Append)
                        .required(true),
                )
                .arg(
                    Arg::new("timeout")
                        .short('t')
                        .long("timeout")
                        .value_name("SECONDS")
                        .help("Deadline for the whole group")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("poll")
                .about("Re-run a command at a fixed interval until it exits 0")
                .arg(
                    Arg::new("cmd")
                        .short('x')
                        .long("cmd")
                        .value_name("COMMAND")
                        .help("Shell command to poll")
                        .required(true),
                )
                .arg(
                    Arg::new("timeout")
                        .short('t')
                        .long("timeout")
                        .value_name("SECONDS")
                        .help("Give up after this many seconds")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("interval")
                        .short('i')
                        .long("interval")
                        .value_name("MILLIS")
                        .help("Delay between attempts")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("sample-config")
                .about("Write the default configuration to a file")
                .arg(Arg::new("path").value_name("PATH").required(true)),
        )
}

fn init_logging(config: &ParataskConfig) {
    let level = config.log_level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn shell(command: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

async fn run_commands(config: ParataskConfig, matches: &ArgMatches) -> Result<()> {
    let commands: Vec<String> = matches
        .get_many::<String>("cmd")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let timeout = config.default_timeout();

    let summary = tokio::task::spawn_blocking(move || {
        let mut group: TaskGroup<bool> = TaskGroup::from_config("cli", &config);
        for command in commands {
            let label = command.clone();
            group.add_named(
                &label,
                move || -> Result<bool> {
                    let status = shell(&command)
                        .stdin(Stdio::null())
                        .status()
                        .with_context(|| format!("Failed to start: {command}"))?;
                    Ok(status.success())
                },
                true,
            )?;
        }

        let result = group.run_and_wait(timeout)?;
        Ok::<_, anyhow::Error>(result.summary())
    })
    .await
    .context("Task group worker thread failed")??;

    for task in &summary.tasks {
        println!("[{}] {} ({})", task.index, task.label, task.status);
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !summary.overall_success {
        anyhow::bail!(
            "{} of {} command(s) did not succeed",
            summary.total - summary.matched,
            summary.total
        );
    }
    Ok(())
}

async fn poll_command(config: ParataskConfig, matches: &ArgMatches) -> Result<()> {
    let command = matches
        .get_one::<String>("cmd")
        .context("--cmd is required")?
        .clone();
    let poller = ConditionPoller::from_config(&config)?;

    info!(
        "Polling `{command}` every {:?} for up to {:?}",
        poller.interval(),
        poller.timeout()
    );

    let report = poller
        .poll_async(&true, || {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(&command).stdin(Stdio::null());
            async move {
                let status = cmd.status().await?;
                Ok::<_, std::io::Error>(status.success())
            }
        })
        .await?;

    println!(
        "{} after {} attempt(s) in {:?}",
        report.status, report.attempts, report.elapsed
    );

    if !report.succeeded() {
        anyhow::bail!("`{command}` did not succeed within {:?}", poller.timeout());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("sample-config", sub_matches)) => {
            let path = sub_matches
                .get_one::<String>("path")
                .context("PATH is required")?;
            create_sample_config(path)?;
            println!("Sample configuration written to: {path}");
            Ok(())
        }
        Some((name, sub_matches)) => {
            let config_path = sub_matches.get_one::<String>("config");
            let config = load_config(config_path.map(|s| s.as_str()), sub_matches)?;
            init_logging(&config);

            match name {
                "run" => run_commands(config, sub_matches).await,
                "poll" => poll_command(config, sub_matches).await,
                other => anyhow::bail!("Unknown subcommand: {other}"),
            }
        }
        None => anyhow::bail!("No subcommand given"),
    }
}
