//! Command-line surface over the metaflow-lite core.
//!
//! A flow binary delegates to [`main_with_registry`] after registering
//! its flows; the standalone `metaflow` binary exposes the read-only
//! inspection commands without any flows.

use clap::{Parser, Subcommand};
use metaflow_lite_core::client::MetaflowClient;
use metaflow_lite_core::config::ConfigInputs;
use metaflow_lite_core::datastore::DatastoreConfig;
use metaflow_lite_core::flow::FlowRegistry;
use metaflow_lite_core::metadata::MetadataConfig;
use metaflow_lite_core::scheduler::{RunOptions, Scheduler};
use metaflow_lite_core::types::gen_run_id;
use metaflow_lite_core::worker;
use std::collections::BTreeMap;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "metaflow", about = "Run and inspect metaflow-lite flows")]
pub struct Cli {
    /// Metadata provider: local or service.
    #[arg(long, global = true)]
    pub metadata: Option<String>,

    /// Datastore: local or s3.
    #[arg(long, global = true)]
    pub datastore: Option<String>,

    /// Suppress informational logging.
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute a registered flow.
    Run {
        /// Flow name; optional when exactly one flow is registered.
        #[arg(long)]
        flow: Option<String>,
        /// User tags to attach to the run.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Write the fresh run id to this file.
        #[arg(long)]
        run_id_file: Option<String>,
        /// Remote fan-out budget (the local scheduler is serial).
        #[arg(long, default_value_t = 16)]
        max_workers: usize,
        /// Parameter override: NAME=VALUE.
        #[arg(long = "param", value_parser = parse_kv)]
        params: Vec<(String, String)>,
        /// Config literal: NAME=JSON.
        #[arg(long = "config-value", value_parser = parse_kv)]
        config_values: Vec<(String, String)>,
        /// Config file: NAME=PATH.
        #[arg(long = "config", value_parser = parse_kv)]
        config_files: Vec<(String, String)>,
    },

    /// Re-execute a failed run from its first failed step (or a named
    /// one), cloning everything before it.
    Resume {
        /// Step to re-execute from.
        step: Option<String>,
        #[arg(long)]
        origin_run_id: String,
        #[arg(long)]
        flow: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        run_id_file: Option<String>,
        #[arg(long, default_value_t = 16)]
        max_workers: usize,
    },

    /// Print a task's user artifacts as JSON.
    Dump { pathspec: String },

    /// Print a task's captured log stream.
    Logs {
        pathspec: String,
        #[arg(long, default_value = "stdout")]
        stream: String,
    },

    /// Inspect or mutate a run's user tags.
    Tag {
        #[command(subcommand)]
        cmd: TagCmd,
    },

    /// Fetch rendered cards.
    Card {
        #[command(subcommand)]
        cmd: CardCmd,
    },

    /// Show the structure of a registered flow.
    Show {
        #[arg(long)]
        flow: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TagCmd {
    List { run_pathspec: String },
    Add { run_pathspec: String, tags: Vec<String> },
    Remove { run_pathspec: String, tags: Vec<String> },
    Replace {
        run_pathspec: String,
        #[arg(long = "remove")]
        remove: Vec<String>,
        #[arg(long = "add")]
        add: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum CardCmd {
    Get {
        pathspec: String,
        #[arg(long, default_value_t = 0)]
        index: usize,
    },
    List { pathspec: String },
}

/// Entry point for flow binaries: bootstrap worker re-executions, then
/// dispatch the CLI. Exit code 0 on success, non-zero on failure.
pub fn main_with_registry(registry: FlowRegistry) -> ExitCode {
    worker::bootstrap(&registry);

    let cli = Cli::parse();
    init_logging(cli.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli, &registry)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn parse_kv(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))
}

fn provider_configs(cli_datastore: &Option<String>, cli_metadata: &Option<String>) -> anyhow::Result<(DatastoreConfig, MetadataConfig)> {
    let datastore = match cli_datastore.as_deref() {
        Some("s3") => DatastoreConfig::S3 {
            root: std::env::var("METAFLOW_DATASTORE_SYSROOT_S3")
                .map_err(|_| anyhow::anyhow!("--datastore s3 requires METAFLOW_DATASTORE_SYSROOT_S3"))?,
        },
        Some("local") => DatastoreConfig::Local {
            root: metaflow_lite_core::datastore_local::local_sysroot(),
        },
        Some(other) => anyhow::bail!("unknown datastore '{other}'"),
        None => DatastoreConfig::from_env()?,
    };
    let metadata = match cli_metadata.as_deref() {
        Some("service") => MetadataConfig::Service {
            url: std::env::var("METAFLOW_SERVICE_URL")
                .map_err(|_| anyhow::anyhow!("--metadata service requires METAFLOW_SERVICE_URL"))?,
        },
        Some("local") => MetadataConfig::Local {
            root: metaflow_lite_core::datastore_local::local_sysroot(),
        },
        Some(other) => anyhow::bail!("unknown metadata provider '{other}'"),
        None => MetadataConfig::from_env()?,
    };
    Ok((datastore, metadata))
}

fn pick_flow(registry: &FlowRegistry, flow: &Option<String>) -> anyhow::Result<String> {
    if let Some(name) = flow {
        registry.get(name)?;
        return Ok(name.clone());
    }
    let names = registry.names();
    match names.as_slice() {
        [only] => Ok(only.to_string()),
        [] => anyhow::bail!("no flows registered in this binary"),
        many => anyhow::bail!("several flows registered ({}); pass --flow", many.join(", ")),
    }
}

async fn dispatch(cli: Cli, registry: &FlowRegistry) -> anyhow::Result<()> {
    let (datastore_cfg, metadata_cfg) = provider_configs(&cli.datastore, &cli.metadata)?;
    let datastore = datastore_cfg.build()?;
    let metadata = metadata_cfg.build()?;

    match cli.command {
        Command::Run {
            flow,
            tags,
            run_id_file,
            max_workers,
            params,
            config_values,
            config_files,
        } => {
            let flow_name = pick_flow(registry, &flow)?;
            let flow_def = registry.get(&flow_name)?;
            let run_id = gen_run_id();
            if let Some(path) = &run_id_file {
                std::fs::write(path, &run_id)?;
            }
            let options = RunOptions {
                tags,
                param_overrides: params.into_iter().collect::<BTreeMap<_, _>>(),
                config_inputs: ConfigInputs {
                    values: config_values.into_iter().collect(),
                    files: config_files.into_iter().collect(),
                },
                origin_run_id: None,
                max_workers,
                worker_exe: None,
            };
            let mut scheduler = Scheduler::new(
                flow_def,
                datastore,
                metadata,
                datastore_cfg,
                metadata_cfg,
                run_id.clone(),
                options,
            );
            scheduler.execute(None).await?;
            println!("{flow_name}/{run_id}");
            Ok(())
        }

        Command::Resume {
            step,
            origin_run_id,
            flow,
            tags,
            run_id_file,
            max_workers,
        } => {
            let flow_name = pick_flow(registry, &flow)?;
            let flow_def = registry.get(&flow_name)?;
            let run_id = gen_run_id();
            if let Some(path) = &run_id_file {
                std::fs::write(path, &run_id)?;
            }
            let options = RunOptions {
                tags,
                origin_run_id: Some(origin_run_id),
                max_workers,
                ..Default::default()
            };
            let mut scheduler = Scheduler::new(
                flow_def,
                datastore,
                metadata,
                datastore_cfg,
                metadata_cfg,
                run_id.clone(),
                options,
            );
            scheduler.execute(step.as_deref()).await?;
            println!("{flow_name}/{run_id}");
            Ok(())
        }

        Command::Dump { pathspec } => {
            let client = MetaflowClient::new(datastore, metadata).with_namespace(None);
            let task = client.task(&pathspec).await?;
            let data = task.data().await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
            Ok(())
        }

        Command::Logs { pathspec, stream } => {
            let client = MetaflowClient::new(datastore, metadata).with_namespace(None);
            let task = client.task(&pathspec).await?;
            let content = match stream.as_str() {
                "stdout" => task.stdout().await?,
                "stderr" => task.stderr().await?,
                other => anyhow::bail!("unknown stream '{other}' (stdout|stderr)"),
            };
            print!("{content}");
            Ok(())
        }

        Command::Tag { cmd } => {
            let client = MetaflowClient::new(datastore, metadata).with_namespace(None);
            match cmd {
                TagCmd::List { run_pathspec } => {
                    let run = client.run(&run_pathspec).await?;
                    for tag in run.user_tags().await? {
                        println!("{tag}");
                    }
                    for tag in run.system_tags().await? {
                        println!("{tag} (system)");
                    }
                }
                TagCmd::Add { run_pathspec, tags } => {
                    let run = client.run(&run_pathspec).await?;
                    let refs: Vec<&str> = tags.iter().map(|s| s.as_str()).collect();
                    run.add_tags(&refs).await?;
                }
                TagCmd::Remove { run_pathspec, tags } => {
                    let run = client.run(&run_pathspec).await?;
                    let refs: Vec<&str> = tags.iter().map(|s| s.as_str()).collect();
                    run.remove_tags(&refs).await?;
                }
                TagCmd::Replace {
                    run_pathspec,
                    remove,
                    add,
                } => {
                    let run = client.run(&run_pathspec).await?;
                    let remove: Vec<&str> = remove.iter().map(|s| s.as_str()).collect();
                    let add: Vec<&str> = add.iter().map(|s| s.as_str()).collect();
                    run.replace_tags(&remove, &add).await?;
                }
            }
            Ok(())
        }

        Command::Card { cmd } => match cmd {
            CardCmd::Get { pathspec, index } => {
                let ps: metaflow_lite_core::Pathspec = pathspec.parse()?;
                match datastore.load_card(&ps, index).await? {
                    Some((html, _)) => {
                        println!("{html}");
                        Ok(())
                    }
                    None => anyhow::bail!("no card {index} at {pathspec}"),
                }
            }
            CardCmd::List { pathspec } => {
                let ps: metaflow_lite_core::Pathspec = pathspec.parse()?;
                for (index, meta) in datastore.list_cards(&ps).await? {
                    println!(
                        "{index}\t{}\t{}\t{}",
                        meta.card_type,
                        meta.id.unwrap_or_default(),
                        meta.hash
                    );
                }
                Ok(())
            }
        },

        Command::Show { flow } => {
            let flow_name = pick_flow(registry, &flow)?;
            let flow_def = registry.get(&flow_name)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&flow_def.graph().info_value())?
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kv() {
        assert_eq!(
            parse_kv("alpha=0.5").unwrap(),
            ("alpha".to_string(), "0.5".to_string())
        );
        assert_eq!(
            parse_kv("cfg={\"a\"=1}").unwrap().0,
            "cfg".to_string()
        );
        assert!(parse_kv("novalue").is_err());
    }

    /// The clap surface parses the documented command shapes
    #[test]
    fn test_cli_shapes() {
        let cli = Cli::try_parse_from([
            "metaflow", "run", "--tag", "exp:1", "--run-id-file", "/tmp/rid",
            "--param", "alpha=0.9",
        ])
        .unwrap();
        match cli.command {
            Command::Run { tags, params, .. } => {
                assert_eq!(tags, vec!["exp:1"]);
                assert_eq!(params[0].0, "alpha");
            }
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from([
            "metaflow", "resume", "middle", "--origin-run-id", "123",
        ])
        .unwrap();
        match cli.command {
            Command::Resume { step, origin_run_id, .. } => {
                assert_eq!(step.as_deref(), Some("middle"));
                assert_eq!(origin_run_id, "123");
            }
            _ => panic!("expected resume"),
        }

        let cli = Cli::try_parse_from(["metaflow", "dump", "F/1/start/1"]).unwrap();
        assert!(matches!(cli.command, Command::Dump { .. }));

        let cli =
            Cli::try_parse_from(["metaflow", "tag", "add", "F/1", "golden"]).unwrap();
        assert!(matches!(cli.command, Command::Tag { .. }));

        let cli = Cli::try_parse_from(["metaflow", "card", "list", "F/1/s/1"]).unwrap();
        assert!(matches!(cli.command, Command::Card { .. }));
    }
}
