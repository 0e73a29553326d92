//! Operator tool for inspecting and pruning a task snapshot.

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde_json::json;

use kb_tasker::{CleanupCriteria, TaskStatus, Tasker, TaskerConfig};

const USAGE: &str = "\
Usage:
  kb-tasker list [STATUS]
  kb-tasker get ID
  kb-tasker cancel ID
  kb-tasker delete ID...
  kb-tasker cleanup [--status STATUS] [--older-than RFC3339] [--keep N]

Environment:
  KB_TASKER_STORAGE_PATH   snapshot file (default ./data/tasks/tasks.json)
  KB_TASKER_SAVE_DIR       base directory, snapshot at <dir>/tasks/tasks.json
  RUST_LOG                 log filter (default info)";

#[derive(Debug, PartialEq)]
enum Command {
    List(Option<TaskStatus>),
    Get(String),
    Cancel(String),
    Delete(Vec<String>),
    Cleanup(CleanupCriteria),
}

impl Command {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            bail!("missing command");
        };

        match name.as_str() {
            "list" => match rest {
                [] => Ok(Self::List(None)),
                [status] => Ok(Self::List(Some(status.parse()?))),
                _ => bail!("list takes at most one status"),
            },
            "get" => Ok(Self::Get(single_id(name, rest)?)),
            "cancel" => Ok(Self::Cancel(single_id(name, rest)?)),
            "delete" => {
                if rest.is_empty() {
                    bail!("delete needs at least one task id");
                }
                Ok(Self::Delete(rest.to_vec()))
            }
            "cleanup" => Ok(Self::Cleanup(parse_cleanup(rest)?)),
            other => bail!("unknown command: {other}"),
        }
    }
}

fn single_id(command: &str, rest: &[String]) -> anyhow::Result<String> {
    match rest {
        [id] => Ok(id.clone()),
        _ => bail!("{command} takes exactly one task id"),
    }
}

fn parse_cleanup(args: &[String]) -> anyhow::Result<CleanupCriteria> {
    let mut criteria = CleanupCriteria::default();
    let mut args = args.iter();
    while let Some(flag) = args.next() {
        let value = args
            .next()
            .with_context(|| format!("{flag} needs a value"))?;
        match flag.as_str() {
            "--status" => criteria.status = Some(value.parse()?),
            "--older-than" => {
                let cutoff = DateTime::parse_from_rfc3339(value)
                    .with_context(|| format!("invalid timestamp: {value}"))?;
                criteria.older_than = Some(cutoff.with_timezone(&Utc));
            }
            "--keep" => {
                criteria.keep_count = Some(
                    value
                        .parse()
                        .with_context(|| format!("invalid keep count: {value}"))?,
                );
            }
            other => bail!("unknown cleanup option: {other}"),
        }
    }
    Ok(criteria)
}

async fn run(tasker: &Tasker, command: Command) -> anyhow::Result<serde_json::Value> {
    let output = match command {
        Command::List(status) => json!({ "tasks": tasker.list_tasks(status).await }),
        Command::Get(id) => match tasker.get_task(&id).await {
            Some(task) => json!({ "task": task }),
            None => bail!("task not found: {id}"),
        },
        Command::Cancel(id) => {
            if !tasker.cancel_task(&id).await? {
                bail!("task cannot be cancelled: {id}");
            }
            json!({ "task_id": id, "cancel_requested": true })
        }
        Command::Delete(ids) => {
            let total = ids.len();
            let results = tasker.delete_tasks_batch(&ids).await?;
            let successful = results.values().filter(|deleted| **deleted).count();
            json!({
                "total": total,
                "successful": successful,
                "failed": total - successful,
                "results": results,
            })
        }
        Command::Cleanup(criteria) => {
            let deleted = tasker.cleanup_tasks(criteria.clone()).await?;
            json!({ "deleted_count": deleted, "criteria": criteria })
        }
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    let config = TaskerConfig::from_env()?;
    tracing::debug!(path = %config.storage_path.display(), "Opening task snapshot");

    let tasker = Tasker::new(config);
    tasker.start().await?;
    let output = run(&tasker, command).await;
    tasker.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&output?)?);
    Ok(())
}
