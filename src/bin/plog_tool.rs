use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use partition_processor::core::{FIRST_OFFSET, Offset, PartitionId, ProcessorError, WorkspaceId};
use partition_processor::event::CommittedEvent;
use partition_processor::processor::replay_partition_state;
use partition_processor::storage::{EventLog, JournalOptions, JournalStorage};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "plog-tool")]
#[command(about = "Developer tooling for partition processor journals")]
struct Cli {
    /// Journal root directory
    #[arg(long)]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List partitions that have a journal
    Partitions,
    /// Print a partition's PLog as JSON lines
    Dump {
        #[arg(long)]
        partition: PartitionId,
        #[arg(long, default_value_t = FIRST_OFFSET)]
        from: Offset,
        #[arg(long)]
        to: Option<Offset>,
    },
    /// Print a workspace's WLog as JSON lines
    Wlog {
        #[arg(long)]
        workspace: WorkspaceId,
        #[arg(long, default_value_t = FIRST_OFFSET)]
        from: Offset,
        #[arg(long)]
        to: Option<Offset>,
    },
    /// Replay a partition and print its recovered offsets and ID counters
    State {
        #[arg(long)]
        partition: PartitionId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = open_journal(&cli.root).await?;

    match cli.command {
        Command::Partitions => {
            for partition in storage.partitions()? {
                println!("{}", partition);
            }
            Ok(())
        }
        Command::Dump {
            partition,
            from,
            to,
        } => {
            storage
                .read_plog(partition, from, to, &mut print_event)
                .await
                .with_context(|| format!("Failed to read PLog of partition {}", partition))?;
            Ok(())
        }
        Command::Wlog {
            workspace,
            from,
            to,
        } => {
            storage
                .read_wlog(workspace, from, to, &mut print_event)
                .await
                .with_context(|| format!("Failed to read WLog of workspace {}", workspace))?;
            Ok(())
        }
        Command::State { partition } => {
            let state = replay_partition_state(&storage, partition)
                .await
                .with_context(|| format!("Failed to replay partition {}", partition))?;
            let json = serde_json::to_string_pretty(&state.snapshot())?;
            println!("{}", json);
            Ok(())
        }
    }
}

async fn open_journal(root: &Path) -> Result<JournalStorage> {
    if !root.is_dir() {
        bail!("Journal root '{}' is not a directory", root.display());
    }
    JournalStorage::open(root, JournalOptions::default())
        .await
        .with_context(|| format!("Failed to open journal at '{}'", root.display()))
}

fn print_event(event: CommittedEvent) -> partition_processor::Result<()> {
    let line = serde_json::to_string(&*event)
        .map_err(|err| ProcessorError::Internal(format!("event encoding: {}", err)))?;
    println!("{}", line);
    Ok(())
}
