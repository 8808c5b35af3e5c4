//! # kvas
//!
//! Command-line client for the kvas launcher.
//!
//! ## Commands
//!
//! - `launch`: Start a load-test task
//! - `status`: Show a task
//! - `wait`: Poll a task until it finishes
//! - `cancel`: Stop a task and release its machines
//! - `logs`: List a task's archived logs
//!
//! ## Example
//!
//! ```bash
//! kvas launch --image ghcr.io/kvas/kvnode:51bee04 --nodes 3 --topology replication --wait
//! kvas logs 6f1c3a52-0c4e-4f55-9a3c-2f1d8c1f0a11
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kvas_types::{TaskId, TaskSnapshot, TaskState, Topology};
use std::time::Duration;

mod client;

use client::LauncherClient;

/// Command-line client for the kvas launcher.
#[derive(Parser, Debug)]
#[command(name = "kvas")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Launcher base URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Print raw JSON instead of a summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a load-test task
    Launch {
        /// Container image of the key-value node
        #[arg(long)]
        image: String,

        /// Number of node machines
        #[arg(long, short, default_value = "3")]
        nodes: u32,

        /// Cluster topology (replication, sharding)
        #[arg(long, short, default_value = "replication")]
        topology: Topology,

        /// Poll until the task finishes
        #[arg(long)]
        wait: bool,
    },

    /// Show a task
    Status {
        /// Task id
        id: TaskId,
    },

    /// Poll a task until it finishes
    Wait {
        /// Task id
        id: TaskId,

        /// Seconds between polls
        #[arg(long, default_value = "5")]
        interval: u64,
    },

    /// Stop a task and release its machines
    Cancel {
        /// Task id
        id: TaskId,
    },

    /// List a task's archived logs
    Logs {
        /// Task id
        id: TaskId,
    },
}

const POLL_INTERVAL: Duration = Duration::from_secs(5);

fn print_task(task: &TaskSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(task)?);
        return Ok(());
    }
    println!("task    {}", task.id);
    println!("state   {}", task.state);
    if let Some(client) = &task.client {
        println!("client  {} ({})", client.instance, client.address);
    }
    for node in &task.nodes {
        let marker = if task.leader.as_deref() == Some(node.instance.as_str()) {
            " leader"
        } else {
            ""
        };
        println!("node    {} ({}){}", node.instance, node.address, marker);
    }
    Ok(())
}

/// Exit non-zero for tasks that ended in FAILURE.
fn finish(task: &TaskSnapshot) -> Result<()> {
    if task.state == TaskState::Failure {
        anyhow::bail!("task {} failed", task.id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = LauncherClient::new(&cli.server);

    match cli.command {
        Commands::Launch {
            image,
            nodes,
            topology,
            wait,
        } => {
            let task = client
                .launch(&image, nodes, topology.as_str())
                .await
                .context("launch failed")?;
            if wait {
                let task = client.wait(&task.id, POLL_INTERVAL).await?;
                print_task(&task, cli.json)?;
                finish(&task)?;
            } else {
                print_task(&task, cli.json)?;
            }
        }
        Commands::Status { id } => {
            print_task(&client.task(&id).await?, cli.json)?;
        }
        Commands::Wait { id, interval } => {
            let task = client.wait(&id, Duration::from_secs(interval.max(1))).await?;
            print_task(&task, cli.json)?;
            finish(&task)?;
        }
        Commands::Cancel { id } => {
            if client.cancel(&id).await? {
                println!("cancelling {}", id);
            } else {
                println!("{} already ended", id);
            }
        }
        Commands::Logs { id } => {
            let logs = client.logs(&id).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&logs)?);
            } else if logs.is_empty() {
                println!("no logs archived for {}", id);
            } else {
                for log in logs {
                    println!("{}", log.url);
                }
            }
        }
    }

    Ok(())
}
