//! CLI for talking to a ringkv node

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::io::Write;

#[derive(Parser)]
#[command(name = "ringkv")]
#[command(about = "ringkv replicated key-value store CLI")]
#[command(version)]
struct Cli {
    /// Node URL (any node can coordinate)
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a value
    Get {
        key: String,

        /// Replication factor as ack/from (cluster majority if omitted)
        #[arg(long)]
        replicas: Option<String>,

        /// Write the value to a file instead of stdout
        #[arg(long)]
        output: Option<std::path::PathBuf>,
    },

    /// Write a value
    Put {
        key: String,

        /// Inline value
        #[arg(long, conflicts_with = "file")]
        value: Option<String>,

        /// Read the value from a file
        #[arg(long)]
        file: Option<std::path::PathBuf>,

        #[arg(long)]
        replicas: Option<String>,
    },

    /// Delete a key
    Delete {
        key: String,

        #[arg(long)]
        replicas: Option<String>,
    },

    /// List the node's local keys in [start, end)
    Range { start: String, end: Option<String> },

    /// Schedule a compaction on the node
    Compact,

    /// Show node status
    Status,
}

fn entity_query(key: String, replicas: Option<String>) -> Vec<(&'static str, String)> {
    let mut query = vec![("id", key)];
    if let Some(replicas) = replicas {
        query.push(("replicas", replicas));
    }
    query
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let http = reqwest::Client::new();
    let base = cli.node.trim_end_matches('/').to_string();
    let entity = format!("{}/v0/entity", base);

    match cli.command {
        Commands::Get {
            key,
            replicas,
            output,
        } => {
            let response = http
                .get(&entity)
                .query(&entity_query(key.clone(), replicas))
                .send()
                .await?;
            match response.status().as_u16() {
                200 => {
                    let body = response.bytes().await?;
                    match output {
                        Some(path) => {
                            std::fs::write(&path, &body)
                                .with_context(|| format!("writing {}", path.display()))?;
                            println!("✓ {} bytes written to {}", body.len(), path.display());
                        }
                        None => std::io::stdout().write_all(&body)?,
                    }
                }
                404 => bail!("{} not found", key),
                status => bail!("GET {} failed ({}): {}", key, status, response.text().await?),
            }
        }

        Commands::Put {
            key,
            value,
            file,
            replicas,
        } => {
            let body = match (value, file) {
                (Some(value), _) => value.into_bytes(),
                (None, Some(path)) => std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => bail!("either --value or --file is required"),
            };
            let size = body.len();
            let response = http
                .put(&entity)
                .query(&entity_query(key.clone(), replicas))
                .body(body)
                .send()
                .await?;
            if response.status().as_u16() != 201 {
                bail!(
                    "PUT {} failed ({}): {}",
                    key,
                    response.status(),
                    response.text().await?
                );
            }
            println!("✓ PUT {} ({} bytes)", key, size);
        }

        Commands::Delete { key, replicas } => {
            let response = http
                .delete(&entity)
                .query(&entity_query(key.clone(), replicas))
                .send()
                .await?;
            if response.status().as_u16() != 202 {
                bail!(
                    "DELETE {} failed ({}): {}",
                    key,
                    response.status(),
                    response.text().await?
                );
            }
            println!("✓ DELETE {}", key);
        }

        Commands::Range { start, end } => {
            let mut query = vec![("start", start)];
            if let Some(end) = end {
                query.push(("end", end));
            }
            let response = http
                .get(format!("{}/v0/entities", base))
                .query(&query)
                .send()
                .await?;
            if !response.status().is_success() {
                bail!("range failed ({}): {}", response.status(), response.text().await?);
            }
            std::io::stdout().write_all(&response.bytes().await?)?;
        }

        Commands::Compact => {
            let response = http.post(format!("{}/v0/compact", base)).send().await?;
            if !response.status().is_success() {
                bail!("compaction failed ({}): {}", response.status(), response.text().await?);
            }
            println!("✓ Compaction scheduled on {}", base);
        }

        Commands::Status => {
            let status: serde_json::Value = http
                .get(format!("{}/v0/status", base))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
