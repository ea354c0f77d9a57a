use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

use qless::config::ConnectConfig;
use qless::job::{JobData, JobLookup};
use qless::queue::{PutOptions, RecurOptions};
use qless::Client;

#[derive(Parser, Debug)]
#[command(name = "qless")]
#[command(version)]
#[command(about = "A job-queue client for qless-compatible stores")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Queue management commands
    Queue {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Resource limiter commands
    Resource {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ResourceCommands,
    },
}

// =============================================================================
// Client Arguments (shared by all command groups)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Store host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Store port
    #[arg(long, default_value = "6379")]
    port: u16,

    /// Store database index
    #[arg(long, default_value = "0")]
    db: i64,

    /// Path to the store's atomic script
    #[arg(long, default_value = "qless.lua")]
    script: PathBuf,

    /// Worker name for commands that act on a lock (defaults to host-pid)
    #[arg(long, short = 'w')]
    worker: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Cancel a job or a recurring template
    Cancel {
        /// The job ID
        jid: String,
    },
    /// Complete a running job
    Complete {
        /// The job ID
        jid: String,
    },
    /// Fail a running job
    Fail {
        /// The job ID
        jid: String,
        /// Failure group the job is filed under
        group: String,
        /// Human-readable failure message
        message: String,
    },
    /// Renew the lock on a running job
    Heartbeat {
        /// The job ID
        jid: String,
    },
}

// =============================================================================
// Queue Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum QueueCommands {
    /// Put a job on a queue
    Put {
        /// Queue name
        queue: String,
        /// Handler class name
        klass: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,
        /// Explicit job ID (generated when absent)
        #[arg(long)]
        jid: Option<String>,
        /// Seconds before the job becomes available
        #[arg(long, default_value = "0")]
        delay: u64,
        #[arg(long)]
        priority: Option<i64>,
        /// Tags (comma-separated)
        #[arg(long, default_value = "")]
        tags: String,
        #[arg(long)]
        retries: Option<i64>,
        /// Job IDs this job must wait on (comma-separated)
        #[arg(long, default_value = "")]
        depends: String,
        /// Resource IDs the job must hold while running (comma-separated)
        #[arg(long, default_value = "")]
        resources: String,
    },
    /// Register a recurring job on a queue
    Recur {
        /// Queue name
        queue: String,
        /// Handler class name
        klass: String,
        /// Seconds between spawns
        #[arg(long)]
        interval: u64,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,
        /// Explicit template ID (generated when absent)
        #[arg(long)]
        jid: Option<String>,
        /// Seconds before the first spawn
        #[arg(long, default_value = "0")]
        offset: u64,
        #[arg(long)]
        priority: Option<i64>,
        /// Tags (comma-separated)
        #[arg(long, default_value = "")]
        tags: String,
        #[arg(long)]
        retries: Option<i64>,
        /// Cap on unworked spawned jobs
        #[arg(long)]
        backlog: Option<i64>,
    },
    /// Reserve jobs from a queue
    Pop {
        /// Queue name
        queue: String,
        /// How many jobs to reserve
        #[arg(long, default_value = "1")]
        count: usize,
    },
    /// Stop handing out jobs from a queue
    Pause {
        /// Queue name
        queue: String,
    },
    /// Resume a paused queue
    Unpause {
        /// Queue name
        queue: String,
    },
}

// =============================================================================
// Resource Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ResourceCommands {
    /// Create or resize a resource
    Set {
        /// Resource ID
        id: String,
        /// Maximum concurrent holders
        max: i64,
    },
    /// Show a resource
    Get {
        /// Resource ID
        id: String,
    },
    /// Delete a resource
    Unset {
        /// Resource ID
        id: String,
    },
    /// List job IDs holding locks on a resource
    Locks {
        /// Resource ID
        id: String,
    },
    /// Show usage counts across all resources
    Counts,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobActionOutput {
    jid: String,
    action: String,
}

#[derive(Serialize)]
struct CompleteOutput {
    jid: String,
    state: String,
}

#[derive(Serialize)]
struct HeartbeatOutput {
    jid: String,
    expires: f64,
}

#[derive(Serialize)]
struct PutOutput {
    jid: String,
    queue: String,
}

#[derive(Serialize)]
struct PopOutput {
    jobs: Vec<JobData>,
}

#[derive(Serialize)]
struct LocksOutput {
    id: String,
    locks: Vec<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_list(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_payload(raw: &str) -> Value {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Error: --data is not valid JSON: {}", err);
            std::process::exit(1);
        }
    }
}

async fn create_client(args: &ClientArgs) -> Result<Client, Box<dyn std::error::Error>> {
    let mut config = ConnectConfig::new(args.host.clone(), args.port);
    config.db = args.db;
    config.script_path = args.script.clone();

    let mut client = Client::connect(&config).await?;
    if let Some(worker) = &args.worker {
        client.set_worker_name(worker.clone());
    }
    Ok(client)
}

/// Look up a job that must be a concrete one. Exits on a recurring
/// template; prints the miss and returns None so the caller exits zero.
async fn require_concrete_job(
    client: &Client,
    jid: &str,
) -> Result<Option<qless::Job>, Box<dyn std::error::Error>> {
    match client.job(jid).await? {
        Some(JobLookup::Job(job)) => Ok(Some(job)),
        Some(JobLookup::Recurring(_)) => {
            eprintln!("Error: {} is a recurring template, not a runnable job", jid);
            std::process::exit(1);
        }
        None => {
            println!("Job {} not found", jid);
            Ok(None)
        }
    }
}

// =============================================================================
// Job Command Handlers
// =============================================================================

async fn handle_job(
    client: &Client,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Cancel { jid } => {
            match client.job(&jid).await? {
                Some(JobLookup::Job(mut job)) => job.cancel().await?,
                Some(JobLookup::Recurring(recurring)) => recurring.cancel().await?,
                None => {
                    println!("Job {} not found", jid);
                    return Ok(());
                }
            }
            match output_format {
                OutputFormat::Json => {
                    let output = JobActionOutput {
                        jid,
                        action: "canceled".to_string(),
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => println!("Job {} canceled", jid),
            }
        }
        JobCommands::Complete { jid } => {
            let mut job = match require_concrete_job(client, &jid).await? {
                Some(job) => job,
                None => return Ok(()),
            };
            let state = job.complete().await?;
            match output_format {
                OutputFormat::Json => {
                    let output = CompleteOutput { jid, state };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => println!("Job {} completed ({})", jid, state),
            }
        }
        JobCommands::Fail {
            jid,
            group,
            message,
        } => {
            let mut job = match require_concrete_job(client, &jid).await? {
                Some(job) => job,
                None => return Ok(()),
            };
            job.fail(&group, &message).await?;
            match output_format {
                OutputFormat::Json => {
                    let output = JobActionOutput {
                        jid,
                        action: "failed".to_string(),
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => println!("Job {} failed under group {}", jid, group),
            }
        }
        JobCommands::Heartbeat { jid } => {
            let mut job = match require_concrete_job(client, &jid).await? {
                Some(job) => job,
                None => return Ok(()),
            };
            let expires = job.heartbeat().await?;
            match output_format {
                OutputFormat::Json => {
                    let output = HeartbeatOutput { jid, expires };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    println!("Job {} lock renewed until {}", jid, expires)
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Queue Command Handlers
// =============================================================================

async fn handle_queue_put(
    client: &Client,
    queue: String,
    klass: String,
    data: String,
    options: PutOptions,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload = parse_payload(&data);
    let jid = client.queue(&queue).put(&klass, &payload, options).await?;

    match output_format {
        OutputFormat::Json => {
            let output = PutOutput { jid, queue };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job put on queue {}", queue);
            println!("Job ID: {}", jid);
        }
    }
    Ok(())
}

async fn handle_queue_recur(
    client: &Client,
    queue: String,
    klass: String,
    data: String,
    interval: u64,
    options: RecurOptions,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload = parse_payload(&data);
    let jid = client
        .queue(&queue)
        .recur(&klass, &payload, interval, options)
        .await?;

    match output_format {
        OutputFormat::Json => {
            let output = PutOutput { jid, queue };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Recurring job registered on queue {}", queue);
            println!("Job ID: {}", jid);
        }
    }
    Ok(())
}

async fn handle_queue_pop(
    client: &Client,
    queue: String,
    count: usize,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = client.queue(&queue).multipop(count).await?;

    match output_format {
        OutputFormat::Json => {
            let output = PopOutput {
                jobs: jobs.iter().map(|job| job.data().clone()).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs available.");
            } else {
                println!("{:<34} {:<24} {:<10} QUEUE", "JOB ID", "KLASS", "STATE");
                println!("{}", "-".repeat(80));
                for job in &jobs {
                    println!(
                        "{:<34} {:<24} {:<10} {}",
                        job.jid(),
                        job.klass(),
                        job.data().state,
                        job.queue()
                    );
                }
                println!();
                println!("Reserved {} job(s)", jobs.len());
            }
        }
    }
    Ok(())
}

// =============================================================================
// Resource Command Handlers
// =============================================================================

async fn handle_resource(
    client: &Client,
    command: ResourceCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resources = client.resources();
    match command {
        ResourceCommands::Set { id, max } => {
            resources.set(&id, max).await?;
            println!("OK");
        }
        ResourceCommands::Get { id } => match resources.get(&id).await? {
            Some(description) => match output_format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&description)?)
                }
                OutputFormat::Table => print_value_table(&description),
            },
            None => println!("Resource {} not found", id),
        },
        ResourceCommands::Unset { id } => {
            resources.unset(&id).await?;
            println!("OK");
        }
        ResourceCommands::Locks { id } => {
            let locks = resources.locks(&id).await?;
            match output_format {
                OutputFormat::Json => {
                    let output = LocksOutput { id, locks };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    if locks.is_empty() {
                        println!("No locks held on {}", id);
                    } else {
                        for jid in locks {
                            println!("{}", jid);
                        }
                    }
                }
            }
        }
        ResourceCommands::Counts => {
            let counts = resources.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }
    Ok(())
}

fn print_value_table(value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                println!("{:<12} {}", key, value);
            }
        }
        other => println!("{}", other),
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Job { client, command } => {
            let qless = create_client(&client).await?;
            handle_job(&qless, command, &client.output).await?;
        }
        Commands::Queue { client, command } => {
            let qless = create_client(&client).await?;
            match command {
                QueueCommands::Put {
                    queue,
                    klass,
                    data,
                    jid,
                    delay,
                    priority,
                    tags,
                    retries,
                    depends,
                    resources,
                } => {
                    let options = PutOptions {
                        jid,
                        delay,
                        priority,
                        tags: parse_list(&tags),
                        retries,
                        depends: parse_list(&depends),
                        resources: parse_list(&resources),
                    };
                    handle_queue_put(&qless, queue, klass, data, options, &client.output).await?;
                }
                QueueCommands::Recur {
                    queue,
                    klass,
                    interval,
                    data,
                    jid,
                    offset,
                    priority,
                    tags,
                    retries,
                    backlog,
                } => {
                    let options = RecurOptions {
                        jid,
                        offset,
                        priority,
                        tags: parse_list(&tags),
                        retries,
                        backlog,
                    };
                    handle_queue_recur(&qless, queue, klass, data, interval, options, &client.output)
                        .await?;
                }
                QueueCommands::Pop { queue, count } => {
                    handle_queue_pop(&qless, queue, count, &client.output).await?;
                }
                QueueCommands::Pause { queue } => {
                    qless.queue(&queue).pause().await?;
                    println!("OK");
                }
                QueueCommands::Unpause { queue } => {
                    qless.queue(&queue).unpause().await?;
                    println!("OK");
                }
            }
        }
        Commands::Resource { client, command } => {
            let qless = create_client(&client).await?;
            handle_resource(&qless, command, &client.output).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_splits_and_trims() {
        assert_eq!(parse_list("a, b ,c"), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
        assert!(parse_list(" , ").is_empty());
    }

    #[test]
    fn output_structs_serialize_flat() {
        let out = HeartbeatOutput {
            jid: "j1".to_string(),
            expires: 1700000060.5,
        };
        assert_eq!(
            serde_json::to_string(&out).unwrap(),
            r#"{"jid":"j1","expires":1700000060.5}"#
        );

        let out = PutOutput {
            jid: "j1".to_string(),
            queue: "billing".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&out).unwrap(),
            r#"{"jid":"j1","queue":"billing"}"#
        );
    }

    #[test]
    fn cli_parses_the_command_tree() {
        Args::try_parse_from(["qless", "job", "fail", "j1", "Timeout", "gave up"]).unwrap();
        Args::try_parse_from([
            "qless", "queue", "put", "billing", "ChargeJob", "--data", "{}", "--tags", "a,b",
        ])
        .unwrap();
        Args::try_parse_from(["qless", "queue", "recur", "maint", "SweepJob", "--interval", "60"])
            .unwrap();
        Args::try_parse_from(["qless", "resource", "set", "db", "5"]).unwrap();
        Args::try_parse_from(["qless", "queue", "pop", "billing", "--count", "5", "-o", "json"])
            .unwrap();
    }
}
