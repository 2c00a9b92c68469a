use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mien", about = "mien face identification CLI")]
struct Cli {
    /// Daemon address
    #[arg(long, global = true, default_value = "http://127.0.0.1:8787")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a photo
    Enroll {
        /// Display name for this person
        #[arg(short, long)]
        name: String,
        /// Contact handle (e.g., an email address)
        #[arg(short, long)]
        contact: String,
        /// Path to a photo containing the person's face
        image: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity ID to remove
        id: i64,
    },
    /// Rebuild the search index from the catalogue
    Rebuild,
    /// Show daemon status
    Status,
}

#[derive(Deserialize)]
struct EnrollReply {
    identity_id: i64,
    name: String,
    contact: String,
}

#[derive(Deserialize)]
struct IdentityRow {
    id: i64,
    name: String,
    contact: String,
    created_at: String,
}

#[derive(Deserialize)]
struct RebuildReply {
    size: usize,
    loaded: usize,
    skipped: usize,
}

#[derive(Deserialize)]
struct StatusReply {
    version: String,
    embedding_dim: usize,
    index_size: usize,
    identities: i64,
    embeddings: i64,
    match_threshold: f32,
}

#[derive(Deserialize)]
struct ErrorReply {
    error: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let addr = cli.addr.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Enroll {
            name,
            contact,
            image,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let file_name = image
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "photo".to_string());
            let form = reqwest::multipart::Form::new()
                .text("name", name)
                .text("contact", contact)
                .part(
                    "file",
                    reqwest::multipart::Part::bytes(bytes).file_name(file_name),
                );

            let resp = client
                .post(format!("{addr}/enroll"))
                .multipart(form)
                .send()
                .await
                .context("sending enroll request")?;
            let reply: EnrollReply = read_reply(resp).await?;
            println!(
                "enrolled {} (id {}, contact {})",
                reply.name, reply.identity_id, reply.contact
            );
        }
        Commands::List => {
            let resp = client
                .get(format!("{addr}/identities"))
                .send()
                .await
                .context("listing identities")?;
            let rows: Vec<IdentityRow> = read_reply(resp).await?;
            if rows.is_empty() {
                println!("no identities enrolled");
            }
            for row in rows {
                println!(
                    "{:>6}  {}  <{}>  {}",
                    row.id, row.name, row.contact, row.created_at
                );
            }
        }
        Commands::Remove { id } => {
            let resp = client
                .delete(format!("{addr}/identities/{id}"))
                .send()
                .await
                .context("removing identity")?;
            check_status(resp).await?;
            println!("removed identity {id}; run `mien rebuild` to purge it from the index");
        }
        Commands::Rebuild => {
            let resp = client
                .post(format!("{addr}/index/rebuild"))
                .send()
                .await
                .context("requesting index rebuild")?;
            let reply: RebuildReply = read_reply(resp).await?;
            println!(
                "index rebuilt: {} vectors, {} loaded, {} skipped",
                reply.size, reply.loaded, reply.skipped
            );
        }
        Commands::Status => {
            let resp = client
                .get(format!("{addr}/status"))
                .send()
                .await
                .context("querying daemon status")?;
            let status: StatusReply = read_reply(resp).await?;
            println!("miend {}", status.version);
            println!("  embedding dim:   {}", status.embedding_dim);
            println!("  index size:      {}", status.index_size);
            println!("  identities:      {}", status.identities);
            println!("  embeddings:      {}", status.embeddings);
            println!("  match threshold: {}", status.match_threshold);
        }
    }

    Ok(())
}

/// Reject non-2xx replies with the daemon's error message when it sent one.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorReply>(&body)
        .map(|e| e.error)
        .unwrap_or(body);
    bail!("daemon returned {status}: {detail}")
}

async fn read_reply<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    check_status(resp)
        .await?
        .json()
        .await
        .context("decoding daemon reply")
}
