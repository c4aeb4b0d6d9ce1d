use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recall_bridge::{HelperManifest, ProcessGenerator, ScratchRoot};
use recall_core::{
    Comparator, DetailsPatch, Embedding, EuclideanComparator, Generated, ImageInput, Relation,
    Tolerance,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.recall.Recall1",
    default_service = "org.recall.Recall1",
    default_path = "/org/recall/Recall1"
)]
trait Recall {
    fn enroll(&self, account: &str, request: &str) -> zbus::Result<String>;
    fn identify(&self, account: &str, image: &str) -> zbus::Result<String>;
    fn list_members(&self, account: &str, filter: &str) -> zbus::Result<String>;
    fn search_members(&self, account: &str, query: &str) -> zbus::Result<String>;
    fn get_member(&self, account: &str, id: &str) -> zbus::Result<String>;
    fn update_member(&self, account: &str, id: &str, patch: &str) -> zbus::Result<String>;
    fn remove_member(&self, account: &str, id: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "recall", about = "Recall face enrollment and identification CLI")]
struct Cli {
    /// Owning account (default: $RECALL_ACCOUNT, then $USER)
    #[arg(short, long, global = true)]
    account: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a photo
    Enroll {
        /// Photo containing exactly the person's face
        image: PathBuf,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        relation: Relation,
        #[arg(short, long)]
        mobile: String,
        #[arg(long)]
        address: String,
        /// Mark the person as not a close contact
        #[arg(long)]
        not_close: bool,
        #[arg(long)]
        info: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Identify who is in a photo
    Identify { image: PathBuf },
    /// List enrolled people, alphabetically
    List {
        #[arg(short, long)]
        relation: Option<Relation>,
        /// Only close (true) or not-close (false) contacts
        #[arg(long)]
        close: Option<bool>,
    },
    /// Show one enrolled person
    Show { id: String },
    /// Search enrolled people by name
    Search { query: String },
    /// Change a person's details (empty --info/--notes clears them)
    Update {
        id: String,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        relation: Option<Relation>,
        #[arg(short, long)]
        mobile: Option<String>,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        close: Option<bool>,
        #[arg(long)]
        info: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Remove an enrolled person
    Remove { id: String },
    /// Show daemon status
    Status,
    /// Run the embedding helper directly on a photo (bypasses the daemon)
    Check {
        image: PathBuf,
        /// Second photo to compare against the first
        #[arg(long)]
        against: Option<PathBuf>,
        /// Helper manifest (default: $RECALL_HELPERS, then the built-in one)
        #[arg(long)]
        helpers: Option<PathBuf>,
        #[arg(long, default_value_t = 15)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check {
            image,
            against,
            helpers,
            timeout_secs,
        } => check(
            &image,
            against.as_deref(),
            helpers,
            Duration::from_secs(timeout_secs),
        ),
        command => {
            let reply = call_daemon(command, cli.account).await?;
            print_reply(&reply);
            Ok(())
        }
    }
}

async fn call_daemon(command: Commands, account: Option<String>) -> Result<String> {
    let account = resolve_account(account)?;
    let conn = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    let proxy = RecallProxy::new(&conn).await?;
    tracing::debug!(account = %account, "calling recalld");

    let reply = match command {
        Commands::Enroll {
            image,
            name,
            relation,
            mobile,
            address,
            not_close,
            info,
            notes,
        } => {
            let request = json!({
                "name": name,
                "image": image_arg(&image)?,
                "relation": relation,
                "mobile": mobile,
                "is_close": !not_close,
                "address": address,
                "additional_info": info,
                "important_notes": notes,
            });
            proxy.enroll(&account, &request.to_string()).await?
        }
        Commands::Identify { image } => proxy.identify(&account, &image_arg(&image)?).await?,
        Commands::List { relation, close } => {
            let filter = json!({ "relation": relation, "is_close": close });
            proxy.list_members(&account, &filter.to_string()).await?
        }
        Commands::Show { id } => proxy.get_member(&account, &id).await?,
        Commands::Search { query } => proxy.search_members(&account, &query).await?,
        Commands::Update {
            id,
            name,
            relation,
            mobile,
            address,
            close,
            info,
            notes,
        } => {
            let patch = DetailsPatch {
                name,
                relation,
                mobile,
                is_close: close,
                address,
                additional_info: info,
                important_notes: notes,
            };
            proxy
                .update_member(&account, &id, &serde_json::to_string(&patch)?)
                .await?
        }
        Commands::Remove { id } => proxy.remove_member(&account, &id).await?,
        Commands::Status => proxy.status().await?,
        Commands::Check { .. } => bail!("check runs locally, not through recalld"),
    };
    Ok(reply)
}

fn resolve_account(flag: Option<String>) -> Result<String> {
    let account = flag
        .or_else(|| std::env::var("RECALL_ACCOUNT").ok())
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_default();
    if account.trim().is_empty() {
        bail!("no account given; pass --account or set RECALL_ACCOUNT");
    }
    Ok(account)
}

/// The daemon may run with another working directory, so send an absolute path.
fn image_arg(path: &Path) -> Result<String> {
    let abs = std::fs::canonicalize(path)
        .with_context(|| format!("cannot read image {}", path.display()))?;
    Ok(abs.display().to_string())
}

fn print_reply(reply: &str) {
    match serde_json::from_str::<Value>(reply).and_then(|v| serde_json::to_string_pretty(&v)) {
        Ok(pretty) => println!("{pretty}"),
        Err(_) => println!("{reply}"),
    }
}

fn check(
    image: &Path,
    against: Option<&Path>,
    helpers: Option<PathBuf>,
    timeout: Duration,
) -> Result<()> {
    let helpers = helpers.or_else(|| std::env::var("RECALL_HELPERS").ok().map(PathBuf::from));
    let manifest = HelperManifest::resolve(helpers.as_deref())?;
    let scratch = ScratchRoot::new(std::env::temp_dir().join("recall-check"))?;
    let generator = ProcessGenerator::new(manifest.generator.clone(), scratch, timeout);

    println!("generator: {} {}", manifest.generator.program, manifest.generator.args.join(" "));
    let Some(first) = embed(&generator, image)? else {
        return Ok(());
    };
    let Some(other) = against else {
        return Ok(());
    };
    let Some(second) = embed(&generator, other)? else {
        return Ok(());
    };

    let tolerance = Tolerance::default();
    let c = EuclideanComparator.compare(&first, &second, tolerance)?;
    println!(
        "distance {:.4}, similarity {:.4}, match at tolerance {}: {}",
        c.distance,
        c.similarity,
        tolerance.value(),
        c.matched
    );
    Ok(())
}

fn embed(generator: &ProcessGenerator, image: &Path) -> Result<Option<Embedding>> {
    match generator.try_generate(&ImageInput::Path(image.to_path_buf()))? {
        Generated::Face(embedding) => {
            let values = embedding.values();
            println!("{}: {}-dim embedding, starts {:?}", image.display(), values.len(), &values[..4]);
            Ok(Some(embedding))
        }
        Generated::NoFace => {
            println!("{}: no face detected", image.display());
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enroll() {
        let cli = Cli::try_parse_from([
            "recall", "--account", "carer1", "enroll", "photo.jpg", "--name", "Rose",
            "--relation", "sister", "--mobile", "5551234", "--address", "7 Pine Court",
            "--not-close",
        ])
        .unwrap();
        assert_eq!(cli.account.as_deref(), Some("carer1"));
        match cli.command {
            Commands::Enroll {
                relation,
                not_close,
                info,
                ..
            } => {
                assert_eq!(relation, Relation::Sister);
                assert!(not_close);
                assert!(info.is_none());
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_unknown_relation_rejected() {
        let parsed = Cli::try_parse_from([
            "recall", "list", "--relation", "neighbour",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_resolve_account_prefers_flag() {
        assert_eq!(resolve_account(Some("carer1".into())).unwrap(), "carer1");
    }
}
