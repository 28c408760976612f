// src/main.rs

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use awtfdb::db::models::{
    FileCreateOpts, FileEntry, ImplicationEdge, LibraryConfig, Pool, TagName, TagSourceRef,
    TAG_NAME_REGEX_KEY,
};
use awtfdb::db::{self, Store};
use awtfdb::janitor::{self, JanitorOptions};
use awtfdb::query;
use awtfdb::tagtree;

#[derive(Parser)]
#[command(name = "awtfdb")]
#[command(author, version, about = "Content-addressed, tag-based file index", long_about = None)]
struct Cli {
    /// Store path (default: ${HOME}/awtf.db)
    #[arg(short, long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or open and migrate) the store.
    Init,
    /// Hash and index a file at an absolute path.
    Add {
        path: PathBuf,
        /// Encode the file's mtime into its hash's id.
        #[arg(long)]
        use_mtime: bool,
    },
    /// Attach a tag to an already-indexed file.
    Tag {
        path: PathBuf,
        tag: String,
        #[arg(long, default_value = "en")]
        language: String,
    },
    /// Remove a tag from a file without removing the tag itself.
    Untag { path: PathBuf, tag: String },
    /// Run a tag query and print matching paths.
    Find { query: String },
    /// Materialise parent-tag implications onto every file.
    Tree,
    /// Declare a parent-tag implication edge.
    Imply { child: String, parent: String },
    /// Run the consistency checker.
    Janitor {
        #[arg(long)]
        full: bool,
        #[arg(long)]
        repair: bool,
        #[arg(long)]
        only: Vec<String>,
        /// e.g. `512`, `10K`, `5M`, `2G`.
        #[arg(long)]
        hash_files_smaller_than: Option<String>,
    },
    /// Set a library configuration value (e.g. `tag_name_regex`).
    Config { key: String, value: String },
    /// Pool operations: create, add-file, list.
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
}

#[derive(Subcommand)]
enum PoolAction {
    Create { title: String },
    AddFile { pool_hash: String, path: PathBuf },
    List { pool_hash: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = match cli.db_path {
        Some(path) => path,
        None => db::default_path()?
            .to_str()
            .ok_or_else(|| anyhow!("store path is not valid UTF-8"))?
            .to_string(),
    };

    match cli.command {
        Commands::Init => {
            let store = Store::create(&db_path)?;
            store.shutdown_pragmas()?;
            println!("store ready at {db_path}");
        }
        Commands::Add { path, use_mtime } => {
            let store = Store::create(&db_path)?;
            let abs_path = path.canonicalize().context("resolving path")?;
            let file = FileEntry::create_from_path(
                store.connection(),
                &abs_path,
                FileCreateOpts {
                    use_file_mtime: use_mtime,
                },
            )?;
            println!("{} {}", file.file_hash, file.local_path);
        }
        Commands::Tag {
            path,
            tag,
            language,
        } => {
            let store = Store::create(&db_path)?;
            let conn = store.connection();
            let config = LibraryConfig::new();
            let abs_path = path.canonicalize().context("resolving path")?;
            let path_str = abs_path.to_string_lossy().to_string();
            let file = FileEntry::fetch_by_path(conn, &path_str)?
                .ok_or_else(|| anyhow!("file not indexed yet, run `add` first: {path_str}"))?;
            let resolved = match TagName::fetch_named_tag(conn, &tag, &language)? {
                Some(resolved) => resolved,
                None => {
                    let name = TagName::create_named_tag(conn, &config, &tag, &language, None)?;
                    TagName::fetch_named_tag(conn, &name.tag_text, &name.tag_language)?
                        .expect("just-created tag must resolve")
                }
            };
            FileEntry::add_tag(
                conn,
                &file.file_hash,
                &resolved.core.core_hash,
                TagSourceRef::manual(),
            )?;
            println!("tagged {path_str} with {tag}");
        }
        Commands::Untag { path, tag } => {
            let store = Store::create(&db_path)?;
            let conn = store.connection();
            let abs_path = path.canonicalize().context("resolving path")?;
            let path_str = abs_path.to_string_lossy().to_string();
            let file = FileEntry::fetch_by_path(conn, &path_str)?
                .ok_or_else(|| anyhow!("file not indexed: {path_str}"))?;
            let resolved = TagName::fetch_named_tag(conn, &tag, "en")?
                .ok_or_else(|| anyhow!("unknown tag: {tag}"))?;
            FileEntry::remove_tag(conn, &file.file_hash, &resolved.core.core_hash)?;
            println!("untagged {path_str}");
        }
        Commands::Find { query: query_text } => {
            let store = Store::create(&db_path)?;
            let files = query::resolve_and_execute_files(store.connection(), &query_text)?;
            for file in files {
                println!("{}", file.local_path);
            }
        }
        Commands::Tree => {
            let store = Store::create(&db_path)?;
            tagtree::process_tag_tree(store.connection())?;
            println!("tag tree propagation complete");
        }
        Commands::Imply { child, parent } => {
            let store = Store::create(&db_path)?;
            let conn = store.connection();
            let child_tag = TagName::fetch_named_tag(conn, &child, "en")?
                .ok_or_else(|| anyhow!("unknown tag: {child}"))?;
            let parent_tag = TagName::fetch_named_tag(conn, &parent, "en")?
                .ok_or_else(|| anyhow!("unknown tag: {parent}"))?;
            let edge = ImplicationEdge::create(conn, &child_tag.core.core_hash, &parent_tag.core.core_hash)?;
            println!("{child} implies {parent} (edge {})", edge.row_id);
        }
        Commands::Janitor {
            full,
            repair,
            only,
            hash_files_smaller_than,
        } => {
            let mut store = Store::create(&db_path)?;
            let config = LibraryConfig::new();
            let hash_files_smaller_than = hash_files_smaller_than
                .map(|text| janitor::parse_byte_amount(&text))
                .transpose()?;
            let options = JanitorOptions {
                full,
                only,
                hash_files_smaller_than,
                repair,
                skip_db: false,
                skip_tag_cores: false,
            };
            let report = janitor::run(store.connection_mut(), &config, &options, None)?;
            info!("janitor found {} problem(s)", report.problem_count());
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.problem_count() > 0 && !repair {
                std::process::exit(2);
            }
        }
        Commands::Config { key, value } => {
            let store = Store::create(&db_path)?;
            let config = LibraryConfig::new();
            config.set(store.connection(), &key, &value)?;
            if key == TAG_NAME_REGEX_KEY {
                info!("tag_name_regex updated");
            }
            println!("set {key} = {value}");
        }
        Commands::Pool { action } => match action {
            PoolAction::Create { title } => {
                let store = Store::create(&db_path)?;
                let pool = Pool::create(store.connection(), &title)?;
                println!("{} {}", pool.pool_hash, pool.title);
            }
            PoolAction::AddFile { pool_hash, path } => {
                let store = Store::create(&db_path)?;
                let abs_path = path.canonicalize().context("resolving path")?;
                let path_str = abs_path.to_string_lossy().to_string();
                let file = FileEntry::fetch_by_path(store.connection(), &path_str)?
                    .ok_or_else(|| anyhow!("file not indexed: {path_str}"))?;
                Pool::add_file(store.connection(), &pool_hash, &file.file_hash)?;
                println!("added {path_str} to pool {pool_hash}");
            }
            PoolAction::List { pool_hash } => {
                let store = Store::create(&db_path)?;
                for file_hash in Pool::fetch_files(store.connection(), &pool_hash)? {
                    println!("{file_hash}");
                }
            }
        },
    }

    Ok(())
}
