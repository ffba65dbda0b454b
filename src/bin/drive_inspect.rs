use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use auction_sync::config;
use auction_sync::drive::{DriveClient, RemoteStore, TokenProvider};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Print the mirrored layout in the remote store")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

async fn print_container(store: &dyn RemoteStore, label: &str, id: &str) -> Result<()> {
    let children = store.list_children(id).await?;
    println!("{} ({}): {} entries", label, id, children.len());
    for child in children {
        if child.is_folder() {
            let items = store.list_children(&child.id).await?.len();
            println!("  {:>4}  {} items  {}", child.name, items, child.public_link());
        } else {
            println!("  {}  {}", child.name, child.mime_type);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(args.config.as_path()))?;
    let names = cfg.layout_names();

    let tokens = Arc::new(TokenProvider::new(cfg.token_path(), cfg.drive_timeout()));
    let store = DriveClient::new(tokens, cfg.drive_timeout());

    let root = store
        .find_folder(None, &names.root)
        .await?
        .with_context(|| format!("root container {:?} not found", names.root))?;
    println!("Root: {} ({})", root.name, root.id);

    for csv in [&names.staged_csv, &names.baseline_csv, &names.published_csv] {
        match store.find_file(&root.id, csv).await? {
            Some(file) => {
                let size = store.read_file(&file.id).await?.len();
                println!("{}: {} bytes  {}", csv, size, file.public_link());
            }
            None => println!("{}: missing", csv),
        }
    }

    for name in [&names.scratch, &names.published] {
        match store.find_folder(Some(root.id.as_str()), name).await? {
            Some(folder) => print_container(&store, name, &folder.id).await?,
            None => println!("{}: missing", name),
        }
    }
    Ok(())
}
