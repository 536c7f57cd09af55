use std::io::{self, IsTerminal};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use gopher_core::{render_text, GopherClient, Item, ItemType, Retriever};

/// Determine whether output should be JSON.
/// JSON is used when: --json flag is set, OR stdout is not a terminal (piped).
pub fn use_json(flag: bool) -> bool {
    flag || !io::stdout().is_terminal()
}

/// Parse a one-character type tag as given on the command line.
pub fn parse_type(tag: &str) -> Result<ItemType> {
    let mut chars = tag.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(ItemType::from(c)),
        _ => bail!("item type must be a single character, got {:?}", tag),
    }
}

fn print_items(items: &[Item], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
    } else {
        print!("{}", render_text(items));
    }
    Ok(())
}

/// Print a structured error and exit with code 1.
pub fn handle_error(err: anyhow::Error, json: bool) -> ! {
    if json {
        let msg = format!("{:#}", err);
        eprintln!("{}", json!({ "error": msg }));
    } else {
        eprintln!("error: {:#}", err);
    }
    std::process::exit(1);
}

pub async fn browse(client: &GopherClient, host: &str, selector: &str, json: bool) -> Result<()> {
    let items = client
        .fetch_listing(host, selector)
        .await
        .with_context(|| format!("Failed to fetch menu {}{}", host, selector))?;
    print_items(&items, json)
}

pub async fn search(client: &GopherClient, host: &str, selector: &str, query: &str, json: bool) -> Result<()> {
    let items = client
        .search(host, selector, query)
        .await
        .with_context(|| format!("Search on {}{} failed", host, selector))?;
    print_items(&items, json)
}

/// Stream a document to stdout, or to `output` when given. A file left
/// half-written by a failed transfer is removed.
pub async fn download(client: &GopherClient, host: &str, selector: &str, output: Option<&Path>) -> Result<()> {
    match output {
        None => {
            let mut stdout = tokio::io::stdout();
            client
                .fetch_stream(host, selector, &mut stdout)
                .await
                .with_context(|| format!("Failed to fetch {}{}", host, selector))?;
            stdout.flush().await?;
            Ok(())
        }
        Some(path) => {
            let mut file = File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            match client.fetch_stream(host, selector, &mut file).await {
                Ok(n) => {
                    file.sync_all().await?;
                    info!(bytes = n, path = %path.display(), "Saved document");
                    Ok(())
                }
                Err(e) => {
                    drop(file);
                    if let Err(rm) = fs::remove_file(path).await {
                        warn!(path = %path.display(), error = %rm, "Failed to remove partial download");
                    }
                    Err(e).with_context(|| format!("Failed to fetch {}{}", host, selector))
                }
            }
        }
    }
}

/// Pick listing or stream mode from the type the user asked for.
pub async fn fetch(
    client: &GopherClient,
    host: &str,
    selector: &str,
    itype: ItemType,
    query: Option<&str>,
    output: Option<&Path>,
    json: bool,
) -> Result<()> {
    match itype {
        ItemType::Search => {
            let query = query.context("Search items (type 7) need --query")?;
            search(client, host, selector, query, json).await
        }
        ItemType::Directory => browse(client, host, selector, json).await,
        ItemType::Info | ItemType::Error => {
            bail!("{} items carry no content to fetch", itype.name())
        }
        _ => download(client, host, selector, output).await,
    }
}
