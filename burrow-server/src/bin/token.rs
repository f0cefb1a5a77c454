//! Token minting utility.
//!
//! Generates tunnel tokens and, optionally, registers them in a tunnels file
//! served by `burrowd --tunnels-file`.

use anyhow::{bail, Context, Result};
use burrow_core::protocol::{is_valid_subdomain, normalize_identifier};
use burrow_core::Token;
use clap::Parser;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Generate tokens for tunnel clients.
#[derive(Parser, Debug)]
#[command(name = "burrow-token")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tunnels file to append the new tunnel to
    #[arg(short, long, env = "BURROW_TUNNELS_FILE")]
    tunnels_file: Option<PathBuf>,

    /// Owner identifier (user name or e-mail); the default subdomain is
    /// derived from it
    #[arg(short, long)]
    owner: Option<String>,

    /// Subdomain for the tunnel
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Display name of the tunnel
    #[arg(short, long, default_value = "Default")]
    name: String,

    /// Number of tokens to generate (without a tunnels file)
    #[arg(short, long, default_value = "1")]
    count: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let Some(path) = &args.tunnels_file else {
        println!("Generated token(s):");
        for i in 0..args.count {
            let token = Token::generate();
            if args.count > 1 {
                println!("  {}: {}", i + 1, token.expose());
            } else {
                println!("  {}", token.expose());
            }
        }
        return Ok(());
    };

    let subdomain = match (&args.subdomain, &args.owner) {
        (Some(subdomain), _) => subdomain.to_ascii_lowercase(),
        (None, Some(owner)) => normalize_identifier(owner)
            .with_context(|| format!("cannot derive a subdomain from {:?}", owner))?,
        (None, None) => bail!("--subdomain or --owner is required with --tunnels-file"),
    };
    if !is_valid_subdomain(&subdomain) {
        bail!("{:?} is not a valid subdomain", subdomain);
    }

    let mut entries = read_entries(path)?;
    if entries
        .iter()
        .any(|e| e.get("subdomain").and_then(Value::as_str) == Some(subdomain.as_str()))
    {
        bail!("subdomain {} is already taken", subdomain);
    }

    let id = entries
        .iter()
        .filter_map(|e| e.get("id").and_then(Value::as_i64))
        .max()
        .unwrap_or(0)
        + 1;
    let token = Token::generate();
    entries.push(json!({
        "token": token.expose(),
        "id": id,
        "owner_id": id,
        "name": args.name,
        "subdomain": subdomain,
    }));

    let data = serde_json::to_vec_pretty(&entries)?;
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;

    println!("Tunnel {} registered in {}", id, path.display());
    println!("  subdomain: {}", subdomain);
    println!("  token:     {}", token.expose());
    println!();
    println!("Use this token with burrow --token <TOKEN>");
    Ok(())
}

fn read_entries(path: &Path) -> Result<Vec<Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
}
