//! list_anomalies - print every stored anomaly of one post as JSON lines

use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::time::Duration;

use anomaly_sentinel::api::{ClientSettings, ResilientHttpClient, MAX_PAGE_SIZE};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// API base URL.
    #[arg(long, env = "SENTINEL_API_URL")]
    api_url: String,
    #[arg(long, env = "SENTINEL_API_LOGIN")]
    login: String,
    #[arg(long, env = "SENTINEL_API_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long, env = "SENTINEL_API_CLIENT")]
    client_id: String,
    /// Post (camera) id.
    #[arg(long)]
    post_id: i64,
    /// Folder filter.
    #[arg(long, default_value = "")]
    folder: String,
    /// Items per page (capped at 500).
    #[arg(long, default_value_t = MAX_PAGE_SIZE)]
    page_size: usize,
    /// Request timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let client = ResilientHttpClient::new(ClientSettings {
        base_url: args.api_url,
        login: args.login,
        password: args.password,
        client_id: args.client_id,
        timeout: Duration::from_secs(args.timeout_secs),
    })?;
    client.authenticate()?;

    let items = client.list_anomalies(args.post_id, &args.folder, args.page_size)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for item in &items {
        serde_json::to_writer(&mut out, item)?;
        writeln!(out)?;
    }
    log::info!("[PO {}] {} anomalies listed", args.post_id, items.len());
    Ok(())
}
