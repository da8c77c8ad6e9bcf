use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gate-cli")]
#[command(about = "Management CLI for ows-gate", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081", env = "OWS_GATE_ADMIN_URL")]
    url: String,

    #[arg(short, long, env = "OWS_GATE_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check gateway status
    Status,
    /// Show flow control counters and per-controller queues
    Flow,
    /// Show authentication cache statistics
    Cache,
    /// List cached entries (key and principal) for one filter
    Entries {
        filter: String,
    },
    /// Drop cached authentications: all, one filter, or one entry
    Invalidate {
        /// Filter name (e.g. "basic"); omit to clear everything
        filter: Option<String>,
        /// Cache key within the filter
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let (method, path) = match &cli.command {
        Commands::Status => (Method::GET, "/admin/status".to_string()),
        Commands::Flow => (Method::GET, "/admin/flow".to_string()),
        Commands::Cache => (Method::GET, "/admin/auth-cache".to_string()),
        Commands::Entries { filter } => (Method::GET, format!("/admin/auth-cache/{}", filter)),
        Commands::Invalidate { filter, key } => {
            let path = match (filter, key) {
                (None, _) => "/admin/auth-cache".to_string(),
                (Some(filter), None) => format!("/admin/auth-cache/{}", filter),
                (Some(filter), Some(key)) => format!("/admin/auth-cache/{}/{}", filter, key),
            };
            (Method::DELETE, path)
        }
    };

    let res = client
        .request(method, format!("{}{}", cli.url.trim_end_matches('/'), path))
        .headers(headers)
        .send()
        .await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
