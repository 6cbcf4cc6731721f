use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "connector-cli")]
#[command(about = "Query the health endpoints of a running connector", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Full health snapshot: readiness, liveness and every channel check
    Health,
    /// Readiness only; exits non-zero when not ready
    Ready,
    /// Liveness only; exits non-zero when not alive
    Live,
}

impl Commands {
    fn path(&self) -> &'static str {
        match self {
            Commands::Health => "/health",
            Commands::Ready => "/health/ready",
            Commands::Live => "/health/live",
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}{}", cli.url.trim_end_matches('/'), cli.command.path()))
        .send()
        .await?;
    let healthy = print_response(res).await?;

    if !healthy {
        std::process::exit(1);
    }
    Ok(())
}

/// Print the snapshot; 503 still carries one, so only other errors are fatal.
async fn print_response(res: reqwest::Response) -> Result<bool, Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() && status != reqwest::StatusCode::SERVICE_UNAVAILABLE {
        eprintln!("Error: health endpoint returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(false);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    if let Some(checks) = json["checks"].as_array() {
        for check in checks {
            eprintln!(
                "  {:<24} {:<5} {:<13} {}",
                check["name"].as_str().unwrap_or("?"),
                check["status"].as_str().unwrap_or("?"),
                check["state"].as_str().unwrap_or("?"),
                check["reason"].as_str().unwrap_or("")
            );
        }
    }
    Ok(status.is_success())
}
