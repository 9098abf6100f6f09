use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gatekeeper-cli")]
#[command(about = "Adjust per-client rate limits on a running load balancer", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set seconds between refills for a client
    SetRate {
        /// Client IP address or hashed client key
        ip: String,
        seconds: i64,
    },
    /// Set bucket capacity for a client
    SetMax {
        /// Client IP address or hashed client key
        ip: String,
        tokens: i64,
    },
    /// Dump Prometheus metrics
    Metrics,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::SetRate { ip, seconds } => {
            let res = client
                .post(format!("{}/set_rate", cli.url))
                .query(&[("ip", ip), ("value", seconds.to_string())])
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::SetMax { ip, tokens } => {
            let res = client
                .post(format!("{}/set_max", cli.url))
                .query(&[("ip", ip), ("value", tokens.to_string())])
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Metrics => {
            let res = client.get(format!("{}/metrics", cli.url)).send().await?;
            println!("{}", res.text().await?);
        }
    }

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;

    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{text}"),
    }
    if !status.is_success() {
        eprintln!("Error: load balancer returned status {status}");
        std::process::exit(1);
    }
    Ok(())
}
