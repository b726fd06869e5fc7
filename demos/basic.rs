//! Minimal runnable demo: loads deployment config from a YAML file or
//! `SWITCHBOARD_DEPLOYMENT_*` environment variables, starts a Switchboard,
//! and sends one chat completion.
//!
//! Grounded in the teacher's `src/bin/pricing-tool.rs` for the standalone-CLI
//! shape and `src/main.rs` for logging setup.

use clap::Parser;
use switchboard::{ChatMessage, ChatRequest, MessageRole, Switchboard, SwitchboardConfig};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "switchboard-demo", about = "Send a single chat completion through a Switchboard")]
struct Args {
    /// Path to a YAML deployment config. Falls back to
    /// SWITCHBOARD_DEPLOYMENT_* environment variables when absent.
    #[arg(long, env = "SWITCHBOARD_CONFIG")]
    config: Option<String>,

    /// Model name to request.
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// Prompt to send.
    #[arg(long, default_value = "Say hello in five words.")]
    prompt: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_max_level(Level::INFO).with_target(false).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SwitchboardConfig::from_yaml_file(path)?,
        None => SwitchboardConfig {
            deployments: SwitchboardConfig::deployments_from_env()?,
            ..SwitchboardConfig::default()
        },
    };

    let switchboard = Switchboard::new(config)?;
    switchboard.start().await;

    let request = ChatRequest::new(args.model).with_message(ChatMessage::new(MessageRole::User, args.prompt));

    match switchboard.create(&request).await {
        Ok(response) => {
            info!(deployment_response_id = %response.id, "completion succeeded");
            if let Some(choice) = response.choices.first() {
                println!("{}", choice.message.content);
            }
        }
        Err(err) => {
            eprintln!("request failed: {err}");
        }
    }

    let gauges: Vec<(String, f64, f64, bool)> = switchboard
        .deployments()
        .iter()
        .map(|deployment| {
            (
                deployment.name().to_string(),
                deployment.rpm_utilization(),
                deployment.tpm_utilization(),
                deployment.healthy(),
            )
        })
        .collect();
    println!("{}", switchboard.metrics().export_prometheus(&gauges));

    switchboard.stop().await;
    Ok(())
}
