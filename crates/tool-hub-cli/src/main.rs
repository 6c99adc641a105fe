use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Instant;
use tool_hub_client::{ArgDefault, ClientConfig, ToolClient, ToolOutput};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tool-hub")]
#[command(about = "Discover and call tools on a JSON-RPC/SSE tool hub")]
#[command(version)]
struct Cli {
    /// Tool hub URL
    #[arg(long, env = "MCP_SERVER_URL")]
    endpoint: Option<String>,

    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// standard, test or fast-test
    #[arg(long)]
    profile: Option<String>,

    /// Enable debug mode
    #[arg(long, short, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tools with their argument models, and resources
    List,
    /// Call one tool
    Call {
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Read one resource by URI or name
    Read { uri: String },
    /// Discovery plus a fixed set of smoke calls
    Suite {
        /// Also run the slow booking/flight/airport cases
        #[arg(long)]
        extended: bool,
    },
}

struct SmokeCase {
    tool: &'static str,
    args: Value,
    description: &'static str,
    extended: bool,
}

fn smoke_cases() -> Vec<SmokeCase> {
    let case = |tool, args, description, extended| SmokeCase {
        tool,
        args,
        description,
        extended,
    };
    vec![
        case("health.ping", json!({}), "Basic connectivity check", false),
        case(
            "geo.text_to_place",
            json!({"query": "Paris", "country": "FR"}),
            "Geocoding Paris, FR",
            false,
        ),
        case("places.overview", json!({"query": "London"}), "Place overview for London", false),
        case(
            "weather.brief",
            json!({"lat": 40.7128, "lon": -74.0060}),
            "Weather brief for New York",
            false,
        ),
        case("airports.nearest", json!({"city": "Berlin"}), "Nearest airport to Berlin", true),
        case(
            "booking.search",
            json!({"city": "Rome", "checkin": "2025-06-01", "checkout": "2025-06-03", "max_results": 2}),
            "Booking search in Rome",
            true,
        ),
        case(
            "flights.prices",
            json!({"origin": "LHR", "destination": "JFK", "start_date": "2026-02-12", "end_date": "2026-02-20"}),
            "Flight prices LHR -> JFK",
            true,
        ),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .with_file(false),
        )
        .init();

    let config = build_config(&cli)?;
    tracing::debug!("Using tool hub at {}", config.endpoint);
    let client = ToolClient::new(config)?;

    let result = match cli.command {
        Commands::List => list(&client).await,
        Commands::Call { tool, args } => call(&client, &tool, &args).await,
        Commands::Read { uri } => read(&client, &uri).await,
        Commands::Suite { extended } => suite(&client, extended).await,
    };

    client.shutdown();
    result
}

fn build_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let endpoint = cli
                .endpoint
                .clone()
                .ok_or_else(|| anyhow!("set --endpoint or MCP_SERVER_URL"))?;
            let mut config = ClientConfig::new(endpoint);
            config.apply_env_overrides()?;
            config
        }
    };

    // Explicit MCP_* limits still win over the profile's defaults
    if let Some(profile) = &cli.profile {
        config.override_profile(profile.parse()?)?;
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    config.validate()?;
    Ok(config)
}

fn parse_args(raw: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("--args must be JSON")? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(anyhow!("--args must be a JSON object, got {}", other)),
    }
}

async fn list(client: &ToolClient) -> anyhow::Result<()> {
    let catalogue = client.discover().await;
    if catalogue.is_empty() {
        println!("{}", format!("⚠️ No tools discovered at {}", catalogue.endpoint).yellow());
        return Ok(());
    }

    println!("{}", format!("🔧 {} tools", catalogue.tools.len()).cyan());
    for tool in &catalogue.tools {
        println!("{} - {}", tool.name.green(), tool.description);
        for field in &tool.arguments.fields {
            let default = match &field.default {
                ArgDefault::Required => "required".to_string(),
                ArgDefault::Omit => "optional".to_string(),
                ArgDefault::Value(value) => format!("default {}", value),
            };
            println!("    {}: {} ({})", field.name, field.kind, default.dimmed());
        }
    }

    if !catalogue.resources.is_empty() {
        println!("{}", format!("📚 {} resources", catalogue.resources.len()).cyan());
        for resource in &catalogue.resources {
            println!("{} {} - {}", resource.name.green(), resource.uri.dimmed(), resource.description);
        }
    }
    Ok(())
}

fn print_output(output: &ToolOutput, started: Instant) {
    let elapsed = started.elapsed();
    match output {
        ToolOutput::Success(text) => {
            println!("{}", format!("✅ Done in {:.2?}", elapsed).green());
            println!("{}", text);
        }
        failure => {
            println!("{}", format!("❌ Failed in {:.2?}", elapsed).red());
            println!("{}", failure.text().red());
        }
    }
}

async fn call(client: &ToolClient, tool: &str, raw_args: &str) -> anyhow::Result<()> {
    let args = parse_args(raw_args)?;
    client.discover().await;

    let started = Instant::now();
    let output = match client.tool(tool) {
        Some(handle) => handle.call(args).await?,
        None => client.call(tool, args).await,
    };
    print_output(&output, started);
    Ok(())
}

async fn read(client: &ToolClient, uri: &str) -> anyhow::Result<()> {
    client.discover().await;

    let started = Instant::now();
    let output = match client.resource(uri) {
        Some(handle) => handle.read().await,
        None => client.read_resource(uri).await,
    };
    print_output(&output, started);
    Ok(())
}

async fn suite(client: &ToolClient, extended: bool) -> anyhow::Result<()> {
    println!("{}", format!("🚀 Tool suite against {}", client.config().endpoint).cyan());

    let started = Instant::now();
    let catalogue = client.discover().await;
    println!("Fetched {} tools in {:.2?}", catalogue.tools.len(), started.elapsed());

    let (mut passed, mut failed, mut skipped) = (0, 0, 0);
    for case in smoke_cases().into_iter().filter(|c| extended || !c.extended) {
        println!("\n--- {}: {} ---", case.tool.bold(), case.description);
        if catalogue.tool(case.tool).is_none() {
            println!("{}", format!("⚠️ {} not in catalogue, skipping", case.tool).yellow());
            skipped += 1;
            continue;
        }

        let args = match case.args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let started = Instant::now();
        let output = client.call(case.tool, args).await;
        match &output {
            ToolOutput::Success(_) => {
                println!("{}", format!("✅ PASSED in {:.2?}", started.elapsed()).green());
                passed += 1;
            }
            failure => {
                println!("{}", format!("❌ FAILED in {:.2?}", started.elapsed()).red());
                println!("{}", failure.text().red());
                failed += 1;
            }
        }
    }

    println!(
        "\n{} passed, {} failed, {} skipped in {:.2?}",
        passed.to_string().green(),
        failed.to_string().red(),
        skipped,
        started.elapsed()
    );
    if failed > 0 {
        return Err(anyhow!("{} smoke call(s) failed", failed));
    }
    Ok(())
}
