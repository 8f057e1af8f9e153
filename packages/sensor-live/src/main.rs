use chrono::Local;
use clap::Parser;
use sensor_live::{
    ElementLookup, LiveConfig, LiveServices, PauseNotice, RefreshNotifier,
    SensorDescriptor, SensorSynchronizer, SharedSynchronizer, TextElement,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Follow live building-sensor values from the command line
#[derive(Debug, Parser)]
#[command(name = "sensor-live", version, about)]
struct Cli {
    /// Event stream URL, `{topic}` is replaced by the topic key (overrides SENSOR_STREAM_URL)
    #[arg(long)]
    stream_url: Option<String>,

    /// Snapshot URL polled for full refreshes (overrides SENSOR_SNAPSHOT_URL)
    #[arg(long)]
    snapshot_url: Option<String>,

    /// Topic key to subscribe to (repeatable)
    #[arg(short, long = "topic", required = true)]
    topics: Vec<String>,

    /// Sensor shown in the view, as `id:kind` (repeatable)
    #[arg(short, long = "sensor", value_parser = parse_sensor)]
    sensors: Vec<SensorDescriptor>,
}

fn parse_sensor(raw: &str) -> Result<SensorDescriptor, String> {
    let (id, kind) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("expected id:kind, got '{}'", raw))?;
    if id.is_empty() {
        return Err(format!("missing sensor id in '{}'", raw));
    }
    Ok(SensorDescriptor::new(id, kind.parse()?))
}

/// Terminal "view": every sensor element is a printed line
#[derive(Clone)]
struct ConsoleView;

struct ConsoleLine {
    id: String,
}

impl TextElement for ConsoleLine {
    fn set_text(&mut self, text: &str) {
        println!("{}  {:<32} {}", Local::now().format("%H:%M:%S"), self.id, text);
    }
}

impl ElementLookup for ConsoleView {
    type Element = ConsoleLine;

    fn lookup_element_by_id(&self, id: &str) -> Option<ConsoleLine> {
        Some(ConsoleLine { id: id.to_string() })
    }
}

struct BannerNotifier;

impl RefreshNotifier for BannerNotifier {
    fn paused(&self, notice: &PauseNotice) {
        let border = "═".repeat(62);
        warn!("╔{}╗", border);
        warn!("  ⏸  {}", notice.message());
        warn!("╚{}╝", border);
    }

    fn resumed(&self) {
        info!("▶️  Auto-refresh resumed");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensor_live=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration; CLI flags take precedence
    let mut config = LiveConfig::from_env_with(cli.stream_url)?;
    if let Some(url) = cli.snapshot_url {
        config.snapshot_url = Some(url);
    }
    config.validate()?;

    info!("🚀 Starting sensor-live v{}", VERSION);
    info!("   Stream: {}", config.stream_url);
    info!(
        "   Snapshot: {}",
        config.snapshot_url.as_deref().unwrap_or("(disabled)")
    );
    info!("   Topics: {}", cli.topics.join(", "));

    if cli.sensors.is_empty() {
        warn!("No --sensor given; every update will be ignored");
    }

    let mut synchronizer = SensorSynchronizer::with_prefix(ConsoleView, config.element_id_prefix.clone());
    synchronizer.replace_sensors(cli.sensors);
    let view = SharedSynchronizer::new(synchronizer);

    let services = LiveServices::from_config(config)?;
    let subscriptions = services.bind_view(&cli.topics, &view);
    let refresh = services.start_http_refresh(Arc::new(view.clone()), Arc::new(BannerNotifier))?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(controller) = refresh {
        controller.shutdown();
        controller.join().await;
    }
    drop(subscriptions);

    Ok(())
}
