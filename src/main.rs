use anyhow::Context;
use std::fs::File;
use std::io::BufReader;
use tranche_engine::config::MarketConfig;
use tranche_engine::replay::Replay;

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .context("usage: tranche-engine <events.csv>")?;

    let config = MarketConfig::from_env().context("Configuration error")?;
    let file = File::open(&path).with_context(|| format!("Failed to open {}", path))?;

    let mut replay = Replay::new(&config).context("Failed to create market")?;
    let stdout = std::io::stdout();
    let steps = replay
        .run(BufReader::new(file), stdout.lock())
        .with_context(|| format!("Replay of {} aborted", path))?;

    tracing::info!(
        steps = steps.len(),
        halted = replay.market().is_halted(),
        "Replay complete"
    );
    Ok(())
}
