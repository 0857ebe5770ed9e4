//! Connect a manipulator described by a TOML file and print its state.
//!
//! Usage: `cargo run --example from_config -- manipulator.toml`

use anyhow::Context;
use newscale_driver::MultiStageConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let path = std::env::args()
        .nth(1)
        .context("usage: from_config <config.toml>")?;
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let config = MultiStageConfig::from_toml(&text)?;

    let group = config.connect().await?;
    for (name, position) in group.get_positions().await {
        match position {
            Ok(um) => tracing::info!(axis = name, position_um = um, "axis online"),
            Err(err) => tracing::warn!(axis = name, %err, "axis did not answer"),
        }
    }
    Ok(())
}
