//! Cycle an XYZ manipulator between two corners of its travel.
//!
//! Usage: `cargo run --example xyz_back_and_forth -- /dev/ttyUSB0`
//! (omit the port to auto-discover a New Scale hub).

use anyhow::Context;
use newscale_driver::{discover_serial_ports, open_usb_xyz, StageSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let port = match std::env::args().nth(1) {
        Some(port) => port,
        None => discover_serial_ports()?
            .into_iter()
            .next()
            .context("no New Scale hub found; pass a port explicitly")?,
    };

    let group = open_usb_xyz(&port, StageSettings::default()).await?;
    for (name, stage) in [("x", group.axis("x")?), ("y", group.axis("y")?), ("z", group.axis("z")?)]
    {
        tracing::info!(axis = name, firmware = stage.firmware_version(), "axis ready");
    }

    let near = [("x", 1000.0), ("y", 1000.0), ("z", 1000.0)];
    let far = [("x", 9000.0), ("y", 9000.0), ("z", 9000.0)];
    for cycle in 0..5 {
        for corner in [&near, &far] {
            let report = group.move_absolute(corner, true).await?;
            tracing::info!(cycle, outcome = ?report.outcome, "corner reached");
            if !report.is_complete() {
                group.stop_group().await;
                anyhow::bail!("group move did not complete: {:?}", report.outcome);
            }
        }
    }

    for (name, position) in group.get_positions().await {
        tracing::info!(axis = name, position_um = position?, "final position");
    }
    Ok(())
}
