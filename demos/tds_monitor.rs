//! TDS transit monitor example
//!
//! Finds a probe hub, starts streaming, prints readings and battery levels,
//! and on Ctrl+C stops the device and reports the tracer's transit velocity.
//!
//! Run with: cargo run --example tds_monitor
//!
//! To set the distance between the probes (feet) and report in meters:
//!   cargo run --example tds_monitor -- --distance 25 --meters

use std::time::Duration;
use tds_probe_ble::{
    BleConnectionManager, BleScanner, BtleplugClient, DeviceEvent, DistanceUnit, Result,
    TransitRecorder,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,tds_probe_ble=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let distance_feet = args
        .iter()
        .position(|arg| arg == "--distance")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(10.0);
    let unit = if args.iter().any(|arg| arg == "--meters") {
        DistanceUnit::Meters
    } else {
        DistanceUnit::Feet
    };

    println!("TDS Transit Monitor");
    println!("===================\n");
    println!("Looking for a probe hub...\n");

    let scanner = BleScanner::new().await?;
    let device = scanner.find_device(Duration::from_secs(15)).await?;

    let manager = BleConnectionManager::new(BtleplugClient::new());
    let mut events = manager.subscribe();

    manager.connect(device).await?;
    println!("Connected.");

    manager.send_start().await?;
    println!("Streaming. Press Ctrl+C to stop.\n");

    let mut recorder = TransitRecorder::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(DeviceEvent::TelemetryReceived { reading, received_at }) => {
                    recorder.record(&reading, received_at);
                    println!(
                        "[{:>6}] probe 1: {:>8.2} ppm   probe 2: {:>8.2} ppm",
                        recorder.len(),
                        reading.probe1,
                        reading.probe2
                    );
                }
                Some(DeviceEvent::BatteryUpdated(levels)) => {
                    println!("Battery: probe 1 {}%, probe 2 {}%", levels.probe1, levels.probe2);
                }
                Some(DeviceEvent::ConnectionStateChanged(false)) => {
                    println!("Connection lost.");
                    break;
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping...");
                if let Err(e) = manager.send_stop().await {
                    eprintln!("Stop failed: {}", e);
                }
                break;
            }
        }
    }

    match (recorder.peaks(), recorder.velocity(distance_feet, unit)) {
        (Some((p1, p2)), Some(velocity)) => {
            let unit = match unit {
                DistanceUnit::Feet => "ft/s",
                DistanceUnit::Meters => "m/s",
            };
            println!("\nPeak 1: {:.2} ppm at {:.1} s", p1.ppm, p1.elapsed_secs);
            println!("Peak 2: {:.2} ppm at {:.1} s", p2.ppm, p2.elapsed_secs);
            println!("Velocity: {:.2} {}", velocity, unit);
        }
        _ => println!("\nNot enough data for a velocity."),
    }

    manager.shutdown().await
}
