//! # MQTT Bridge CLI
//!
//! Command-line utilities for checking configurations and timestamps.

use anyhow::{Context, Result};
use mqtt_bridge_core::{Configuration, RoutingTables, TimestampFormat};
use std::env;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "validate" => {
            if args.len() < 3 {
                eprintln!("Usage: mqtt-bridge validate <config.json>");
                std::process::exit(1);
            }
            validate(&args[2])?;
        }
        "to-ns" => {
            if args.len() < 4 {
                eprintln!("Usage: mqtt-bridge to-ns <format> <value>");
                std::process::exit(1);
            }
            let format: TimestampFormat = args[2].parse()?;
            let value = parse_value(&args[3]);
            let nanos = format
                .to_nanos(&value)
                .with_context(|| format!("Failed to convert {}", args[3]))?;
            println!("{nanos}");
        }
        "from-ns" => {
            if args.len() < 4 {
                eprintln!("Usage: mqtt-bridge from-ns <format> <nanoseconds>");
                std::process::exit(1);
            }
            let format: TimestampFormat = args[2].parse()?;
            let nanos: i64 = args[3].parse().context("Invalid nanoseconds")?;
            println!("{}", format.format_nanos(nanos));
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn validate(path: &str) -> Result<()> {
    let config = Configuration::load(path).with_context(|| format!("Invalid configuration {path}"))?;
    let routes = RoutingTables::new(&config).context("Failed to build routing tables")?;

    println!("Configuration OK: {path}");
    println!("  broker: {}", config.connection.ip);
    println!("  payloads: {}", config.payloads.len());
    println!("  metrics: {}", config.metrics_map.len());

    println!("Inbound topics:");
    for topic in routes.inbound_topics() {
        let metrics = routes.inbound(topic).unwrap_or_default();
        println!("  {topic} -> {} metric(s)", metrics.len());
    }

    println!("Outbound metrics:");
    for id in routes.outbound_ids() {
        let targets = routes.outbound(id).unwrap_or_default();
        let topics: Vec<&str> = targets.iter().map(|t| t.payload.topic.as_str()).collect();
        println!("  {id} -> {}", topics.join(", "));
    }

    Ok(())
}

/// Numbers parse as JSON numbers; anything else is taken as a string.
fn parse_value(raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ (serde_json::Value::Number(_) | serde_json::Value::String(_))) => value,
        _ => serde_json::Value::String(raw.to_string()),
    }
}

fn print_help() {
    println!(
        r#"MQTT Bridge CLI

USAGE:
    mqtt-bridge <COMMAND> [OPTIONS]

COMMANDS:
    validate <config.json>     Validate a bridge configuration and print its routes
    to-ns <format> <value>     Convert a timestamp to Unix nanoseconds
    from-ns <format> <ns>      Convert Unix nanoseconds to a timestamp
    help                       Show this help message

FORMATS:
    s, ms, ns, rfc3339

EXAMPLES:
    mqtt-bridge validate ./mqtt-bridge.json
    mqtt-bridge to-ns ms 1700000000000
    mqtt-bridge from-ns rfc3339 1700000000000000000
"#
    );
}
