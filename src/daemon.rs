use anyhow::{Context, Result};
use jkbms_lib::tokio_serial_async::JkBms;
use jkbms_lib::TelemetryRecord;
use log::{error, info, warn};
use std::time::{Duration, Instant};

use crate::{commandline, mqtt};

const STATUS_INTERVAL: Duration = Duration::from_secs(60 * 60);

enum Sink {
    Console,
    Mqtt {
        publisher: mqtt::MqttPublisher,
        format: commandline::MqttFormat,
    },
}

/// Loop and error counters for the periodic status line.
struct Stats {
    started: Instant,
    last_report: Instant,
    loops: u64,
    errors: u64,
}

impl Stats {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            last_report: now,
            loops: 0,
            errors: 0,
        }
    }

    fn status_due(&mut self, now: Instant) -> Option<String> {
        if now.duration_since(self.last_report) < STATUS_INTERVAL {
            return None;
        }
        self.last_report = now;
        // whole seconds keep the humantime output short
        let uptime = Duration::from_secs(now.duration_since(self.started).as_secs());
        Some(format!(
            "Status: uptime {}, {} polls, {} errors",
            humantime::format_duration(uptime),
            self.loops,
            self.errors
        ))
    }
}

pub fn print_record(record: &TelemetryRecord) {
    println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
    println!("Pack: {:#?}", record.pack);
    for (index, cell) in record.cells.iter().enumerate() {
        println!("Cell {index}: {} mV ({:.3} V)", cell.millivolts, cell.volts);
    }
    println!("--------------------------");
}

/// One MQTT message per leaf value, `<base_topic>/<name>/<key>...`.
fn simple_format_messages(
    base_topic: &str,
    name: &str,
    value: &serde_json::Value,
) -> Vec<(String, String)> {
    fn collect_recursive(topic: String, val: &serde_json::Value, out: &mut Vec<(String, String)>) {
        match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    collect_recursive(format!("{topic}/{k}"), v, out);
                }
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    collect_recursive(format!("{topic}/{i}"), v, out);
                }
            }
            serde_json::Value::String(s) => out.push((topic, s.clone())),
            serde_json::Value::Number(n) => out.push((topic, n.to_string())),
            serde_json::Value::Bool(b) => out.push((topic, b.to_string())),
            serde_json::Value::Null => {}
        }
    }
    let mut messages = Vec::new();
    collect_recursive(format!("{base_topic}/{name}"), value, &mut messages);
    messages
}

/// Topic and payload of every message a record is published as.
fn record_messages(
    format: &commandline::MqttFormat,
    base_topic: &str,
    record: &TelemetryRecord,
) -> serde_json::Result<Vec<(String, String)>> {
    let documents = [
        ("pack", serde_json::to_value(&record.pack)?),
        ("cells", serde_json::to_value(&record.cells)?),
    ];
    let mut messages = Vec::new();
    for (name, value) in documents {
        match format {
            commandline::MqttFormat::Json => {
                messages.push((format!("{base_topic}/{name}"), value.to_string()));
            }
            commandline::MqttFormat::Simple => {
                messages.extend(simple_format_messages(base_topic, name, &value));
            }
        }
    }
    Ok(messages)
}

/// Publishes one record, returns the number of failed publishes.
fn publish_record(
    publisher: &mqtt::MqttPublisher,
    format: &commandline::MqttFormat,
    record: &TelemetryRecord,
) -> usize {
    let messages = match record_messages(format, publisher.topic(), record) {
        Ok(messages) => messages,
        Err(e) => {
            error!("Failed to serialize record: {e}");
            return 1;
        }
    };
    let mut failures = 0;
    for (topic, payload) in messages {
        if let Err(e) = publisher.publish(&topic, &payload) {
            error!("Failed to publish message to topic {topic}: {e:#}");
            failures += 1;
        }
    }
    failures
}

fn write_record(sink: &Sink, record: &TelemetryRecord) -> usize {
    match sink {
        Sink::Console => {
            print_record(record);
            0
        }
        Sink::Mqtt { publisher, format } => publish_record(publisher, format, record),
    }
}

pub async fn run(
    mut bms: JkBms,
    output: commandline::DaemonOutput,
    interval: Duration,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}, interval={interval:?}");
    anyhow::ensure!(!interval.is_zero(), "Polling interval must be greater than zero");

    let sink = match output {
        commandline::DaemonOutput::Console => Sink::Console,
        commandline::DaemonOutput::Mqtt {
            config_file,
            format,
        } => {
            let config = mqtt::MqttConfig::load(&config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
            info!("Successfully loaded MQTT config from {config_file}: {config:?}");
            let publisher = mqtt::MqttPublisher::new(config)
                .with_context(|| "Failed to create MQTT publisher")?;
            info!("MQTT Publisher created successfully.");
            Sink::Mqtt { publisher, format }
        }
    };

    let mut stats = Stats::new(Instant::now());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.with_context(|| "Cannot listen for shutdown signal")?;
                info!("Shutdown requested, closing serial port");
                bms.reset();
                return Ok(());
            }
            _ = poll_once(&mut bms, &sink, &mut stats, &mut ticker) => {}
        }
    }
}

async fn poll_once(
    bms: &mut JkBms,
    sink: &Sink,
    stats: &mut Stats,
    ticker: &mut tokio::time::Interval,
) {
    ticker.tick().await;
    stats.loops += 1;
    match bms.fetch_once().await {
        Ok(record) => {
            let failures = write_record(sink, &record);
            if failures > 0 {
                warn!("{failures} values could not be published");
                stats.errors += 1;
            }
        }
        Err(e) => {
            error!("Polling BMS failed ({} error): {e}", e.kind());
            stats.errors += 1;
        }
    }

    if let Some(status) = stats.status_due(Instant::now()) {
        info!("{status}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jkbms_lib::{CellData, PackData};

    fn record() -> TelemetryRecord {
        TelemetryRecord {
            pack: PackData {
                pack_voltage: 53.12,
                pack_current: -10.5,
                state_of_charge: 60,
                ..Default::default()
            },
            cells: CellData::decode(&[0x01, 0x0D, 0x02]),
        }
    }

    fn payload<'a>(messages: &'a [(String, String)], topic: &str) -> &'a str {
        messages
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, p)| p.as_str())
            .unwrap_or_else(|| panic!("no message on {topic}"))
    }

    #[test]
    fn json_format_publishes_pack_and_cells_documents() {
        let messages =
            record_messages(&commandline::MqttFormat::Json, "jkbms", &record()).unwrap();

        assert_eq!(messages.len(), 2);
        let pack = payload(&messages, "jkbms/pack");
        assert!(pack.contains(r#""pack_voltage":53.12"#), "{pack}");
        assert!(pack.contains(r#""pack_current":-10.5"#), "{pack}");
        let cells = payload(&messages, "jkbms/cells");
        assert!(cells.contains(r#""cell0V":3.33"#), "{cells}");
        assert!(cells.contains(r#""cell0mV":3330"#), "{cells}");
    }

    #[test]
    fn simple_format_publishes_every_leaf() {
        let messages =
            record_messages(&commandline::MqttFormat::Simple, "garage", &record()).unwrap();

        assert_eq!(payload(&messages, "garage/pack/pack_voltage"), "53.12");
        assert_eq!(payload(&messages, "garage/pack/state_of_charge"), "60");
        assert_eq!(payload(&messages, "garage/pack/fet_status/charging"), "false");
        assert_eq!(payload(&messages, "garage/pack/temperatures/ntc0"), "0");
        assert_eq!(payload(&messages, "garage/cells/cell0V"), "3.33");
        assert_eq!(payload(&messages, "garage/cells/cell0mV"), "3330");
        // sensors that did not report are left out
        assert!(messages.iter().all(|(topic, _)| !topic.ends_with("/ntc1")));
    }

    #[test]
    fn status_line_once_per_hour() {
        let start = Instant::now();
        let mut stats = Stats::new(start);
        stats.loops = 360;
        stats.errors = 2;

        assert_eq!(stats.status_due(start + Duration::from_secs(59 * 60)), None);
        assert_eq!(
            stats.status_due(start + Duration::from_secs(60 * 60)).as_deref(),
            Some("Status: uptime 1h, 360 polls, 2 errors")
        );
        assert_eq!(stats.status_due(start + Duration::from_secs(61 * 60)), None);
        assert_eq!(
            stats
                .status_due(start + Duration::from_secs(2 * 60 * 60 + 90))
                .as_deref(),
            Some("Status: uptime 2h 1m 30s, 360 polls, 2 errors")
        );
    }
}
