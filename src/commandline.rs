use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Poll the BMS once and print pack and cell data
    Fetch,
    /// Run in daemon mode, periodically polling the BMS and outputting the telemetry
    Daemon {
        /// Output destination for telemetry
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval between polls (e.g., "10s", "1m")
        #[clap(long, short, env = "JKBMS_INTERVAL", value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    /// Every value on its own sub-topic
    Simple,
    /// One JSON document per `pack` and `cells` topic
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously poll and print the telemetry to the standard output (console).
    Console,
    /// Continuously poll and publish the telemetry to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Json)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "jk bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, env = "JKBMS_DEVICE", default_value_t = default_device_name())]
    pub device: String,

    /// Serial line speed
    #[arg(short, long, env = "JKBMS_BAUD_RATE", default_value_t = jkbms_lib::tokio_serial_async::DEFAULT_BAUD_RATE)]
    pub baud_rate: u32,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Ceiling for one complete request/response exchange (e.g., "500ms", "2s")
    #[arg(value_parser = humantime::parse_duration, long, env = "JKBMS_TIMEOUT", default_value = "2s")]
    pub timeout: Duration,

    /// Line silence that ends a response frame (e.g., "100ms", "200ms")
    #[arg(value_parser = humantime::parse_duration, long, env = "JKBMS_QUIET_INTERVAL", default_value = "200ms")]
    pub quiet_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CliArgs::try_parse_from(["jkbms", "fetch"]).unwrap();
        assert_eq!(args.baud_rate, 115200);
        assert_eq!(args.timeout, Duration::from_secs(2));
        assert_eq!(args.quiet_interval, Duration::from_millis(200));
        assert_eq!(args.command, CliCommands::Fetch);
    }

    #[test]
    fn daemon_with_mqtt_output() {
        let args = CliArgs::try_parse_from([
            "jkbms",
            "--device",
            "/dev/ttyS3",
            "--timeout",
            "1s 500ms",
            "daemon",
            "--interval",
            "30s",
            "mqtt",
            "--config-file",
            "broker.yaml",
            "--format",
            "simple",
        ])
        .unwrap();
        assert_eq!(args.device, "/dev/ttyS3");
        assert_eq!(args.timeout, Duration::from_millis(1500));
        assert_eq!(
            args.command,
            CliCommands::Daemon {
                output: DaemonOutput::Mqtt {
                    config_file: "broker.yaml".to_string(),
                    format: MqttFormat::Simple,
                },
                interval: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn rejects_malformed_duration() {
        assert!(CliArgs::try_parse_from(["jkbms", "--timeout", "soon", "fetch"]).is_err());
    }
}
