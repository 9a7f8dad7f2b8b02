// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Sense HAT Live! producer: samples the board and publishes JSON snapshots
//! until SIGINT or SIGTERM.

use clap::Parser;
use sensehat_telemetry::{
    config::DEFAULT_CONFIG_PATH,
    exchange::ExchangeKind,
    publisher::Producer,
    sensors::{
        SensorConfig, SensorKind, SensorLoop, SimulatedSenseHat, DEFAULT_SENSOR_CONFIG_PATH,
        FAHRENHEIT, INCHES_OF_MERCURY,
    },
    topology::Topology,
};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sensehat-live")]
#[command(about = "Sense HAT Live! - telemetry producer")]
#[command(version)]
struct Cli {
    /// Broker configuration file
    #[arg(long, value_name = "FILE", env = "SENSEHAT_BROKER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    broker_config: PathBuf,

    /// Sensor configuration file, created from the defaults when missing
    #[arg(long, value_name = "FILE", env = "SENSEHAT_SENSOR_CONFIG", default_value = DEFAULT_SENSOR_CONFIG_PATH)]
    sensor_config: PathBuf,

    /// Queue the samples are delivered to
    #[arg(long, default_value = "samples")]
    queue: String,

    /// Exchange to publish through, the default exchange when empty
    #[arg(long, default_value = "")]
    exchange: String,

    /// direct, fanout, topic or headers
    #[arg(long, default_value = "direct")]
    exchange_kind: ExchangeKind,

    /// Routing key, defaults to the queue name
    #[arg(long)]
    routing_key: Option<String>,

    /// Seconds between two samples (at least 1)
    #[arg(long, default_value_t = 10)]
    interval: u64,

    /// Identifier put in every sample
    #[arg(long, env = "SENSEHAT_DEVICE_ID", default_value = "sensehat-01")]
    device_id: String,

    /// Publish temperatures in Fahrenheit, whatever the sensor config says
    #[arg(long)]
    fahrenheit: bool,

    /// Publish pressure in inches of mercury, whatever the sensor config says
    #[arg(long)]
    inhg: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Warnings and errors only
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    // RUST_LOG wins over the flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{level},lapin=warn,amq_protocol=warn,pinky_swear=warn"))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    info!("Sense Hat Live!: Producer v{}", env!("CARGO_PKG_VERSION"));

    let mut topology = Topology::new(&cli.queue)
        .exchange(&cli.exchange)
        .kind(cli.exchange_kind.clone());
    if let Some(key) = &cli.routing_key {
        topology = topology.routing_key(key);
    }

    let mut sensors = match SensorConfig::load_or_create(&cli.sensor_config) {
        Ok(sensors) => sensors,
        Err(err) => {
            error!(
                error = err.to_string(),
                path = %cli.sensor_config.display(),
                "failure to load the sensor configuration"
            );
            return ExitCode::FAILURE;
        }
    };
    if cli.fahrenheit {
        sensors.set_units(SensorKind::Temperature, FAHRENHEIT);
    }
    if cli.inhg {
        sensors.set_units(SensorKind::Pressure, INCHES_OF_MERCURY);
    }

    let mut producer = match Producer::new(topology, &cli.broker_config) {
        Ok(producer) => producer,
        Err(err) => {
            error!(
                error = err.to_string(),
                path = %cli.broker_config.display(),
                "failure to load the broker configuration"
            );
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            error!(error = err.to_string(), signal, "failure to register signal handler");
            return ExitCode::FAILURE;
        }
    }

    if let Err(err) = producer.start() {
        error!(error = err.to_string(), "failure to start the producer");
        return ExitCode::FAILURE;
    }

    let mut sensor_loop = SensorLoop::new(SimulatedSenseHat::new(), &cli.device_id)
        .interval(Duration::from_secs(cli.interval))
        .config(sensors);

    sensor_loop.run(&producer, &shutdown);

    info!("signal caught, exiting...");
    producer.stop();

    ExitCode::SUCCESS
}
