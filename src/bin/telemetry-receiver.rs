use std::process::exit;

use telemetryd::amqp::AmqpConnector;
use telemetryd::config::Configuration;
use telemetryd::consumer::{self, ConsumerSettings};
use telemetryd::database::PostgresConnector;
use telemetryd::{logging, shutdown};

fn main() {
    let configuration = Configuration::resolve();

    match logging::init(logging::LOG_CONFIG_PATH) {
        Ok(_) => {},
        Err(err) => {
            eprintln!("Could not create logger: {}", err);
            exit(100);
        }
    };

    log::info!(target: "telemetryd", "Receiver service starting...");

    let (trigger, shutdown) = shutdown::channel();
    match ctrlc::set_handler(move || {
        log::info!(target: "telemetryd", "Termination signal received!");
        trigger.trigger();
    }) {
        Ok(_) => {},
        Err(err) => {
            log::error!(target: "telemetryd", "Could not install the termination handler: \'{}\'", err);
            exit(101);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!(target: "telemetryd", "Could not start the async runtime: \'{}\'", err);
            exit(102);
        }
    };

    let store_connector = PostgresConnector::new(configuration.database_parameters());
    let queue_connector = AmqpConnector::new(configuration.queue_host.clone(), configuration.amqp_uri());
    let settings = ConsumerSettings::default();

    match runtime.block_on(consumer::run(&store_connector, &queue_connector, &settings, &shutdown)) {
        Ok(_) => log::info!(target: "telemetryd", "Exiting"),
        Err(err) => {
            log::error!(target: "telemetryd", "Receiver stopped: \'{}\'", err);
            exit(1);
        }
    };
    exit(0);
}
