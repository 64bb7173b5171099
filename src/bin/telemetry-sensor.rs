use std::process::exit;

use rand::rngs::StdRng;
use rand::SeedableRng;

use telemetryd::amqp::AmqpConnector;
use telemetryd::config::Configuration;
use telemetryd::producer::{self, ProducerSettings};
use telemetryd::record::ReadingGenerator;
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

    log::info!(target: "telemetryd", "Satellite sensor initialized.");

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

    let connector = AmqpConnector::new(configuration.queue_host.clone(), configuration.amqp_uri());
    let settings = ProducerSettings::default();
    let mut generator = ReadingGenerator::new(settings.sensor_id.clone(), StdRng::from_entropy());

    runtime.block_on(producer::run(&connector, &mut generator, &settings, &shutdown));

    log::info!(target: "telemetryd", "Exiting");
    exit(0);
}
