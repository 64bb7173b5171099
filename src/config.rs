//! Configuration of both daemons, resolved once at startup.
use std::time::Duration;

use clap::Parser;

use crate::database::DatabaseParameters;

/// Port of the AMQP listener.
pub const AMQP_PORT: u16 = 5672;
/// Credentials and vhost for the queue service.
pub const AMQP_USERNAME: &str = "guest";
pub const AMQP_PASSWORD: &str = "guest";
pub const AMQP_VHOST: &str = "%2f";

pub const DATABASE_PORT: u16 = 5432;
pub const DATABASE_USERNAME: &str = "postgres";
pub const DATABASE_PASSWORD: &str = "YourStrong!Passw0rd";
pub const DATABASE_NAME: &str = "telemetry";

/// Identifier the simulated sensor reports under.
pub const SENSOR_ID: &str = "SAT-001";

/// Delay between two published readings.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);
/// Backoff between attempts to reach the queue service from the sensor.
pub const QUEUE_RETRY_BACKOFF: Duration = Duration::from_secs(3);
/// Backoff between readiness probes of the store from the receiver.
pub const STORE_RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(version, about)]
/// Hosts of the services the daemons depend on.
///
/// Each value is taken from its environment variable and falls back to `localhost`.
pub struct Configuration
{
    /// Host of the RabbitMQ broker.
    #[arg(long, env = "RabbitMQHost", default_value = "localhost")]
    pub queue_host: String,
    /// Host of the postgres server.
    #[arg(long, env = "SQLHost", default_value = "localhost")]
    pub store_host: String,
}

impl Configuration {
    /// Resolves the configuration from the process arguments and environment.
    pub fn resolve() -> Self {
        Configuration::parse()
    }

    pub fn amqp_uri(&self) -> String {
        format!("amqp://{}:{}@{}:{}/{}",
                AMQP_USERNAME, AMQP_PASSWORD, self.queue_host, AMQP_PORT, AMQP_VHOST)
    }

    pub fn database_parameters(&self) -> DatabaseParameters {
        DatabaseParameters {
            hostname: self.store_host.clone(),
            port: DATABASE_PORT,
            username: DATABASE_USERNAME.to_string(),
            password: DATABASE_PASSWORD.to_string(),
            database: DATABASE_NAME.to_string(),
        }
    }
}
