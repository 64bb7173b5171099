//! Module for connecting to a postgres database and storing the readings received from the
//! queue in the `TelemetryLogs` table.
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

use crate::bootstrap::Connector;
use crate::error::StoreError;
use crate::record::Reading;

static SQL_CREATE_TELEMETRY_LOGS: &str = include_str!("sql/create_telemetry_logs.sql");

static SQL_INSERT_READING: &str = include_str!("sql/insert_reading.sql");

/// Durable sink for readings.
#[async_trait]
pub trait Store: Send + Sync
{
    /// Makes sure the `TelemetryLogs` table exists. Doubles as readiness probe.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Inserts one reading in its own auto-committed statement.
    ///
    /// # Returns
    ///
    /// * `Ok(id)` - The key the store assigned to the new row.
    ///
    /// * `Err(...)` - The row was not written.
    async fn insert(&self, reading: &Reading) -> Result<i32, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Struct modeling the parameters required for a database connection.
pub struct DatabaseParameters
{
    /// The hostname of the database server.
    pub hostname: String,
    /// The port for the database server.
    pub port: u16,
    /// The username to connect as.
    pub username: String,
    /// The password to connect with.
    pub password: String,
    /// The database to open on the server.
    pub database: String,
}

impl DatabaseParameters {
    fn connection_string(&self) -> String {
        format!("user={} password={} host={} port={} dbname={} application_name=telemetryd",
                self.username,
                self.password,
                self.hostname,
                self.port,
                self.database)
    }
}

/// Opens a client and drives its connection on a background task.
async fn open_client(params: &DatabaseParameters) -> Result<Client, StoreError>
{
    let (client, connection) = tokio_postgres::connect(params.connection_string().as_str(), NoTls)
        .await
        .map_err(StoreError::Connection)?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            log::error!(target: "telemetryd::db", "Database connection closed: \'{}\'", err);
        }
    });

    Ok(client)
}

/// Store backed by a postgres database.
///
/// A client that broke during an insert is dropped and the next insert connects again.
pub struct PostgresStore
{
    params: DatabaseParameters,
    client: Mutex<Option<Client>>,
}

impl PostgresStore {
    /// Connects to the database described by `params`.
    ///
    /// # Errors
    ///
    /// * `StoreError::Connection` - The server is unreachable or rejected the credentials.
    pub async fn connect(params: DatabaseParameters) -> Result<Self, StoreError> {
        let client = open_client(&params).await?;
        log::info!(target: "telemetryd::db", "Database connection established!");
        Ok(Self { params, client: Mutex::new(Some(client)) })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(open_client(&self.params).await?);
        }
        let client = guard.as_ref().ok_or(StoreError::Unavailable)?;

        client.batch_execute(SQL_CREATE_TELEMETRY_LOGS).await.map_err(StoreError::Schema)
    }

    async fn insert(&self, reading: &Reading) -> Result<i32, StoreError> {
        let mut guard = self.client.lock().await;
        if guard.as_ref().map_or(true, Client::is_closed) {
            log::info!(target: "telemetryd::db", "Reconnecting to the database...");
            *guard = Some(open_client(&self.params).await?);
        }
        let client = guard.as_ref().ok_or(StoreError::Unavailable)?;

        let result = client
            .query_one(SQL_INSERT_READING,
                       &[&reading.sensor_id, &reading.temperature, &reading.humidity, &reading.timestamp])
            .await;

        match result {
            Ok(row) => row.try_get::<_, i32>("Id").map_err(StoreError::Insert),
            Err(err) => {
                log::warn!(target: "telemetryd::db", "Could not insert reading into database: \'{}\'", err);
                if client.is_closed() {
                    *guard = None;
                }
                Err(StoreError::Insert(err))
            }
        }
    }
}

/// Connects to postgres and ensures the schema, i.e. waits for the store to be ready.
#[derive(Debug, Clone)]
pub struct PostgresConnector
{
    params: DatabaseParameters,
}

impl PostgresConnector {
    pub fn new(params: DatabaseParameters) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    type Handle = PostgresStore;
    type Error = StoreError;

    fn target(&self) -> String {
        format!("PostgreSQL at {}:{}", self.params.hostname, self.params.port)
    }

    async fn connect(&self) -> Result<PostgresStore, StoreError> {
        let store = PostgresStore::connect(self.params.clone()).await?;
        store.ensure_schema().await?;
        log::info!(target: "telemetryd::db", "Database ready!");
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_contains_all_parameters() {
        let params = DatabaseParameters {
            hostname: "db".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: "secret".to_string(),
            database: "telemetry".to_string(),
        };
        assert_eq!(
            params.connection_string(),
            "user=postgres password=secret host=db port=5432 dbname=telemetry application_name=telemetryd"
        );
    }

    #[test]
    fn statements_target_the_telemetry_table() {
        assert!(SQL_CREATE_TELEMETRY_LOGS.contains("CREATE TABLE IF NOT EXISTS \"TelemetryLogs\""));
        assert!(SQL_INSERT_READING.contains("RETURNING \"Id\""));
    }
}
