// ABOUTME: PostgreSQL backend: connector for one endpoint role and SQLSTATE error mapping
// ABOUTME: Replica sessions are opened read-only so stray writes fail at the server

pub mod connection;
pub mod privileges;

pub use connection::PgConnection;
pub use privileges::{check_table_privileges, describe_endpoint, TablePermissionCheck};

use async_trait::async_trait;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::config::SslMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};

use crate::config::{EndpointConfig, TlsMode};
use crate::routing::Role;
use crate::store::{Connector, StoreError};

/// Opens tokio-postgres connections to the endpoint configured for `role`.
pub struct PgConnector {
    role: Role,
    config: EndpointConfig,
}

impl PgConnector {
    pub fn new(role: Role, config: EndpointConfig) -> Self {
        Self { role, config }
    }

    fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg = self.config.to_pg_config();
        if self.config.tls == TlsMode::Require {
            pg.ssl_mode(SslMode::Require);
        }
        if self.role == Role::Replica {
            pg.options("-c default_transaction_read_only=on");
        }
        pg
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    fn endpoint(&self) -> String {
        self.config.label()
    }

    async fn connect(&self) -> Result<PgConnection, StoreError> {
        let client = connect(self.role, &self.pg_config(), self.config.tls).await?;
        Ok(PgConnection::new(client, self.role))
    }
}

/// Open one client and drive its connection on a background task.
pub async fn connect(
    role: Role,
    config: &tokio_postgres::Config,
    tls: TlsMode,
) -> Result<Client, StoreError> {
    let connect_err = |e: tokio_postgres::Error| StoreError::Connect(e.to_string());

    match tls {
        TlsMode::Disable => {
            let (client, connection) = config.connect(NoTls).await.map_err(connect_err)?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!("{} connection terminated: {}", role, e);
                }
            });
            Ok(client)
        }
        TlsMode::Require => {
            let connector = native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| StoreError::Connect(format!("TLS setup failed: {}", e)))?;
            let (client, connection) = config
                .connect(MakeTlsConnector::new(connector))
                .await
                .map_err(connect_err)?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!("{} connection terminated: {}", role, e);
                }
            });
            Ok(client)
        }
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            return StoreError::Connection(err.to_string());
        }
        if let Some(db) = err.as_db_error() {
            let code = db.code();
            if code == &SqlState::READ_ONLY_SQL_TRANSACTION {
                return StoreError::ReadOnly;
            }
            if is_connection_class(code.code()) {
                return StoreError::Connection(db.message().to_string());
            }
            if code.code().starts_with("23") {
                return StoreError::Constraint {
                    constraint: db.constraint().unwrap_or(code.code()).to_string(),
                    message: db.message().to_string(),
                };
            }
            return StoreError::Query(db.message().to_string());
        }
        let io_failure = std::error::Error::source(&err)
            .map_or(false, |source| source.downcast_ref::<std::io::Error>().is_some());
        if io_failure {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Query(err.to_string())
        }
    }
}

/// Class 08 (connection exception) and class 57P (operator intervention:
/// admin shutdown, crash shutdown, cannot connect now).
fn is_connection_class(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("57P")
}
