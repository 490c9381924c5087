use async_trait::async_trait;
use tiberius::error::Error;
use tiberius::{Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::MssqlConnection;
use super::error::map_error;
use crate::backend::{ConnectionFactory, DbConnection};
use crate::error::SprocError;

/// Tiberius client over a Tokio TCP stream.
pub type MssqlClient = Client<Compat<TcpStream>>;

/// Open a client from an ADO.NET style connection string
/// (`server=tcp:host,1433;database=..;user id=..;password=..;TrustServerCertificate=true`).
///
/// An Azure SQL gateway may answer the login with a redirect; it is followed once.
///
/// # Errors
/// `SprocError::Configuration` for a malformed string, `SprocError::Connectivity` when the
/// TCP connect or the login handshake fails.
pub async fn connect(connection_string: &str) -> Result<MssqlClient, SprocError> {
    let mut config = Config::from_ado_string(connection_string)
        .map_err(|e| SprocError::Configuration(format!("invalid SQL Server connection string: {e}")))?;

    match open(&config).await {
        Err(Error::Routing { host, port }) => {
            tracing::debug!(%host, port, "following SQL Server routing redirect");
            config.host(&host);
            config.port(port);
            open(&config).await.map_err(login_error)
        }
        other => other.map_err(login_error),
    }
}

async fn open(config: &Config) -> Result<MssqlClient, Error> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;
    Client::connect(config.clone(), tcp.compat_write()).await
}

fn login_error(err: Error) -> SprocError {
    match map_error(err) {
        SprocError::Database(db) => {
            SprocError::Connectivity(format!("SQL Server login failed: {}", db.message))
        }
        other => other,
    }
}

/// [`ConnectionFactory`] producing [`MssqlConnection`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MssqlConnectionFactory;

#[async_trait]
impl ConnectionFactory for MssqlConnectionFactory {
    async fn connect(&self, connection_string: &str) -> Result<Box<dyn DbConnection>, SprocError> {
        let client = connect(connection_string).await?;
        Ok(Box::new(MssqlConnection::new(client)))
    }
}
