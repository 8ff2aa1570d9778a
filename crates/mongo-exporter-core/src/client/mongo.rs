//! [`DiagnosticClient`] backed by the official driver's blocking API.

use std::path::PathBuf;
use std::time::Duration;

use mongodb::bson::{Bson, Document, doc};
use mongodb::error::{Error as DriverError, ErrorKind};
use mongodb::options::{ClientOptions, Credential, Tls, TlsOptions};
use mongodb::sync::Client;
use tracing::{debug, info};

use super::{ClientError, DiagnosticClient, FindOptions};
use crate::document::{documents, get_array, get_doc, get_i64, get_str};

/// Server error code for `maxTimeMS` expiry.
const MAX_TIME_MS_EXPIRED: i32 = 50;

const LIST_BATCH_SIZE: i32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMechanism {
    ScramSha1,
    #[default]
    ScramSha256,
    X509,
    Plain,
}

impl AuthMechanism {
    /// Parses the wire name (`SCRAM-SHA-1`, `SCRAM-SHA-256`, `MONGODB-X509`,
    /// `PLAIN`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "SCRAM-SHA-1" => Some(AuthMechanism::ScramSha1),
            "SCRAM-SHA-256" => Some(AuthMechanism::ScramSha256),
            "MONGODB-X509" => Some(AuthMechanism::X509),
            "PLAIN" => Some(AuthMechanism::Plain),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => "SCRAM-SHA-1",
            AuthMechanism::ScramSha256 => "SCRAM-SHA-256",
            AuthMechanism::X509 => "MONGODB-X509",
            AuthMechanism::Plain => "PLAIN",
        }
    }

    fn to_driver(self) -> mongodb::options::AuthMechanism {
        match self {
            AuthMechanism::ScramSha1 => mongodb::options::AuthMechanism::ScramSha1,
            AuthMechanism::ScramSha256 => mongodb::options::AuthMechanism::ScramSha256,
            AuthMechanism::X509 => mongodb::options::AuthMechanism::MongoDbX509,
            AuthMechanism::Plain => mongodb::options::AuthMechanism::Plain,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsSettings {
    pub allow_invalid_certificates: bool,
    pub ca_file: Option<PathBuf>,
    /// PEM file holding the client certificate.
    pub cert_file: Option<PathBuf>,
    /// PEM file holding the client key; must be the certificate file itself
    /// when both are set, the driver reads them from one file.
    pub key_file: Option<PathBuf>,
}

impl TlsSettings {
    fn to_driver(&self) -> Result<Tls, ClientError> {
        let cert_key = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) if cert != key => {
                return Err(ClientError::Connection(format!(
                    "client certificate {} and key {} must be one PEM file",
                    cert.display(),
                    key.display()
                )));
            }
            (Some(cert), _) => Some(cert.clone()),
            (None, key) => key.clone(),
        };
        let options = TlsOptions::builder()
            .allow_invalid_certificates(self.allow_invalid_certificates)
            .ca_file_path(self.ca_file.clone())
            .cert_key_file_path(cert_key)
            .build();
        Ok(Tls::Enabled(options))
    }
}

/// Everything needed to open the upstream connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub uri: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_source: String,
    pub auth_mechanism: AuthMechanism,
    pub tls: Option<TlsSettings>,
    pub connect_timeout: Duration,
    pub server_selection_timeout: Duration,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub max_idle_time: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "admin".to_string(),
            username: None,
            password: None,
            auth_source: "admin".to_string(),
            auth_mechanism: AuthMechanism::ScramSha256,
            tls: None,
            connect_timeout: Duration::from_secs(10),
            server_selection_timeout: Duration::from_secs(30),
            max_pool_size: 100,
            min_pool_size: 5,
            max_idle_time: Duration::from_secs(30 * 60),
        }
    }
}

impl ConnectionSettings {
    fn client_options(&self) -> Result<ClientOptions, ClientError> {
        let mut options = ClientOptions::parse(&self.uri)
            .run()
            .map_err(|e| ClientError::Connection(format!("invalid URI: {}", e)))?;

        options.app_name = Some(format!("mongo-exporter/{}", env!("CARGO_PKG_VERSION")));
        options.connect_timeout = Some(self.connect_timeout);
        options.server_selection_timeout = Some(self.server_selection_timeout);
        options.max_pool_size = Some(self.max_pool_size);
        options.min_pool_size = Some(self.min_pool_size);
        options.max_idle_time = Some(self.max_idle_time);

        let username = self.username.as_deref().unwrap_or_default();
        let password = self.password.as_deref().unwrap_or_default();
        if !username.is_empty() && !password.is_empty() {
            options.credential = Some(
                Credential::builder()
                    .username(username.to_string())
                    .password(password.to_string())
                    .source(self.auth_source.clone())
                    .mechanism(self.auth_mechanism.to_driver())
                    .build(),
            );
        }

        if let Some(tls) = &self.tls {
            options.tls = Some(tls.to_driver()?);
        }
        Ok(options)
    }
}

/// Production client.
///
/// The driver handle is internally pooled and safe to share; clones of
/// `MongoClient` share the same pool.
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    database: String,
}

impl MongoClient {
    /// Opens the pool and pings the server once.
    pub fn connect(settings: &ConnectionSettings) -> Result<Self, ClientError> {
        let options = settings.client_options()?;
        let client = Client::with_options(options).map_err(map_error)?;
        let this = Self {
            client,
            database: settings.database.clone(),
        };
        this.ping(settings.connect_timeout)?;
        info!(
            database = %settings.database,
            tls = settings.tls.is_some(),
            "connected to MongoDB"
        );
        Ok(this)
    }
}

impl DiagnosticClient for MongoClient {
    fn run_command(
        &self,
        database: &str,
        mut command: Document,
        timeout: Duration,
    ) -> Result<Document, ClientError> {
        command.insert("maxTimeMS", max_time_ms(timeout));
        self.client
            .database(database)
            .run_command(command)
            .run()
            .map_err(map_error)
    }

    fn list_database_names(&self, timeout: Duration) -> Result<Vec<String>, ClientError> {
        let reply = self.run_command(
            "admin",
            doc! { "listDatabases": 1, "nameOnly": true },
            timeout,
        )?;
        Ok(get_array(&reply, &["databases"])
            .map(|dbs| {
                documents(dbs)
                    .filter_map(|d| get_str(d, &["name"]))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_collection_names(
        &self,
        database: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, ClientError> {
        let reply = self.run_command(
            database,
            doc! {
                "listCollections": 1,
                "nameOnly": true,
                "authorizedCollections": true,
                "cursor": { "batchSize": LIST_BATCH_SIZE },
            },
            timeout,
        )?;
        drain_names(reply, |cursor_id, collection| {
            self.run_command(
                database,
                doc! {
                    "getMore": cursor_id,
                    "collection": collection,
                    "batchSize": LIST_BATCH_SIZE,
                },
                timeout,
            )
        })
    }

    fn find(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
        options: FindOptions,
        timeout: Duration,
    ) -> Result<Vec<Document>, ClientError> {
        let coll = self
            .client
            .database(database)
            .collection::<Document>(collection);
        let mut action = coll.find(filter).max_time(timeout);
        if let Some(sort) = options.sort {
            action = action.sort(sort);
        }
        if let Some(limit) = options.limit {
            action = action.limit(limit);
        }
        let cursor = action.run().map_err(map_error)?;
        cursor.map(|r| r.map_err(map_error)).collect()
    }

    fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: Vec<Document>,
        timeout: Duration,
    ) -> Result<Vec<Document>, ClientError> {
        let cursor = self
            .client
            .database(database)
            .collection::<Document>(collection)
            .aggregate(pipeline)
            .max_time(timeout)
            .run()
            .map_err(map_error)?;
        cursor.map(|r| r.map_err(map_error)).collect()
    }

    fn ping(&self, timeout: Duration) -> Result<(), ClientError> {
        let database = self.database.clone();
        self.run_command(&database, doc! { "ping": 1 }, timeout)
            .map(|_| ())
    }
}

/// Collects `name` from every batch of a command cursor, issuing `getMore`
/// until the server reports cursor id 0.
///
/// `get_more` receives the cursor id and the collection part of the
/// cursor namespace (`$cmd.listCollections` for `listCollections`).
fn drain_names<F>(first: Document, mut get_more: F) -> Result<Vec<String>, ClientError>
where
    F: FnMut(i64, &str) -> Result<Document, ClientError>,
{
    let mut names = Vec::new();
    let mut reply = first;
    let mut batch_key = "firstBatch";
    loop {
        let Some(cursor) = get_doc(&reply, &["cursor"]) else {
            return Ok(names);
        };
        if let Some(batch) = get_array(cursor, &[batch_key]) {
            names.extend(
                documents(batch)
                    .filter_map(|d| get_str(d, &["name"]))
                    .map(str::to_string),
            );
        }
        let cursor_id = get_i64(cursor, &["id"]).unwrap_or(0);
        if cursor_id == 0 {
            return Ok(names);
        }
        let collection = get_str(cursor, &["ns"])
            .and_then(|ns| ns.split_once('.'))
            .map(|(_, coll)| coll.to_string())
            .ok_or_else(|| ClientError::command("cursor reply without namespace"))?;
        reply = get_more(cursor_id, &collection)?;
        batch_key = "nextBatch";
    }
}

fn max_time_ms(timeout: Duration) -> Bson {
    Bson::Int64(timeout.as_millis().min(i64::MAX as u128) as i64)
}

fn map_error(err: DriverError) -> ClientError {
    let mapped = match err.kind.as_ref() {
        ErrorKind::Command(cmd) if cmd.code == MAX_TIME_MS_EXPIRED => {
            ClientError::Timeout(cmd.message.clone())
        }
        ErrorKind::Command(cmd) => ClientError::Command {
            code: Some(cmd.code),
            message: cmd.message.clone(),
        },
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Authentication { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. } => ClientError::Connection(err.to_string()),
        _ => ClientError::command(err.to_string()),
    };
    debug!(error = %mapped, "driver error");
    mapped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_mechanism_names() {
        assert_eq!(
            AuthMechanism::from_name("scram-sha-1"),
            Some(AuthMechanism::ScramSha1)
        );
        assert_eq!(
            AuthMechanism::from_name("MONGODB-X509"),
            Some(AuthMechanism::X509)
        );
        assert_eq!(AuthMechanism::from_name("GSSAPI"), None);
        assert_eq!(AuthMechanism::default().as_str(), "SCRAM-SHA-256");
    }

    #[test]
    fn test_separate_key_file_is_rejected() {
        let tls = TlsSettings {
            cert_file: Some("/tmp/cert.pem".into()),
            key_file: Some("/tmp/key.pem".into()),
            ..TlsSettings::default()
        };
        assert!(matches!(tls.to_driver(), Err(ClientError::Connection(_))));

        let bundled = TlsSettings {
            cert_file: Some("/tmp/client.pem".into()),
            key_file: Some("/tmp/client.pem".into()),
            ..TlsSettings::default()
        };
        assert!(bundled.to_driver().is_ok());
    }

    #[test]
    fn test_client_options_from_settings() {
        let settings = ConnectionSettings {
            username: Some("exporter".into()),
            password: Some("secret".into()),
            max_pool_size: 20,
            ..ConnectionSettings::default()
        };
        let options = settings.client_options().unwrap();
        assert_eq!(options.max_pool_size, Some(20));
        assert_eq!(options.min_pool_size, Some(5));
        let credential = options.credential.unwrap();
        assert_eq!(credential.username.as_deref(), Some("exporter"));
        assert_eq!(credential.source.as_deref(), Some("admin"));
    }

    #[test]
    fn test_credential_requires_username_and_password() {
        let settings = ConnectionSettings {
            username: Some("exporter".into()),
            ..ConnectionSettings::default()
        };
        assert!(settings.client_options().unwrap().credential.is_none());
    }

    fn name_batch(names: &[&str]) -> Vec<Bson> {
        names
            .iter()
            .map(|n| Bson::Document(doc! { "name": *n, "type": "collection" }))
            .collect()
    }

    #[test]
    fn test_collection_names_follow_get_more() {
        let first = doc! {
            "cursor": {
                "id": 42_i64,
                "ns": "shop.$cmd.listCollections",
                "firstBatch": name_batch(&["orders", "users"]),
            },
            "ok": 1.0,
        };
        let mut calls = Vec::new();
        let names = drain_names(first, |id, collection| {
            calls.push((id, collection.to_string()));
            Ok(doc! {
                "cursor": {
                    "id": 0_i64,
                    "ns": "shop.$cmd.listCollections",
                    "nextBatch": name_batch(&["events"]),
                },
                "ok": 1.0,
            })
        })
        .unwrap();

        assert_eq!(names, vec!["orders", "users", "events"]);
        assert_eq!(calls, vec![(42, "$cmd.listCollections".to_string())]);
    }

    #[test]
    fn test_collection_names_single_batch() {
        let first = doc! {
            "cursor": { "id": 0, "ns": "shop.$cmd.listCollections", "firstBatch": name_batch(&["orders"]) },
        };
        let names = drain_names(first, |_, _| panic!("no getMore for an exhausted cursor")).unwrap();
        assert_eq!(names, vec!["orders"]);
    }

    #[test]
    fn test_collection_names_get_more_error() {
        let first = doc! {
            "cursor": { "id": 7_i64, "ns": "shop.$cmd.listCollections", "firstBatch": name_batch(&["a"]) },
        };
        let result = drain_names(first, |_, _| Err(ClientError::Timeout("operation exceeded time limit".into())));
        assert!(matches!(result, Err(ClientError::Timeout(_))));
    }

    #[test]
    fn test_max_time_ms() {
        assert_eq!(max_time_ms(Duration::from_secs(10)), Bson::Int64(10_000));
    }
}
