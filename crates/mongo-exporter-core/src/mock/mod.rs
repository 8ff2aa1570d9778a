//! In-memory [`DiagnosticClient`] for testing collectors without a server.
//!
//! `MockClient` answers commands from a table of scripted replies keyed by
//! database and command name (optionally narrowed by the command's target
//! collection), serves `find`/`aggregate` results per namespace and records
//! every call so tests can assert on what a collector asked for.
//!
//! Ready-made deployments live in [`scenarios`].

mod scenarios;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use mongodb::bson::{Bson, Document};

use crate::client::{ClientError, DiagnosticClient, FindOptions};

/// Server error code for an unknown command.
const COMMAND_NOT_FOUND: i32 = 59;

/// Database wildcard for replies that apply to every database.
const ANY_DATABASE: &str = "*";

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Command {
        database: String,
        name: String,
    },
    ListDatabases,
    ListCollections {
        database: String,
    },
    Find {
        database: String,
        collection: String,
        filter: Document,
        options: FindOptions,
    },
    Aggregate {
        database: String,
        collection: String,
        pipeline: Vec<Document>,
    },
    Ping,
}

type CommandKey = (String, String, Option<String>);

/// Scripted upstream server.
#[derive(Debug, Default)]
pub struct MockClient {
    commands: HashMap<CommandKey, Result<Document, ClientError>>,
    /// Database name to its collections, in listing order.
    databases: BTreeMap<String, Vec<String>>,
    finds: HashMap<(String, String), Result<Vec<Document>, ClientError>>,
    aggregates: HashMap<(String, String), Result<Vec<Document>, ClientError>>,
    list_error: Option<ClientError>,
    ping_error: Option<ClientError>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the reply to command `name` on `database`.
    ///
    /// Use `"*"` as the database to answer on every database.
    pub fn add_command(&mut self, database: &str, name: &str, reply: Document) {
        self.commands
            .insert((database.into(), name.into(), None), Ok(reply));
    }

    /// Scripts the reply to command `name` whose value is `target`
    /// (`{collStats: "orders"}`); takes precedence over [`add_command`](Self::add_command).
    pub fn add_targeted_command(&mut self, database: &str, name: &str, target: &str, reply: Document) {
        self.commands.insert(
            (database.into(), name.into(), Some(target.into())),
            Ok(reply),
        );
    }

    /// Makes command `name` on `database` fail with `error`.
    pub fn fail_command(&mut self, database: &str, name: &str, error: ClientError) {
        self.commands
            .insert((database.into(), name.into(), None), Err(error));
    }

    pub fn fail_targeted_command(
        &mut self,
        database: &str,
        name: &str,
        target: &str,
        error: ClientError,
    ) {
        self.commands.insert(
            (database.into(), name.into(), Some(target.into())),
            Err(error),
        );
    }

    /// Adds a database without collections.
    pub fn add_database(&mut self, database: &str) {
        self.databases.entry(database.into()).or_default();
    }

    /// Adds a collection; its database is created on demand.
    pub fn add_collection(&mut self, database: &str, collection: &str) {
        let collections = self.databases.entry(database.into()).or_default();
        if !collections.iter().any(|c| c == collection) {
            collections.push(collection.into());
        }
    }

    /// Documents served by `find` on `database.collection`.
    pub fn add_find(&mut self, database: &str, collection: &str, documents: Vec<Document>) {
        self.finds
            .insert((database.into(), collection.into()), Ok(documents));
    }

    pub fn fail_find(&mut self, database: &str, collection: &str, error: ClientError) {
        self.finds
            .insert((database.into(), collection.into()), Err(error));
    }

    /// Documents served by `aggregate` on `database.collection`, whatever the
    /// pipeline.
    pub fn add_aggregate(&mut self, database: &str, collection: &str, documents: Vec<Document>) {
        self.aggregates
            .insert((database.into(), collection.into()), Ok(documents));
    }

    pub fn fail_aggregate(&mut self, database: &str, collection: &str, error: ClientError) {
        self.aggregates
            .insert((database.into(), collection.into()), Err(error));
    }

    /// Makes database and collection listings fail.
    pub fn fail_listings(&mut self, error: ClientError) {
        self.list_error = Some(error);
    }

    pub fn fail_ping(&mut self, error: ClientError) {
        self.ping_error = Some(error);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Names of the commands issued so far, in order.
    pub fn command_names(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Command { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn lookup_command(
        &self,
        database: &str,
        name: &str,
        target: Option<String>,
    ) -> Option<&Result<Document, ClientError>> {
        let targeted = target.and_then(|t| {
            self.commands
                .get(&(database.to_string(), name.to_string(), Some(t.clone())))
                .or_else(|| {
                    self.commands
                        .get(&(ANY_DATABASE.to_string(), name.to_string(), Some(t)))
                })
        });
        targeted
            .or_else(|| {
                self.commands
                    .get(&(database.to_string(), name.to_string(), None))
            })
            .or_else(|| {
                self.commands
                    .get(&(ANY_DATABASE.to_string(), name.to_string(), None))
            })
    }
}

/// Equality match on the scalar top-level fields of `filter`; operator
/// expressions and nested documents match everything.
fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| match expected {
        Bson::Document(_) => true,
        _ => doc.get(key) == Some(expected),
    })
}

impl DiagnosticClient for MockClient {
    fn run_command(
        &self,
        database: &str,
        command: Document,
        _timeout: Duration,
    ) -> Result<Document, ClientError> {
        let (name, target) = match command.iter().next() {
            Some((name, Bson::String(target))) => (name.clone(), Some(target.clone())),
            Some((name, _)) => (name.clone(), None),
            None => return Err(ClientError::command("empty command")),
        };
        self.record(MockCall::Command {
            database: database.to_string(),
            name: name.clone(),
        });
        match self.lookup_command(database, &name, target) {
            Some(reply) => reply.clone(),
            None => Err(ClientError::Command {
                code: Some(COMMAND_NOT_FOUND),
                message: format!("no such command: '{}'", name),
            }),
        }
    }

    fn list_database_names(&self, _timeout: Duration) -> Result<Vec<String>, ClientError> {
        self.record(MockCall::ListDatabases);
        if let Some(err) = &self.list_error {
            return Err(err.clone());
        }
        Ok(self.databases.keys().cloned().collect())
    }

    fn list_collection_names(
        &self,
        database: &str,
        _timeout: Duration,
    ) -> Result<Vec<String>, ClientError> {
        self.record(MockCall::ListCollections {
            database: database.to_string(),
        });
        if let Some(err) = &self.list_error {
            return Err(err.clone());
        }
        Ok(self.databases.get(database).cloned().unwrap_or_default())
    }

    fn find(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
        options: FindOptions,
        _timeout: Duration,
    ) -> Result<Vec<Document>, ClientError> {
        let limit = options.limit;
        self.record(MockCall::Find {
            database: database.to_string(),
            collection: collection.to_string(),
            filter: filter.clone(),
            options,
        });
        let documents = match self
            .finds
            .get(&(database.to_string(), collection.to_string()))
        {
            Some(Ok(docs)) => docs,
            Some(Err(err)) => return Err(err.clone()),
            None => return Ok(Vec::new()),
        };
        let matched = documents.iter().filter(|d| matches_filter(d, &filter)).cloned();
        Ok(match limit {
            Some(n) if n > 0 => matched.take(n as usize).collect(),
            _ => matched.collect(),
        })
    }

    fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: Vec<Document>,
        _timeout: Duration,
    ) -> Result<Vec<Document>, ClientError> {
        self.record(MockCall::Aggregate {
            database: database.to_string(),
            collection: collection.to_string(),
            pipeline,
        });
        match self
            .aggregates
            .get(&(database.to_string(), collection.to_string()))
        {
            Some(result) => result.clone(),
            None => Ok(Vec::new()),
        }
    }

    fn ping(&self, _timeout: Duration) -> Result<(), ClientError> {
        self.record(MockCall::Ping);
        match &self.ping_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    const T: Duration = Duration::from_secs(1);

    #[test]
    fn test_command_lookup_precedence() {
        let mut mock = MockClient::new();
        mock.add_command("*", "collStats", doc! { "size": 1 });
        mock.add_command("shop", "collStats", doc! { "size": 2 });
        mock.add_targeted_command("shop", "collStats", "orders", doc! { "size": 3 });

        let reply = mock
            .run_command("shop", doc! { "collStats": "orders" }, T)
            .unwrap();
        assert_eq!(reply.get_i32("size").unwrap(), 3);
        let reply = mock
            .run_command("shop", doc! { "collStats": "users" }, T)
            .unwrap();
        assert_eq!(reply.get_i32("size").unwrap(), 2);
        let reply = mock
            .run_command("blog", doc! { "collStats": "posts" }, T)
            .unwrap();
        assert_eq!(reply.get_i32("size").unwrap(), 1);
    }

    #[test]
    fn test_unknown_command_fails() {
        let mock = MockClient::new();
        let err = mock
            .run_command("admin", doc! { "serverStatus": 1 }, T)
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Command {
                code: Some(COMMAND_NOT_FOUND),
                ..
            }
        ));
        assert_eq!(mock.command_names(), vec!["serverStatus".to_string()]);
    }

    #[test]
    fn test_listings() {
        let mut mock = MockClient::new();
        mock.add_collection("shop", "orders");
        mock.add_collection("shop", "orders");
        mock.add_database("admin");
        assert_eq!(
            mock.list_database_names(T).unwrap(),
            vec!["admin".to_string(), "shop".to_string()]
        );
        assert_eq!(
            mock.list_collection_names("shop", T).unwrap(),
            vec!["orders".to_string()]
        );
        assert!(mock.list_collection_names("nope", T).unwrap().is_empty());
    }

    #[test]
    fn test_find_filters_and_limits() {
        let mut mock = MockClient::new();
        mock.add_find(
            "config",
            "databases",
            vec![
                doc! { "_id": "a", "primary": "shard0" },
                doc! { "_id": "b", "primary": "shard1" },
                doc! { "_id": "c", "primary": "shard0" },
            ],
        );
        let found = mock
            .find(
                "config",
                "databases",
                doc! { "primary": "shard0" },
                FindOptions::default(),
                T,
            )
            .unwrap();
        assert_eq!(found.len(), 2);

        let limited = mock
            .find(
                "config",
                "databases",
                doc! { "ts": { "$gte": 1 } },
                FindOptions {
                    limit: Some(1),
                    ..FindOptions::default()
                },
                T,
            )
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(mock.calls().len(), 2);
    }
}
