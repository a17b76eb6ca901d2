//! MongoDB-backed message store

use async_trait::async_trait;
use bson::{doc, Document};
use fp_config::MongoConfig;
use mongodb::{options::ClientOptions, Client, Collection};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use crate::{MessageStore, Result, StorageError};

pub struct MongoStore {
    /// Taken on close; the driver's shutdown consumes the client
    client: Mutex<Option<Client>>,
    database: mongodb::Database,
    collection: Collection<Document>,
}

impl MongoStore {
    /// Connect and verify reachability with a ping. Both steps are bounded by
    /// the configured timeouts; failure here is fatal to the caller.
    pub async fn connect(config: &MongoConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        options.connect_timeout = Some(config.connect_timeout());
        options.server_selection_timeout = Some(config.connect_timeout());
        options.app_name = Some("failover-pipeline".to_string());

        let client =
            Client::with_options(options).map_err(|e| StorageError::Connection(e.to_string()))?;
        let database = client.database(&config.database);
        let collection = database.collection::<Document>(&config.collection);

        let store = Self {
            client: Mutex::new(Some(client)),
            database,
            collection,
        };

        if !store.ping(config.connect_timeout()).await {
            return Err(StorageError::Connection(format!(
                "MongoDB at database '{}' did not answer ping",
                config.database
            )));
        }

        info!(database = %config.database, collection = %config.collection, "Connected to MongoDB");
        Ok(store)
    }
}

#[async_trait]
impl MessageStore for MongoStore {
    async fn insert_message(&self, message: &str) -> Result<()> {
        self.collection
            .insert_one(doc! {
                "message": message,
                "received_at": bson::DateTime::now(),
            })
            .await
            .map_err(|e| StorageError::Operation(e.to_string()))?;
        Ok(())
    }

    async fn count_messages(&self) -> Result<u64> {
        self.collection
            .count_documents(doc! {})
            .await
            .map_err(|e| StorageError::Operation(e.to_string()))
    }

    async fn ping(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.database.run_command(doc! { "ping": 1 })).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "MongoDB ping failed");
                false
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "MongoDB ping timed out");
                false
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let client = self.client.lock().take();
        if let Some(client) = client {
            info!("Closing MongoDB connection");
            client.shutdown().await;
            info!("MongoDB shutdown complete");
        }
        Ok(())
    }
}
