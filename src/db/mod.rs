use anyhow::{Context, Result};
use mongodb::{Client, bson::doc, options::ClientOptions};
use std::future::Future;
use std::time::Duration;
use surrealdb::{Surreal, engine::any, engine::any::Any, opt::auth::Root};
use tracing::{debug, instrument};

/// A datastore client able to open and release a single connection
pub trait Datastore: Send + Sync + 'static {
    /// The handle held while the link is established
    type Connection: Send + 'static;

    /// Open a new connection to the datastore at `uri`
    fn connect(&self, uri: &str) -> impl Future<Output = Result<Self::Connection>> + Send;

    /// Release a previously opened connection
    fn close(&self, connection: Self::Connection) -> impl Future<Output = Result<()>> + Send;
}

/// Datastore backed by the SurrealDB `any` engine
#[derive(Clone, Debug, Default)]
pub struct SurrealStore {
    /// The namespace to select once connected
    pub namespace: Option<String>,
    /// The database to select once connected
    pub database: Option<String>,
    /// The root username to sign in with
    pub username: Option<String>,
    /// The root password to sign in with
    pub password: Option<String>,
}

impl Datastore for SurrealStore {
    type Connection = Surreal<Any>;

    #[instrument(skip_all, fields(uri = %uri))]
    async fn connect(&self, uri: &str) -> Result<Surreal<Any>> {
        // Open a client using the engine selected by the URI scheme
        let client = any::connect(uri)
            .await
            .context("Failed to open database client")?;
        // Authenticate as a root user when credentials are configured
        if let (Some(username), Some(password)) = (self.username.as_deref(), self.password.as_deref())
        {
            client
                .signin(Root { username, password })
                .await
                .context("Failed to authenticate with the database")?;
            debug!(username, "Authenticated with the database");
        }
        // Select the namespace and database to use
        match (self.namespace.as_deref(), self.database.as_deref()) {
            (Some(ns), Some(db)) => client.use_ns(ns).use_db(db).await?,
            (Some(ns), None) => client.use_ns(ns).await?,
            (None, Some(db)) => client.use_db(db).await?,
            (None, None) => debug!("No namespace or database selected"),
        }
        Ok(client)
    }

    async fn close(&self, connection: Surreal<Any>) -> Result<()> {
        // The engine shuts its router down once the last handle is dropped
        drop(connection);
        debug!("Released database client handle");
        Ok(())
    }
}

/// Datastore backed by a MongoDB deployment
#[derive(Clone, Debug, Default)]
pub struct MongoStore {
    /// How long the driver looks for a usable server, unless the URI sets it
    pub server_selection_timeout: Option<Duration>,
}

impl Datastore for MongoStore {
    type Connection = Client;

    #[instrument(skip_all, fields(uri = %uri))]
    async fn connect(&self, uri: &str) -> Result<Client> {
        let mut options = ClientOptions::parse(uri)
            .await
            .context("Failed to parse the MongoDB connection string")?;
        if options.server_selection_timeout.is_none() {
            options.server_selection_timeout = self.server_selection_timeout;
        }
        let client =
            Client::with_options(options).context("Failed to create the MongoDB client")?;
        // The driver connects lazily, so a ping confirms the link
        let database = client
            .default_database()
            .unwrap_or_else(|| client.database("admin"));
        database
            .run_command(doc! { "ping": 1 })
            .await
            .context("Failed to ping the MongoDB server")?;
        debug!(database = database.name(), "MongoDB server answered ping");
        Ok(client)
    }

    async fn close(&self, connection: Client) -> Result<()> {
        connection.shutdown().await;
        debug!("Closed MongoDB client");
        Ok(())
    }
}

/// Whether `uri` names a MongoDB deployment
pub fn is_mongodb_uri(uri: &str) -> bool {
    uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://")
}

/// Datastore choosing its client from the URI scheme.
///
/// `mongodb://` and `mongodb+srv://` go to MongoDB; every other scheme
/// (`ws://`, `http://`, `mem://`, ...) goes to the SurrealDB `any` engine.
#[derive(Clone, Debug, Default)]
pub struct AnyStore {
    pub mongo: MongoStore,
    pub surreal: SurrealStore,
}

/// A connection opened by [`AnyStore`]
pub enum AnyConnection {
    Mongo(Client),
    Surreal(Surreal<Any>),
}

impl Datastore for AnyStore {
    type Connection = AnyConnection;

    async fn connect(&self, uri: &str) -> Result<AnyConnection> {
        if is_mongodb_uri(uri) {
            Ok(AnyConnection::Mongo(self.mongo.connect(uri).await?))
        } else {
            Ok(AnyConnection::Surreal(self.surreal.connect(uri).await?))
        }
    }

    async fn close(&self, connection: AnyConnection) -> Result<()> {
        match connection {
            AnyConnection::Mongo(client) => self.mongo.close(client).await,
            AnyConnection::Surreal(client) => self.surreal.close(client).await,
        }
    }
}
