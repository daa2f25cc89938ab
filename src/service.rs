use std::time::Duration;

use futures_util::{stream::BoxStream, StreamExt};
use sqlx::{
    query::Query,
    sqlite::{SqliteArguments, SqliteRow},
    Execute as _, FromRow, Sqlite, Transaction,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    consumer::{consume, Batch, Handler},
    error::Error,
    message::{unix_now, Message, MessageState},
    registry::Registry,
    store::Store,
    table::{Schema, Table},
};

/// Statements whose text depends only on the table name.
#[derive(Clone, Debug)]
struct Statements {
    insert: String,
    select_pending: String,
    commit: String,
    record_attempt: String,
}

impl Statements {
    fn new(table: &Table) -> Self {
        let table = table.quoted();
        Self {
            insert: format!(
                "
                INSERT INTO {table} (message_id, create_time, update_time, delete_time, try_times, state)
                VALUES ($1, $2, $2, 0, 0, $3)
                "
            ),
            select_pending: format!(
                "
                SELECT * FROM {table}
                WHERE state = $1
                ORDER BY create_time, message_id
                LIMIT $2
                "
            ),
            // Timestamps only move on the first retirement so a repeated commit
            // leaves the row untouched.
            commit: format!(
                "
                UPDATE {table}
                SET state = $1,
                    update_time = CASE WHEN state = $1 THEN update_time ELSE $2 END,
                    delete_time = CASE WHEN state = $1 THEN delete_time ELSE $2 END
                WHERE message_id = $3
                "
            ),
            record_attempt: format!(
                "
                UPDATE {table}
                SET try_times = try_times + 1, update_time = $1
                WHERE message_id = $2 AND state = $3
                "
            ),
        }
    }
}

/// A transactional outbox stored in one table.
///
/// Producers publish inside their own business transaction; consumers poll
/// pending messages and retire each one inside the transaction that carries its
/// downstream effect.
#[derive(Clone, Debug)]
pub struct Outbox {
    store: Store,
    table: Table,
    statements: Statements,
}

impl Outbox {
    /// # Errors
    /// Returns [`Error::Configuration`] if `table` is not a valid table name.
    pub fn new(store: Store, table: impl Into<String>) -> Result<Self, Error> {
        Ok(Self::with_table(store, Table::new(table)?))
    }

    pub fn with_table(store: Store, table: Table) -> Self {
        let statements = Statements::new(&table);
        Self {
            store,
            table,
            statements,
        }
    }

    /// Opens the outbox described by `config`, sharing the registry's store.
    pub async fn open(registry: &Registry, config: &Config) -> Result<Self, Error> {
        let store = registry.get(config).await?;
        Self::new(store, config.table())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// The base schema for this outbox's table, to extend with payload columns.
    pub fn schema(&self) -> Schema {
        Schema::new(self.table.clone())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, Error> {
        self.store.begin().await
    }

    /// Runs each DDL statement in order, stopping at the first failure.
    ///
    /// Statements run outside of any transaction and are not inspected. Nothing
    /// guards against several processes initializing at once.
    pub async fn initialize<S: AsRef<str>>(&self, statements: &[S]) -> Result<(), Error> {
        let mut conn = self.store.acquire().await?;

        for statement in statements {
            let statement = statement.as_ref();
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| Error::from_store(statement, e))?;
        }

        tracing::debug!(
            table = %self.table,
            statements = statements.len(),
            "Initialized outbox table"
        );

        Ok(())
    }

    /// Like [`Outbox::initialize`], retrying every `backoff` until it succeeds.
    pub async fn initialize_with_retry<S: AsRef<str>>(
        &self,
        statements: &[S],
        backoff: Duration,
    ) -> Result<(), Error> {
        let mut attempt: u32 = 1;
        loop {
            match self.initialize(statements).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        "Failed to initialize outbox table {}: {e}",
                        self.table
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Drops and recreates the table described by `schema`, discarding every message.
    pub async fn reset(&self, schema: &Schema) -> Result<(), Error> {
        if schema.table() != &self.table {
            return Err(Error::configuration(format!(
                "schema is for table {}, outbox uses {}",
                schema.table(),
                self.table
            )));
        }

        tracing::info!(table = %self.table, "Resetting outbox table");

        self.initialize(&schema.reset_statements()).await
    }

    /// Executes a write statement inside the caller's transaction.
    ///
    /// The transaction is neither committed nor rolled back here: the message
    /// exists only if the caller commits `tx`.
    pub async fn publish<'q>(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<(), Error> {
        let sql = query.sql();

        query
            .execute(tx.as_mut())
            .await
            .map_err(|e| Error::from_store(sql, e))?;

        tracing::debug!(table = %self.table, "Published message");

        Ok(())
    }

    /// Publishes a message carrying no extension columns.
    ///
    /// Extension columns of the table must all have defaults.
    pub async fn publish_message(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        message_id: &str,
    ) -> Result<(), Error> {
        let query = sqlx::query(&self.statements.insert)
            .bind(message_id)
            .bind(unix_now())
            .bind(MessageState::Created);

        self.publish(tx, query).await
    }

    /// Runs a read query outside of any transaction, decoding rows lazily.
    ///
    /// Decoding failures are yielded as [`Error::Scan`] for the offending row
    /// and do not end the stream.
    pub fn poll<'e, 'q, T, D>(
        &'e self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        mut decode: D,
    ) -> BoxStream<'e, Result<T, Error>>
    where
        'q: 'e,
        T: Send + 'e,
        D: FnMut(SqliteRow) -> Result<T, sqlx::Error> + Send + 'e,
    {
        let sql = query.sql();

        query
            .fetch(self.store.pool())
            .map(move |row| match row {
                Ok(row) => decode(row).map_err(Error::scan),
                Err(e) => Err(Error::from_store(sql, e)),
            })
            .boxed()
    }

    pub fn poll_as<'e, 'q, T>(
        &'e self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> BoxStream<'e, Result<T, Error>>
    where
        'q: 'e,
        T: for<'r> FromRow<'r, SqliteRow> + Send + 'e,
    {
        self.poll(query, |row| T::from_row(&row))
    }

    /// Up to `limit` messages still in `Created` state, oldest first.
    pub fn pending<'e, T>(&'e self, limit: u32) -> BoxStream<'e, Result<T, Error>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + 'e,
    {
        let query = sqlx::query(&self.statements.select_pending)
            .bind(MessageState::Created)
            .bind(limit);

        self.poll_as(query)
    }

    /// Retires a message inside the caller's transaction.
    ///
    /// Unconditional on the current state: committing an already retired or
    /// unknown message is a no-op.
    pub async fn commit(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        message_id: &str,
    ) -> Result<(), Error> {
        let result = sqlx::query(&self.statements.commit)
            .bind(MessageState::Deleted)
            .bind(unix_now())
            .bind(message_id)
            .execute(tx.as_mut())
            .await
            .map_err(|e| Error::from_store(self.statements.commit.as_str(), e))?;

        if result.rows_affected() == 0 {
            tracing::debug!(message_id, "Commit matched no message");
        }

        Ok(())
    }

    /// Counts a delivery attempt for a pending message.
    ///
    /// Runs on its own connection so the count survives a rolled back delivery.
    /// Returns `false` if no pending message has this id.
    pub async fn record_attempt(&self, message_id: &str) -> Result<bool, Error> {
        let result = sqlx::query(&self.statements.record_attempt)
            .bind(unix_now())
            .bind(message_id)
            .bind(MessageState::Created)
            .execute(self.store.pool())
            .await
            .map_err(|e| Error::from_store(self.statements.record_attempt.as_str(), e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Delivers up to `limit` pending messages through `handler`.
    ///
    /// Every message gets its own transaction holding the handler's writes and
    /// the retirement, so one failure leaves the rest of the batch unaffected.
    /// Rows that fail to decode are skipped and counted, as are messages retired
    /// after the poll, which are never handed to `handler`.
    ///
    /// # Errors
    /// Only fails if the pending messages cannot be queried at all.
    pub async fn process_pending<T, H>(&self, limit: u32, handler: &H) -> Result<Batch, Error>
    where
        T: for<'r> FromRow<'r, SqliteRow> + AsRef<Message> + Send + Sync,
        H: Handler<T> + ?Sized,
    {
        let mut batch = Batch::default();

        // Drain the cursor before delivering so its connection is released.
        let mut messages = Vec::new();
        {
            let mut rows = self.pending::<T>(limit);
            while let Some(row) = rows.next().await {
                match row {
                    Ok(message) => messages.push(message),
                    Err(Error::Scan { source }) => {
                        tracing::warn!("Skipping undecodable row in {}: {source}", self.table);
                        batch.undecodable += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        for message in &messages {
            match self.deliver(handler, message).await {
                Ok(true) => batch.delivered += 1,
                Ok(false) => {
                    tracing::debug!(
                        message_id = %message.as_ref().message_id,
                        "Skipping message retired since the poll"
                    );
                    batch.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        message_id = %message.as_ref().message_id,
                        "Failed to deliver message: {e:#}"
                    );
                    batch.failed += 1;
                }
            }
        }

        if !batch.is_empty() {
            tracing::debug!(?batch, table = %self.table, "Processed outbox batch");
        }

        Ok(batch)
    }

    /// Returns `false` without calling `handler` if the message is no longer pending.
    async fn deliver<T, H>(&self, handler: &H, message: &T) -> eyre::Result<bool>
    where
        T: AsRef<Message> + Sync,
        H: Handler<T> + ?Sized,
    {
        let message_id = message.as_ref().message_id.as_str();

        if !self.record_attempt(message_id).await? {
            return Ok(false);
        }

        let mut tx = self.begin().await?;

        handler.handle(tx.as_mut(), message).await?;

        self.commit(&mut tx, message_id).await?;

        tx.commit()
            .await
            .map_err(|e| Error::from_store("COMMIT", e))?;

        Ok(true)
    }

    /// Runs [`Outbox::process_pending`] every `interval` until `shutdown` is cancelled.
    pub async fn run_consumer<T, H>(
        &self,
        handler: &H,
        limit: u32,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<(), Error>
    where
        T: for<'r> FromRow<'r, SqliteRow> + AsRef<Message> + Send + Sync,
        H: Handler<T> + ?Sized,
    {
        tracing::info!(table = %self.table, ?interval, limit, "Consuming outbox");

        consume(
            move || async move {
                self.process_pending::<T, H>(limit, handler).await?;
                Ok::<_, eyre::Report>(())
            },
            interval,
            shutdown,
        )
        .await
    }
}
