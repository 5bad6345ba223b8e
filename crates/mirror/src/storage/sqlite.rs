//! SQLite-backed storage for credentials, watermarks and mirrored records

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use rusqlite_migration::{M, Migrations};

use super::{CredentialStore, RecordSink, WatermarkStore};
use crate::models::{
    Credential, Customer, Order, Payment, Record, RecordId, Resource, SyncWatermark,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: credentials and watermarks
        M::up(
            r#"
            -- Credential history per account; the newest row is the active one
            CREATE TABLE credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                access_secret TEXT NOT NULL,
                secret_kind TEXT NOT NULL,
                access_expiry TEXT NOT NULL,
                refresh_secret TEXT,
                refresh_expiry TEXT,
                short_lived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX idx_credentials_account_created
                ON credentials(account_id, created_at DESC);

            -- One high-water mark per resource
            CREATE TABLE sync_watermarks (
                resource TEXT PRIMARY KEY,
                last_synced_at TEXT NOT NULL
            );
            "#,
        ),
        // Migration 2: mirrored records
        M::up(
            r#"
            CREATE TABLE customers (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                given_name TEXT,
                family_name TEXT,
                locality TEXT,
                postal_code TEXT,
                reference_id TEXT,
                note TEXT,
                creation_source TEXT
            );

            CREATE TABLE orders (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                location_id TEXT,
                customer_id TEXT,
                state TEXT,
                total_amount INTEGER,
                currency TEXT
            );

            CREATE TABLE payments (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                status TEXT,
                amount INTEGER,
                total_amount INTEGER,
                approved_amount INTEGER,
                currency TEXT,
                card_brand TEXT,
                location_id TEXT,
                order_id TEXT,
                source_type TEXT
            );

            CREATE INDEX idx_customers_updated_at ON customers(updated_at DESC);
            CREATE INDEX idx_orders_updated_at ON orders(updated_at DESC);
            CREATE INDEX idx_payments_updated_at ON payments(updated_at DESC);
            "#,
        ),
    ])
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn table_for(resource: Resource) -> &'static str {
    match resource {
        Resource::Customers => "customers",
        Resource::Payments => "payments",
        Resource::Orders => "orders",
    }
}

const CREDENTIAL_COLUMNS: &str = "account_id, access_secret, secret_kind, access_expiry, \
     refresh_secret, refresh_expiry, short_lived, created_at";

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        account_id: row.get(0)?,
        access_secret: row.get(1)?,
        secret_kind: row.get(2)?,
        access_expiry: ts_col(row, 3)?,
        refresh_secret: row.get(4)?,
        refresh_expiry: opt_ts_col(row, 5)?,
        short_lived: row.get(6)?,
        created_at: ts_col(row, 7)?,
    })
}

fn select_most_recent(conn: &Connection, account_id: &str) -> Result<Option<Credential>> {
    let sql = format!(
        "SELECT {} FROM credentials WHERE account_id = ?
         ORDER BY created_at DESC, id DESC LIMIT 1",
        CREDENTIAL_COLUMNS
    );
    let credential = conn
        .query_row(&sql, [account_id], credential_from_row)
        .optional()
        .with_context(|| format!("Failed to load credential for account {}", account_id))?;
    Ok(credential)
}

fn insert_credential(conn: &Connection, credential: &Credential) -> Result<()> {
    let sql = format!(
        "INSERT INTO credentials ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        CREDENTIAL_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            credential.account_id,
            credential.access_secret,
            credential.secret_kind,
            ts(credential.access_expiry),
            credential.refresh_secret,
            credential.refresh_expiry.map(ts),
            credential.short_lived,
            ts(credential.created_at),
        ],
    )
    .context("Failed to insert credential")?;
    Ok(())
}

/// SQLite storage for everything the mirror persists
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets readers proceed while a sync run writes; busy_timeout makes
        // concurrent writers wait instead of failing with SQLITE_BUSY.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("SQLite connection lock poisoned"))
    }
}

impl CredentialStore for SqliteStore {
    fn most_recent_credential(&self, account_id: &str) -> Result<Option<Credential>> {
        let conn = self.conn()?;
        select_most_recent(&conn, account_id)
    }

    fn upsert_credential(&self, credential: Credential) -> Result<()> {
        let conn = self.conn()?;
        insert_credential(&conn, &credential)
    }

    fn upsert_and_reload_credential(&self, credential: Credential) -> Result<Option<Credential>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_credential(&tx, &credential)?;
        let reloaded = select_most_recent(&tx, &credential.account_id)?;
        tx.commit().context("Failed to commit credential refresh")?;
        Ok(reloaded)
    }
}

impl WatermarkStore for SqliteStore {
    fn get_watermark(&self, resource: Resource) -> Result<Option<SyncWatermark>> {
        let conn = self.conn()?;
        let mark = conn
            .query_row(
                "SELECT last_synced_at FROM sync_watermarks WHERE resource = ?",
                [resource.as_str()],
                |row| ts_col(row, 0),
            )
            .optional()?;
        Ok(mark.map(|last_synced_at| SyncWatermark::new(resource, last_synced_at)))
    }

    fn upsert_watermark(&self, resource: Resource, last_synced_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_watermarks (resource, last_synced_at) VALUES (?, ?)
             ON CONFLICT(resource) DO UPDATE SET
                last_synced_at = MAX(last_synced_at, excluded.last_synced_at)",
            params![resource.as_str(), ts(last_synced_at)],
        )
        .with_context(|| format!("Failed to save watermark for {}", resource))?;
        Ok(())
    }

    fn list_watermarks(&self) -> Result<Vec<SyncWatermark>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT resource, last_synced_at FROM sync_watermarks ORDER BY resource")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, ts_col(row, 1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(name, last_synced_at)| Ok(SyncWatermark::new(name.parse()?, last_synced_at)))
            .collect()
    }
}

impl RecordSink for SqliteStore {
    fn upsert_record(&self, record: Record) -> Result<()> {
        let conn = self.conn()?;
        let id = record.id().as_str().to_string();

        // created_at is never updated: the first sighting of a record fixes it
        let written = match record {
            Record::Customer(c) => conn.execute(
                "INSERT INTO customers
                 (id, created_at, updated_at, given_name, family_name, locality, postal_code,
                  reference_id, note, creation_source)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    updated_at = excluded.updated_at,
                    given_name = excluded.given_name,
                    family_name = excluded.family_name,
                    locality = excluded.locality,
                    postal_code = excluded.postal_code,
                    reference_id = excluded.reference_id,
                    note = excluded.note,
                    creation_source = excluded.creation_source",
                params![
                    c.id.as_str(),
                    ts(c.created_at),
                    ts(c.updated_at),
                    c.given_name,
                    c.family_name,
                    c.locality,
                    c.postal_code,
                    c.reference_id,
                    c.note,
                    c.creation_source,
                ],
            ),
            Record::Payment(p) => conn.execute(
                "INSERT INTO payments
                 (id, created_at, updated_at, status, amount, total_amount, approved_amount,
                  currency, card_brand, location_id, order_id, source_type)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    updated_at = excluded.updated_at,
                    status = excluded.status,
                    amount = excluded.amount,
                    total_amount = excluded.total_amount,
                    approved_amount = excluded.approved_amount,
                    currency = excluded.currency,
                    card_brand = excluded.card_brand,
                    location_id = excluded.location_id,
                    order_id = excluded.order_id,
                    source_type = excluded.source_type",
                params![
                    p.id.as_str(),
                    ts(p.created_at),
                    ts(p.updated_at),
                    p.status,
                    p.amount,
                    p.total_amount,
                    p.approved_amount,
                    p.currency,
                    p.card_brand,
                    p.location_id,
                    p.order_id,
                    p.source_type,
                ],
            ),
            Record::Order(o) => conn.execute(
                "INSERT INTO orders
                 (id, created_at, updated_at, location_id, customer_id, state,
                  total_amount, currency)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    updated_at = excluded.updated_at,
                    location_id = excluded.location_id,
                    customer_id = excluded.customer_id,
                    state = excluded.state,
                    total_amount = excluded.total_amount,
                    currency = excluded.currency",
                params![
                    o.id.as_str(),
                    ts(o.created_at),
                    ts(o.updated_at),
                    o.location_id,
                    o.customer_id,
                    o.state,
                    o.total_amount,
                    o.currency,
                ],
            ),
        };
        written.with_context(|| format!("Failed to upsert record {}", id))?;

        Ok(())
    }

    fn get_record(&self, resource: Resource, id: &RecordId) -> Result<Option<Record>> {
        let conn = self.conn()?;

        let record = match resource {
            Resource::Customers => conn
                .query_row(
                    "SELECT id, created_at, updated_at, given_name, family_name, locality,
                            postal_code, reference_id, note, creation_source
                     FROM customers WHERE id = ?",
                    [id.as_str()],
                    |row| {
                        Ok(Record::Customer(Customer {
                            id: RecordId::new(row.get::<_, String>(0)?),
                            created_at: ts_col(row, 1)?,
                            updated_at: ts_col(row, 2)?,
                            given_name: row.get(3)?,
                            family_name: row.get(4)?,
                            locality: row.get(5)?,
                            postal_code: row.get(6)?,
                            reference_id: row.get(7)?,
                            note: row.get(8)?,
                            creation_source: row.get(9)?,
                        }))
                    },
                )
                .optional()?,
            Resource::Payments => conn
                .query_row(
                    "SELECT id, created_at, updated_at, status, amount, total_amount,
                            approved_amount, currency, card_brand, location_id, order_id,
                            source_type
                     FROM payments WHERE id = ?",
                    [id.as_str()],
                    |row| {
                        Ok(Record::Payment(Payment {
                            id: RecordId::new(row.get::<_, String>(0)?),
                            created_at: ts_col(row, 1)?,
                            updated_at: ts_col(row, 2)?,
                            status: row.get(3)?,
                            amount: row.get(4)?,
                            total_amount: row.get(5)?,
                            approved_amount: row.get(6)?,
                            currency: row.get(7)?,
                            card_brand: row.get(8)?,
                            location_id: row.get(9)?,
                            order_id: row.get(10)?,
                            source_type: row.get(11)?,
                        }))
                    },
                )
                .optional()?,
            Resource::Orders => conn
                .query_row(
                    "SELECT id, created_at, updated_at, location_id, customer_id, state,
                            total_amount, currency
                     FROM orders WHERE id = ?",
                    [id.as_str()],
                    |row| {
                        Ok(Record::Order(Order {
                            id: RecordId::new(row.get::<_, String>(0)?),
                            created_at: ts_col(row, 1)?,
                            updated_at: ts_col(row, 2)?,
                            location_id: row.get(3)?,
                            customer_id: row.get(4)?,
                            state: row.get(5)?,
                            total_amount: row.get(6)?,
                            currency: row.get(7)?,
                        }))
                    },
                )
                .optional()?,
        };

        Ok(record)
    }

    fn count_records(&self, resource: Resource) -> Result<usize> {
        let conn = self.conn()?;
        let sql = format!("SELECT COUNT(*) FROM {}", table_for(resource));
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
