//! Mirrored merchant records (customers, payments, orders)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Resource types that can be mirrored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Customers,
    Payments,
    Orders,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Customers, Resource::Payments, Resource::Orders];

    /// Stable name, used as the watermark key and as the listing response key
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Customers => "customers",
            Resource::Payments => "payments",
            Resource::Orders => "orders",
        }
    }

    /// Field the remote listing is sorted on (newest first)
    pub fn sort_field(&self) -> &'static str {
        match self {
            Resource::Customers | Resource::Payments => "CREATED_AT",
            Resource::Orders => "UPDATED_AT",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "customers" => Ok(Resource::Customers),
            "payments" => Ok(Resource::Payments),
            "orders" => Ok(Resource::Orders),
            other => anyhow::bail!("Unknown resource: {}", other),
        }
    }
}

/// Remote identifier of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A merchant's customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub locality: Option<String>,
    pub postal_code: Option<String>,
    pub reference_id: Option<String>,
    pub note: Option<String>,
    pub creation_source: Option<String>,
}

/// A payment taken by the merchant
///
/// Amounts are in the smallest currency unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: Option<String>,
    pub amount: Option<i64>,
    pub total_amount: Option<i64>,
    pub approved_amount: Option<i64>,
    pub currency: Option<String>,
    pub card_brand: Option<String>,
    pub location_id: Option<String>,
    pub order_id: Option<String>,
    pub source_type: Option<String>,
}

/// An order placed with the merchant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub location_id: Option<String>,
    pub customer_id: Option<String>,
    pub state: Option<String>,
    pub total_amount: Option<i64>,
    pub currency: Option<String>,
}

/// A record of any mirrored resource type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "lowercase")]
pub enum Record {
    Customer(Customer),
    Payment(Payment),
    Order(Order),
}

impl Record {
    pub fn resource(&self) -> Resource {
        match self {
            Record::Customer(_) => Resource::Customers,
            Record::Payment(_) => Resource::Payments,
            Record::Order(_) => Resource::Orders,
        }
    }

    pub fn id(&self) -> &RecordId {
        match self {
            Record::Customer(c) => &c.id,
            Record::Payment(p) => &p.id,
            Record::Order(o) => &o.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Record::Customer(c) => c.created_at,
            Record::Payment(p) => p.created_at,
            Record::Order(o) => o.created_at,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Record::Customer(c) => c.updated_at,
            Record::Payment(p) => p.updated_at,
            Record::Order(o) => o.updated_at,
        }
    }

    /// Replace the creation time, used when an upsert keeps the stored one
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        match &mut self {
            Record::Customer(c) => c.created_at = created_at,
            Record::Payment(p) => p.created_at = created_at,
            Record::Order(o) => o.created_at = created_at,
        }
        self
    }
}
