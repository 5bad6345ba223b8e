//! Square API response normalization
//!
//! Converts raw listing entries to domain records. Entries without an id or
//! a parseable `updated_at` are rejected here so nothing downstream has to
//! handle partial records.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::api::{Money, SquareCustomer, SquareOrder, SquarePayment};
use crate::models::{Customer, Order, Payment, Record, RecordId, Resource};

/// Normalize one raw listing entry of `resource`
pub fn normalize_record(resource: Resource, raw: &Value) -> Result<Record> {
    match resource {
        Resource::Customers => {
            let c: SquareCustomer =
                serde_json::from_value(raw.clone()).context("Malformed customer")?;
            let (created_at, updated_at) = timestamps(c.created_at.as_deref(), &c.updated_at)?;
            let address = c.address.unwrap_or_default();
            Ok(Record::Customer(Customer {
                id: record_id(c.id)?,
                created_at,
                updated_at,
                given_name: c.given_name,
                family_name: c.family_name,
                locality: address.locality,
                postal_code: address.postal_code,
                reference_id: c.reference_id,
                note: c.note,
                creation_source: c.creation_source,
            }))
        }
        Resource::Payments => {
            let p: SquarePayment =
                serde_json::from_value(raw.clone()).context("Malformed payment")?;
            let (created_at, updated_at) = timestamps(p.created_at.as_deref(), &p.updated_at)?;
            let amount = p.amount_money.unwrap_or_default();
            let card_details = p.card_details.unwrap_or_default();
            Ok(Record::Payment(Payment {
                id: record_id(p.id)?,
                created_at,
                updated_at,
                status: p.status.or(card_details.status),
                amount: amount.amount,
                total_amount: amount_of(p.total_money),
                approved_amount: amount_of(p.approved_money),
                currency: amount.currency,
                card_brand: card_details.card.and_then(|card| card.card_brand),
                location_id: p.location_id,
                order_id: p.order_id,
                source_type: p.source_type,
            }))
        }
        Resource::Orders => {
            let o: SquareOrder = serde_json::from_value(raw.clone()).context("Malformed order")?;
            let (created_at, updated_at) = timestamps(o.created_at.as_deref(), &o.updated_at)?;
            let total = o.total_money.unwrap_or_default();
            Ok(Record::Order(Order {
                id: record_id(o.id)?,
                created_at,
                updated_at,
                location_id: o.location_id,
                customer_id: o.customer_id,
                state: o.state,
                total_amount: total.amount,
                currency: total.currency,
            }))
        }
    }
}

fn record_id(id: String) -> Result<RecordId> {
    if id.trim().is_empty() {
        anyhow::bail!("Record has an empty id");
    }
    Ok(RecordId(id))
}

fn amount_of(money: Option<Money>) -> Option<i64> {
    money.and_then(|m| m.amount)
}

/// Parse `(created_at, updated_at)`; a missing creation time falls back to the update time
fn timestamps(
    created_at: Option<&str>,
    updated_at: &str,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let updated_at = parse_timestamp(updated_at).context("Invalid updated_at")?;
    let created_at = match created_at {
        Some(ts) => parse_timestamp(ts).context("Invalid created_at")?,
        None => updated_at,
    };
    Ok((created_at, updated_at))
}

fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(ts)
        .with_context(|| format!("Not an RFC 3339 timestamp: {}", ts))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_normalize_customer() {
        let raw = json!({
            "id": "CUST1",
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "2024-03-02T11:30:00.250Z",
            "given_name": "Ada",
            "family_name": "Lovelace",
            "address": { "locality": "London", "postal_code": "N1" },
            "creation_source": "DIRECTORY",
        });

        let Record::Customer(c) = normalize_record(Resource::Customers, &raw).unwrap() else {
            panic!("expected a customer");
        };
        assert_eq!(c.id.as_str(), "CUST1");
        assert_eq!(c.created_at, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
        assert_eq!(c.locality.as_deref(), Some("London"));
        assert_eq!(c.postal_code.as_deref(), Some("N1"));
        assert_eq!(c.note, None);
    }

    #[test]
    fn test_normalize_payment() {
        let raw = json!({
            "id": "PAY1",
            "created_at": "2024-03-01T10:00:00+02:00",
            "updated_at": "2024-03-01T10:05:00+02:00",
            "amount_money": { "amount": 1250, "currency": "USD" },
            "total_money": { "amount": 1400, "currency": "USD" },
            "approved_money": { "amount": 1400, "currency": "USD" },
            "card_details": { "status": "CAPTURED", "card": { "card_brand": "VISA" } },
            "location_id": "L1",
            "order_id": "ORD1",
            "source_type": "CARD",
        });

        let Record::Payment(p) = normalize_record(Resource::Payments, &raw).unwrap() else {
            panic!("expected a payment");
        };
        assert_eq!(p.created_at, Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap());
        assert_eq!(p.status.as_deref(), Some("CAPTURED"));
        assert_eq!(p.amount, Some(1250));
        assert_eq!(p.total_amount, Some(1400));
        assert_eq!(p.approved_amount, Some(1400));
        assert_eq!(p.currency.as_deref(), Some("USD"));
        assert_eq!(p.card_brand.as_deref(), Some("VISA"));
    }

    #[test]
    fn test_top_level_payment_status_wins() {
        let raw = json!({
            "id": "PAY2",
            "updated_at": "2024-03-01T10:05:00Z",
            "status": "COMPLETED",
            "card_details": { "status": "CAPTURED" },
        });
        let Record::Payment(p) = normalize_record(Resource::Payments, &raw).unwrap() else {
            panic!("expected a payment");
        };
        assert_eq!(p.status.as_deref(), Some("COMPLETED"));
        assert_eq!(p.created_at, p.updated_at);
    }

    #[test]
    fn test_normalize_order() {
        let raw = json!({
            "id": "ORD1",
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "2024-03-01T12:00:00Z",
            "location_id": "L1",
            "state": "COMPLETED",
            "total_money": { "amount": 900, "currency": "CAD" },
        });
        let record = normalize_record(Resource::Orders, &raw).unwrap();
        assert_eq!(record.resource(), Resource::Orders);
        let Record::Order(o) = record else {
            panic!("expected an order");
        };
        assert_eq!(o.total_amount, Some(900));
        assert_eq!(o.currency.as_deref(), Some("CAD"));
        assert_eq!(o.customer_id, None);
    }

    #[test]
    fn test_rejects_missing_required_fields() {
        let no_id = json!({ "updated_at": "2024-03-01T10:00:00Z" });
        assert!(normalize_record(Resource::Customers, &no_id).is_err());

        let empty_id = json!({ "id": " ", "updated_at": "2024-03-01T10:00:00Z" });
        assert!(normalize_record(Resource::Customers, &empty_id).is_err());

        let no_updated = json!({ "id": "c1", "created_at": "2024-03-01T10:00:00Z" });
        assert!(normalize_record(Resource::Customers, &no_updated).is_err());

        let bad_ts = json!({ "id": "p1", "updated_at": "yesterday" });
        assert!(normalize_record(Resource::Payments, &bad_ts).is_err());
    }
}
