//! Square API integration
//!
//! This module provides:
//! - Token refresh against the OAuth token endpoint
//! - Listing client for customers, payments and orders
//! - Response normalization to domain records

mod auth;
mod client;
mod normalize;

pub use auth::SquareAuth;
pub use client::SquareClient;
pub use normalize::normalize_record;

/// Square API version sent with every request
pub const API_VERSION: &str = "2025-01-23";

/// Production API host
pub const BASE_URL: &str = "https://connect.squareup.com";

/// Square API response types
pub mod api {
    use serde::Deserialize;

    /// Amount in the smallest currency unit
    #[derive(Debug, Default, Deserialize)]
    pub struct Money {
        pub amount: Option<i64>,
        pub currency: Option<String>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct Address {
        pub locality: Option<String>,
        pub postal_code: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct SquareCustomer {
        pub id: String,
        pub created_at: Option<String>,
        pub updated_at: String,
        pub given_name: Option<String>,
        pub family_name: Option<String>,
        pub address: Option<Address>,
        pub reference_id: Option<String>,
        pub note: Option<String>,
        pub creation_source: Option<String>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct Card {
        pub card_brand: Option<String>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct CardDetails {
        pub status: Option<String>,
        pub card: Option<Card>,
    }

    #[derive(Debug, Deserialize)]
    pub struct SquarePayment {
        pub id: String,
        pub created_at: Option<String>,
        pub updated_at: String,
        pub status: Option<String>,
        pub amount_money: Option<Money>,
        pub total_money: Option<Money>,
        pub approved_money: Option<Money>,
        pub card_details: Option<CardDetails>,
        pub location_id: Option<String>,
        pub order_id: Option<String>,
        pub source_type: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct SquareOrder {
        pub id: String,
        pub created_at: Option<String>,
        pub updated_at: String,
        pub location_id: Option<String>,
        pub customer_id: Option<String>,
        pub state: Option<String>,
        pub total_money: Option<Money>,
    }

    /// One entry of an `errors` array
    #[derive(Debug, Deserialize)]
    pub struct ApiErrorDetail {
        pub category: Option<String>,
        pub code: Option<String>,
        pub detail: Option<String>,
    }
}
