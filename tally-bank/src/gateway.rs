//! Typed operations against the open-banking aggregator.
//!
//! `Aggregator` is the seam the link machine and reconciler depend on;
//! `crate::http::HttpAggregator` is the production implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tally_core::{DateWindow, LinkStatus, TransactionSnapshot};

use crate::error::Result;

/// A bank the aggregator can connect to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Institution {
    pub id: String,
    pub name: String,
    /// How far back the bank serves transactions, when it says
    pub transaction_total_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLinkRequest {
    pub redirect_url: String,
    pub institution_id: String,
    pub reference: String,
    pub language: String,
}

/// A requisition as the aggregator reports it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteLink {
    pub id: String,
    /// Aggregator status code (`CR`, `GC`, `UA`, `RJ`, `SA`, `GA`, `LN`, `SU`, `EX`)
    pub status: String,
    pub institution_id: String,
    pub reference: String,
    pub accounts: Vec<String>,
    /// Bank authentication URL the user is sent to
    pub link: String,
}

impl RemoteLink {
    /// Map the aggregator's status code onto the local link lifecycle.
    pub fn local_status(&self) -> LinkStatus {
        map_status_code(&self.status)
    }
}

pub fn map_status_code(code: &str) -> LinkStatus {
    match code {
        "CR" => LinkStatus::Created,
        "LN" => LinkStatus::Linked,
        "EX" => LinkStatus::Expired,
        "RJ" | "SU" | "ER" => LinkStatus::Error,
        // GC, UA, SA, GA and anything new: the user is still at the bank
        _ => LinkStatus::AwaitingAuthentication,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountDetails {
    pub name: Option<String>,
    pub owner_name: Option<String>,
    pub iban: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Balance {
    pub amount: f64,
    pub currency: String,
    /// e.g. `interimAvailable`, `closingBooked`, `expected`
    pub balance_type: String,
}

const BALANCE_PREFERENCE: &[&str] = &["interimAvailable", "interimBooked", "closingBooked", "expected"];

/// The balance shown to the user: first preferred type present, else the first reported.
pub fn pick_balance(balances: &[Balance]) -> Option<&Balance> {
    BALANCE_PREFERENCE
        .iter()
        .find_map(|kind| balances.iter().find(|b| b.balance_type == *kind))
        .or_else(|| balances.first())
}

#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn create_link(&self, req: &NewLinkRequest) -> Result<RemoteLink>;

    async fn get_link(&self, link_id: &str) -> Result<RemoteLink>;

    async fn list_links(&self) -> Result<Vec<RemoteLink>>;

    async fn list_institutions(&self, country: &str) -> Result<Vec<Institution>>;

    async fn get_institution(&self, institution_id: &str) -> Result<Institution>;

    async fn get_account_details(&self, account_id: &str) -> Result<AccountDetails>;

    async fn get_account_balances(&self, account_id: &str) -> Result<Vec<Balance>>;

    /// Booked transactions only, optionally restricted to a booking-date window
    async fn get_account_transactions(
        &self,
        account_id: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<TransactionSnapshot>>;

    /// Linear scan over `list_links`; link counts per install are small.
    async fn find_link_by_reference(&self, reference: &str) -> Result<Option<RemoteLink>> {
        Ok(self
            .list_links()
            .await?
            .into_iter()
            .find(|l| l.reference == reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bal(kind: &str, amount: f64) -> Balance {
        Balance {
            amount,
            currency: "DKK".to_string(),
            balance_type: kind.to_string(),
        }
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(map_status_code("CR"), LinkStatus::Created);
        assert_eq!(map_status_code("UA"), LinkStatus::AwaitingAuthentication);
        assert_eq!(map_status_code("GA"), LinkStatus::AwaitingAuthentication);
        assert_eq!(map_status_code("LN"), LinkStatus::Linked);
        assert_eq!(map_status_code("EX"), LinkStatus::Expired);
        assert_eq!(map_status_code("RJ"), LinkStatus::Error);
        assert_eq!(map_status_code("SU"), LinkStatus::Error);
        assert_eq!(map_status_code("??"), LinkStatus::AwaitingAuthentication);
    }

    #[test]
    fn test_pick_balance_prefers_interim_available() {
        let balances = vec![bal("closingBooked", 10.0), bal("interimAvailable", 12.5)];
        assert_eq!(pick_balance(&balances).unwrap().amount, 12.5);
    }

    #[test]
    fn test_pick_balance_falls_back_to_first() {
        let balances = vec![bal("forwardAvailable", 3.0), bal("nonInvoiced", 4.0)];
        assert_eq!(pick_balance(&balances).unwrap().amount, 3.0);
        assert!(pick_balance(&[]).is_none());
    }
}
