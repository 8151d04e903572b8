//! In-memory aggregator for tests of the link machine and reconciler.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tally_core::{DateWindow, TransactionSnapshot};

use crate::error::{BankError, Result};
use crate::gateway::{AccountDetails, Aggregator, Balance, Institution, NewLinkRequest, RemoteLink};

#[derive(Default)]
struct FakeAccount {
    details: Option<AccountDetails>,
    balances: Vec<Balance>,
    transactions: Vec<TransactionSnapshot>,
}

#[derive(Default)]
struct State {
    next_link: u32,
    institutions: Vec<Institution>,
    links: BTreeMap<String, RemoteLink>,
    accounts: HashMap<String, FakeAccount>,
    failing_accounts: HashSet<String>,
    failing_transactions: HashSet<String>,
    failing_links: HashSet<String>,
    auth_broken: bool,
    transaction_calls: usize,
}

/// Scriptable stand-in for the aggregator. Accounts named in
/// `fail_account` answer with a 500, `fail_transactions` only on the
/// transactions endpoint; links named in `fail_link` answer status reads with
/// a 503. `break_auth` makes every call an `AuthFailure`.
#[derive(Default)]
pub struct FakeAggregator {
    state: Mutex<State>,
}

impl FakeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_institution(&self, id: &str, name: &str, transaction_total_days: Option<u32>) {
        self.state().institutions.push(Institution {
            id: id.to_string(),
            name: name.to_string(),
            transaction_total_days,
        });
    }

    pub fn add_account(&self, id: &str, name: &str, currency: &str, balance: f64) {
        self.state().accounts.insert(
            id.to_string(),
            FakeAccount {
                details: Some(AccountDetails {
                    name: Some(name.to_string()),
                    owner_name: None,
                    iban: Some(format!("DK00{id}")),
                    currency: Some(currency.to_string()),
                }),
                balances: vec![Balance {
                    amount: balance,
                    currency: currency.to_string(),
                    balance_type: "interimAvailable".to_string(),
                }],
                transactions: Vec::new(),
            },
        );
    }

    pub fn set_balance(&self, id: &str, amount: f64) {
        if let Some(acc) = self.state().accounts.get_mut(id) {
            for b in &mut acc.balances {
                b.amount = amount;
            }
        }
    }

    pub fn push_transactions(&self, id: &str, txns: Vec<TransactionSnapshot>) {
        self.state()
            .accounts
            .entry(id.to_string())
            .or_default()
            .transactions
            .extend(txns);
    }

    pub fn fail_account(&self, id: &str) {
        self.state().failing_accounts.insert(id.to_string());
    }

    pub fn fail_transactions(&self, id: &str) {
        self.state().failing_transactions.insert(id.to_string());
    }

    pub fn fail_link(&self, link_id: &str) {
        self.state().failing_links.insert(link_id.to_string());
    }

    pub fn break_auth(&self) {
        self.state().auth_broken = true;
    }

    /// Move a link to `status` and attach account ids, as the bank would after auth.
    pub fn set_link_status(&self, link_id: &str, status: &str, accounts: &[&str]) {
        if let Some(link) = self.state().links.get_mut(link_id) {
            link.status = status.to_string();
            link.accounts = accounts.iter().map(|a| a.to_string()).collect();
        }
    }

    /// Give an upstream link a new id, keeping its reference.
    pub fn rekey_link(&self, old_id: &str, new_id: &str) {
        let mut state = self.state();
        if let Some(mut link) = state.links.remove(old_id) {
            link.id = new_id.to_string();
            state.links.insert(new_id.to_string(), link);
        }
    }

    pub fn link_count(&self) -> usize {
        self.state().links.len()
    }

    pub fn transaction_calls(&self) -> usize {
        self.state().transaction_calls
    }

    fn check_auth(state: &State) -> Result<()> {
        if state.auth_broken {
            return Err(BankError::AuthFailure("secrets rejected".to_string()));
        }
        Ok(())
    }

    fn account<'a>(state: &'a State, id: &str) -> Result<&'a FakeAccount> {
        Self::check_auth(state)?;
        if state.failing_accounts.contains(id) {
            return Err(BankError::Upstream {
                status: 500,
                body: format!("account {id} unavailable"),
            });
        }
        state.accounts.get(id).ok_or_else(|| BankError::Upstream {
            status: 404,
            body: format!("account {id} not found"),
        })
    }
}

#[async_trait]
impl Aggregator for FakeAggregator {
    async fn create_link(&self, req: &NewLinkRequest) -> Result<RemoteLink> {
        let mut state = self.state();
        Self::check_auth(&state)?;
        state.next_link += 1;
        let id = format!("req-{}", state.next_link);
        let link = RemoteLink {
            id: id.clone(),
            status: "CR".to_string(),
            institution_id: req.institution_id.clone(),
            reference: req.reference.clone(),
            accounts: Vec::new(),
            link: format!("https://fake.bank/auth/{id}"),
        };
        state.links.insert(id, link.clone());
        Ok(link)
    }

    async fn get_link(&self, link_id: &str) -> Result<RemoteLink> {
        let state = self.state();
        Self::check_auth(&state)?;
        if state.failing_links.contains(link_id) {
            return Err(BankError::Upstream {
                status: 503,
                body: "down".to_string(),
            });
        }
        state.links.get(link_id).cloned().ok_or_else(|| BankError::Upstream {
            status: 404,
            body: format!("requisition {link_id} not found"),
        })
    }

    async fn list_links(&self) -> Result<Vec<RemoteLink>> {
        let state = self.state();
        Self::check_auth(&state)?;
        Ok(state.links.values().cloned().collect())
    }

    async fn list_institutions(&self, _country: &str) -> Result<Vec<Institution>> {
        let state = self.state();
        Self::check_auth(&state)?;
        Ok(state.institutions.clone())
    }

    async fn get_institution(&self, institution_id: &str) -> Result<Institution> {
        let state = self.state();
        Self::check_auth(&state)?;
        state
            .institutions
            .iter()
            .find(|i| i.id == institution_id)
            .cloned()
            .ok_or_else(|| BankError::UnknownInstitution(institution_id.to_string()))
    }

    async fn get_account_details(&self, account_id: &str) -> Result<AccountDetails> {
        let state = self.state();
        let acc = Self::account(&state, account_id)?;
        Ok(acc.details.clone().unwrap_or(AccountDetails {
            name: None,
            owner_name: None,
            iban: None,
            currency: None,
        }))
    }

    async fn get_account_balances(&self, account_id: &str) -> Result<Vec<Balance>> {
        let state = self.state();
        Ok(Self::account(&state, account_id)?.balances.clone())
    }

    async fn get_account_transactions(
        &self,
        account_id: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<TransactionSnapshot>> {
        let mut state = self.state();
        state.transaction_calls += 1;
        let acc = Self::account(&state, account_id)?;
        if state.failing_transactions.contains(account_id) {
            return Err(BankError::Upstream {
                status: 500,
                body: format!("transactions for {account_id} unavailable"),
            });
        }
        Ok(acc
            .transactions
            .iter()
            .filter(|t| window.is_none_or(|w| t.date >= w.from && t.date <= w.to))
            .cloned()
            .collect())
    }
}
