//! reqwest-backed aggregator client (GoCardless Bank Account Data style API).

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{DateWindow, TransactionSnapshot};
use tracing::{debug, warn};

use crate::backoff::{self, BackoffPolicy};
use crate::error::{BankError, Result};
use crate::gateway::{AccountDetails, Aggregator, Balance, Institution, NewLinkRequest, RemoteLink};
use crate::token::{ClientSecrets, IssuedTokens, TokenClient, TokenManager};

pub const DEFAULT_BASE_URL: &str = "https://bankaccountdata.gocardless.com/api/v2";

/// Build the shared HTTP client with a per-request timeout.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Map a status code onto the error taxonomy, then decode the body.
///
/// 429 is the only status the backoff executor retries.
fn parse_response<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(BankError::RateLimited);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(BankError::Unauthorized {
            status: status.as_u16(),
            body: String::from_utf8_lossy(body).into_owned(),
        });
    }
    if !status.is_success() {
        return Err(BankError::Upstream {
            status: status.as_u16(),
            body: String::from_utf8_lossy(body).into_owned(),
        });
    }
    serde_json::from_slice(body).map_err(|e| BankError::Decode(e.to_string()))
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    let bytes = resp.bytes().await?;
    parse_response(status, &bytes)
}

async fn send_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T> {
    let resp = req.send().await?;
    read_json(resp).await
}

// ---- wire types ----------------------------------------------------------

#[derive(Serialize)]
struct TokenNewReq<'a> {
    secret_id: &'a str,
    secret_key: &'a str,
}

#[derive(Deserialize)]
struct TokenNewResp {
    access: String,
    refresh: String,
}

#[derive(Serialize)]
struct TokenRefreshReq<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct TokenRefreshResp {
    access: String,
}

#[derive(Serialize)]
struct RequisitionReq<'a> {
    redirect: &'a str,
    institution_id: &'a str,
    reference: &'a str,
    user_language: &'a str,
}

#[derive(Deserialize)]
struct RequisitionResp {
    id: String,
    status: String,
    #[serde(default)]
    institution_id: String,
    #[serde(default)]
    reference: String,
    #[serde(default)]
    accounts: Vec<String>,
    #[serde(default)]
    link: String,
}

impl From<RequisitionResp> for RemoteLink {
    fn from(r: RequisitionResp) -> Self {
        RemoteLink {
            id: r.id,
            status: r.status,
            institution_id: r.institution_id,
            reference: r.reference,
            accounts: r.accounts,
            link: r.link,
        }
    }
}

#[derive(Deserialize)]
struct RequisitionPage {
    #[serde(default)]
    next: Option<String>,
    results: Vec<RequisitionResp>,
}

#[derive(Deserialize)]
struct InstitutionResp {
    id: String,
    name: String,
    #[serde(default, deserialize_with = "lenient_u32")]
    transaction_total_days: Option<u32>,
}

impl From<InstitutionResp> for Institution {
    fn from(r: InstitutionResp) -> Self {
        Institution {
            id: r.id,
            name: r.name,
            transaction_total_days: r.transaction_total_days,
        }
    }
}

// The aggregator sends numbers as strings here ("540"); accept both.
fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u32),
        Str(String),
    }
    Ok(match Option::<NumOrStr>::deserialize(d)? {
        Some(NumOrStr::Num(n)) => Some(n),
        Some(NumOrStr::Str(s)) => s.trim().parse().ok(),
        None => None,
    })
}

#[derive(Deserialize)]
struct DetailsResp {
    account: DetailsInner,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetailsInner {
    name: Option<String>,
    owner_name: Option<String>,
    product: Option<String>,
    iban: Option<String>,
    currency: Option<String>,
}

#[derive(Deserialize)]
struct Amount {
    amount: String,
    currency: String,
}

fn parse_amount(a: &Amount) -> Result<f64> {
    a.amount
        .trim()
        .parse::<f64>()
        .map_err(|e| BankError::Decode(format!("amount '{}': {e}", a.amount)))
}

#[derive(Deserialize)]
struct BalancesResp {
    balances: Vec<BalanceResp>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResp {
    balance_amount: Amount,
    balance_type: String,
}

#[derive(Deserialize)]
struct TransactionsResp {
    transactions: TransactionsInner,
}

#[derive(Deserialize)]
struct TransactionsInner {
    #[serde(default)]
    booked: Vec<TransactionResp>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionResp {
    transaction_id: Option<String>,
    internal_transaction_id: Option<String>,
    booking_date: Option<NaiveDate>,
    value_date: Option<NaiveDate>,
    transaction_amount: Amount,
    creditor_name: Option<String>,
    debtor_name: Option<String>,
    remittance_information_unstructured: Option<String>,
    #[serde(default)]
    remittance_information_unstructured_array: Vec<String>,
    additional_information: Option<String>,
}

impl TransactionResp {
    /// `None` when the bank gave no stable id or no date; such rows cannot be deduplicated.
    fn into_snapshot(self) -> Result<Option<TransactionSnapshot>> {
        let Some(id) = self.transaction_id.or(self.internal_transaction_id) else {
            return Ok(None);
        };
        let Some(date) = self.booking_date.or(self.value_date) else {
            return Ok(None);
        };
        let amount = parse_amount(&self.transaction_amount)?;
        let description = self
            .remittance_information_unstructured
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                let joined = self.remittance_information_unstructured_array.join(" ");
                (!joined.trim().is_empty()).then_some(joined)
            })
            .or(self.additional_information)
            .or_else(|| self.creditor_name.clone())
            .or_else(|| self.debtor_name.clone())
            .unwrap_or_default();
        Ok(Some(TransactionSnapshot {
            external_transaction_id: id,
            date,
            amount,
            currency: self.transaction_amount.currency,
            description: description.trim().to_string(),
            creditor_name: self.creditor_name,
            debtor_name: self.debtor_name,
        }))
    }
}

fn booked_snapshots(resp: TransactionsResp) -> Result<Vec<TransactionSnapshot>> {
    let mut out = Vec::with_capacity(resp.transactions.booked.len());
    for t in resp.transactions.booked {
        match t.into_snapshot()? {
            Some(s) => out.push(s),
            None => warn!("skipping booked transaction without id or date"),
        }
    }
    Ok(out)
}

// ---- token endpoints -----------------------------------------------------

/// `token/new` and `token/refresh`, each wrapped in backoff
#[derive(Clone)]
pub struct HttpTokenClient {
    http: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl HttpTokenClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            backoff,
        }
    }
}

#[async_trait]
impl TokenClient for HttpTokenClient {
    async fn issue(&self, secrets: &ClientSecrets) -> Result<IssuedTokens> {
        let url = endpoint(&self.base_url, "token/new/");
        let body = TokenNewReq {
            secret_id: &secrets.secret_id,
            secret_key: &secrets.secret_key,
        };
        debug!(%url, "issuing aggregator token");
        let resp: TokenNewResp =
            backoff::execute(&self.backoff, || send_json(self.http.post(&url).json(&body))).await?;
        Ok(IssuedTokens {
            access: resp.access,
            refresh: resp.refresh,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String> {
        let url = endpoint(&self.base_url, "token/refresh/");
        let body = TokenRefreshReq {
            refresh: refresh_token,
        };
        debug!(%url, "refreshing aggregator token");
        let resp: TokenRefreshResp =
            backoff::execute(&self.backoff, || send_json(self.http.post(&url).json(&body))).await?;
        Ok(resp.access)
    }
}

// ---- data endpoints ------------------------------------------------------

pub struct HttpAggregator {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    backoff: BackoffPolicy,
}

impl HttpAggregator {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<TokenManager>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            tokens,
            backoff,
        }
    }

    // Token first, then the bearer call; a 401 here is terminal for the call.
    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = endpoint(&self.base_url, path);
        let url = url.as_str();
        backoff::execute(&self.backoff, || async move {
            let token = self.tokens.get_valid_token().await?;
            debug!(%url, "aggregator GET");
            send_json(
                self.http
                    .get(url)
                    .query(query)
                    .header(AUTHORIZATION, format!("Bearer {token}")),
            )
            .await
        })
        .await
    }

    async fn get_url<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        backoff::execute(&self.backoff, || async move {
            let token = self.tokens.get_valid_token().await?;
            debug!(%url, "aggregator GET");
            send_json(
                self.http
                    .get(url)
                    .header(AUTHORIZATION, format!("Bearer {token}")),
            )
            .await
        })
        .await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = endpoint(&self.base_url, path);
        let url = url.as_str();
        backoff::execute(&self.backoff, || async move {
            let token = self.tokens.get_valid_token().await?;
            debug!(%url, "aggregator POST");
            send_json(
                self.http
                    .post(url)
                    .json(body)
                    .header(AUTHORIZATION, format!("Bearer {token}")),
            )
            .await
        })
        .await
    }
}

#[async_trait]
impl Aggregator for HttpAggregator {
    async fn create_link(&self, req: &NewLinkRequest) -> Result<RemoteLink> {
        let body = RequisitionReq {
            redirect: &req.redirect_url,
            institution_id: &req.institution_id,
            reference: &req.reference,
            user_language: &req.language,
        };
        let resp: RequisitionResp = self.post("requisitions/", &body).await?;
        Ok(resp.into())
    }

    async fn get_link(&self, link_id: &str) -> Result<RemoteLink> {
        let resp: RequisitionResp = self.get(&format!("requisitions/{link_id}/"), &[]).await?;
        Ok(resp.into())
    }

    async fn list_links(&self) -> Result<Vec<RemoteLink>> {
        let mut page: RequisitionPage = self.get("requisitions/", &[]).await?;
        let mut out: Vec<RemoteLink> = Vec::new();
        loop {
            out.extend(page.results.into_iter().map(RemoteLink::from));
            match page.next.filter(|n| !n.is_empty()) {
                Some(next) => page = self.get_url(&next).await?,
                None => break,
            }
        }
        Ok(out)
    }

    async fn list_institutions(&self, country: &str) -> Result<Vec<Institution>> {
        let resp: Vec<InstitutionResp> = self
            .get("institutions/", &[("country", country.to_uppercase())])
            .await?;
        Ok(resp.into_iter().map(Institution::from).collect())
    }

    async fn get_institution(&self, institution_id: &str) -> Result<Institution> {
        let resp: InstitutionResp = self.get(&format!("institutions/{institution_id}/"), &[]).await?;
        Ok(resp.into())
    }

    async fn get_account_details(&self, account_id: &str) -> Result<AccountDetails> {
        let resp: DetailsResp = self.get(&format!("accounts/{account_id}/details/"), &[]).await?;
        let a = resp.account;
        Ok(AccountDetails {
            name: a.name.or(a.product),
            owner_name: a.owner_name,
            iban: a.iban,
            currency: a.currency,
        })
    }

    async fn get_account_balances(&self, account_id: &str) -> Result<Vec<Balance>> {
        let resp: BalancesResp = self.get(&format!("accounts/{account_id}/balances/"), &[]).await?;
        resp.balances
            .iter()
            .map(|b| {
                Ok(Balance {
                    amount: parse_amount(&b.balance_amount)?,
                    currency: b.balance_amount.currency.clone(),
                    balance_type: b.balance_type.clone(),
                })
            })
            .collect()
    }

    async fn get_account_transactions(
        &self,
        account_id: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<TransactionSnapshot>> {
        let query: Vec<(&str, String)> = match window {
            Some(w) => vec![
                ("date_from", w.from.format("%Y-%m-%d").to_string()),
                ("date_to", w.to.format("%Y-%m-%d").to_string()),
            ],
            None => Vec::new(),
        };
        let resp: TransactionsResp = self
            .get(&format!("accounts/{account_id}/transactions/"), &query)
            .await?;
        booked_snapshots(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::clock::SystemClock;
    use crate::token::MemoryCredentialStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_status_classification() {
        let r: Result<serde_json::Value> = parse_response(StatusCode::TOO_MANY_REQUESTS, b"slow down");
        assert!(matches!(r, Err(BankError::RateLimited)));

        let r: Result<serde_json::Value> = parse_response(StatusCode::UNAUTHORIZED, b"expired");
        assert!(matches!(r, Err(BankError::Unauthorized { status: 401, ref body }) if body == "expired"));
        let r: Result<serde_json::Value> = parse_response(StatusCode::FORBIDDEN, b"");
        assert!(matches!(r, Err(BankError::Unauthorized { status: 403, .. })));

        let r: Result<serde_json::Value> = parse_response(StatusCode::SERVICE_UNAVAILABLE, b"down");
        assert!(matches!(r, Err(BankError::Upstream { status: 503, ref body }) if body == "down"));
        let r: Result<serde_json::Value> = parse_response(StatusCode::NOT_FOUND, b"{}");
        assert!(matches!(r, Err(BankError::Upstream { status: 404, .. })));

        let r: Result<serde_json::Value> = parse_response(StatusCode::OK, b"not json");
        assert!(matches!(r, Err(BankError::Decode(_))));
        let r: serde_json::Value = parse_response(StatusCode::OK, br#"{"id": "x"}"#).unwrap();
        assert_eq!(r["id"], "x");
    }

    struct StaticTokens;

    #[async_trait]
    impl TokenClient for StaticTokens {
        async fn issue(&self, _secrets: &ClientSecrets) -> Result<IssuedTokens> {
            Ok(IssuedTokens {
                access: "access".to_string(),
                refresh: "refresh".to_string(),
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<String> {
            Ok("access".to_string())
        }
    }

    /// Answer one request per scripted response, closing each connection.
    async fn scripted_server(script: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for (status, body) in script {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn aggregator(base_url: &str) -> HttpAggregator {
        let http = build_client(Duration::from_secs(5)).unwrap();
        let tokens = Arc::new(TokenManager::new(
            Arc::new(StaticTokens),
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(SystemClock),
            ClientSecrets {
                secret_id: "id".to_string(),
                secret_key: "key".to_string(),
            },
            chrono::Duration::hours(1),
        ));
        HttpAggregator::new(http, base_url, tokens, BackoffPolicy::new(3, Duration::ZERO))
    }

    const NORDEA: &str = r#"{"id": "NORDEA_NDEADKKK", "name": "Nordea", "transaction_total_days": "730"}"#;

    #[tokio::test]
    async fn test_rate_limited_calls_are_retried() {
        let (url, hits) = scripted_server(vec![(429, ""), (429, ""), (200, NORDEA)]).await;
        let inst = aggregator(&url).get_institution("NORDEA_NDEADKKK").await.unwrap();
        assert_eq!(inst.name, "Nordea");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let (url, hits) = scripted_server(vec![(401, "token expired"), (200, NORDEA)]).await;
        let err = aggregator(&url).get_institution("NORDEA_NDEADKKK").await.unwrap_err();
        assert!(matches!(err, BankError::Unauthorized { status: 401, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let (url, hits) = scripted_server(vec![(503, "down"), (200, NORDEA)]).await;
        let err = aggregator(&url).get_institution("NORDEA_NDEADKKK").await.unwrap_err();
        assert!(matches!(err, BankError::Upstream { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_endpoint_joins_slashes() {
        assert_eq!(endpoint("https://x/api/v2/", "/token/new/"), "https://x/api/v2/token/new/");
        assert_eq!(endpoint("https://x/api/v2", "accounts/a/"), "https://x/api/v2/accounts/a/");
    }

    #[test]
    fn test_institution_days_as_string_or_number() {
        let json = r#"[
            {"id": "NORDEA_NDEADKKK", "name": "Nordea", "transaction_total_days": "730"},
            {"id": "DANSKEBANK_DABADKKK", "name": "Danske Bank", "transaction_total_days": 540},
            {"id": "SANDBOX", "name": "Sandbox"}
        ]"#;
        let parsed: Vec<InstitutionResp> = serde_json::from_str(json).unwrap();
        let list: Vec<Institution> = parsed.into_iter().map(Institution::from).collect();
        assert_eq!(list[0].transaction_total_days, Some(730));
        assert_eq!(list[1].transaction_total_days, Some(540));
        assert_eq!(list[2].transaction_total_days, None);
    }

    #[test]
    fn test_transactions_keep_booked_only_and_pick_description() {
        let json = r#"{"transactions": {
            "booked": [
                {"transactionId": "t1", "bookingDate": "2026-02-10",
                 "transactionAmount": {"amount": "-89.95", "currency": "DKK"},
                 "remittanceInformationUnstructured": "NETTO BUTIK 1234 Copenhagen"},
                {"internalTransactionId": "i2", "valueDate": "2026-02-11",
                 "transactionAmount": {"amount": "25000.00", "currency": "DKK"},
                 "remittanceInformationUnstructuredArray": ["LØN", "FEB"],
                 "debtorName": "ACME ApS"},
                {"bookingDate": "2026-02-12",
                 "transactionAmount": {"amount": "-1.00", "currency": "DKK"}}
            ],
            "pending": [
                {"transactionId": "p1", "transactionAmount": {"amount": "-5.00", "currency": "DKK"}}
            ]
        }}"#;
        let resp: TransactionsResp = serde_json::from_str(json).unwrap();
        let snaps = booked_snapshots(resp).unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].external_transaction_id, "t1");
        assert_eq!(snaps[0].amount, -89.95);
        assert_eq!(snaps[0].description, "NETTO BUTIK 1234 Copenhagen");
        assert_eq!(snaps[1].external_transaction_id, "i2");
        assert_eq!(snaps[1].description, "LØN FEB");
        assert_eq!(snaps[1].debtor_name.as_deref(), Some("ACME ApS"));
    }

    #[test]
    fn test_bad_amount_is_decode_error() {
        let json = r#"{"transactions": {"booked": [
            {"transactionId": "t1", "bookingDate": "2026-02-10",
             "transactionAmount": {"amount": "abc", "currency": "DKK"}}
        ]}}"#;
        let resp: TransactionsResp = serde_json::from_str(json).unwrap();
        assert!(matches!(booked_snapshots(resp), Err(BankError::Decode(_))));
    }

    #[test]
    fn test_requisition_page_parses() {
        let json = r#"{"count": 1, "next": null, "previous": null, "results": [
            {"id": "req-1", "status": "LN", "institution_id": "NORDEA_NDEADKKK",
             "reference": "link-42", "accounts": ["acc-1"], "link": "https://bank/auth"}
        ]}"#;
        let page: RequisitionPage = serde_json::from_str(json).unwrap();
        assert!(page.next.is_none());
        let link: RemoteLink = page.results.into_iter().next().unwrap().into();
        assert_eq!(link.reference, "link-42");
        assert_eq!(link.accounts, vec!["acc-1".to_string()]);
    }
}
