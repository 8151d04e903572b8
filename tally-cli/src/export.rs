use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tally_core::{Account, Transaction};

#[derive(Debug, Serialize)]
struct Row<'a> {
    date: String,
    account: &'a str,
    amount: f64,
    currency: &'a str,
    description: &'a str,
    counterparty: &'a str,
    category: &'a str,
    source: &'a str,
    external_id: &'a str,
}

/// One CSV row per transaction, effective category resolved.
pub fn write_transactions<W: Write>(w: W, accounts: &[Account], txns: &[Transaction]) -> Result<usize> {
    let names: HashMap<i64, &str> = accounts.iter().map(|a| (a.id, a.name.as_str())).collect();
    let mut wtr = csv::Writer::from_writer(w);
    for t in txns {
        wtr.serialize(Row {
            date: t.date.format("%Y-%m-%d").to_string(),
            account: names.get(&t.account_id).copied().unwrap_or(""),
            amount: t.amount,
            currency: &t.currency,
            description: &t.description,
            counterparty: t
                .creditor_name
                .as_deref()
                .or(t.debtor_name.as_deref())
                .unwrap_or(""),
            category: t.effective_category(),
            source: t.category_source.as_str(),
            external_id: &t.external_transaction_id,
        })?;
    }
    wtr.flush()?;
    Ok(txns.len())
}

pub fn export_to_path(path: &Path, accounts: &[Account], txns: &[Transaction]) -> Result<usize> {
    let file = std::fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    write_transactions(file, accounts, txns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use tally_core::CategorySource;

    #[test]
    fn test_rows_use_effective_category_and_account_name() {
        let account = Account {
            id: 1,
            user_id: "u1".to_string(),
            external_account_id: "acc-1".to_string(),
            name: "Lønkonto".to_string(),
            iban: None,
            currency: "DKK".to_string(),
            balance: 0.0,
            last_updated: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        };
        let txn = Transaction {
            id: 7,
            account_id: 1,
            external_transaction_id: "t-7".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 2, 27).unwrap(),
            amount: -49.95,
            currency: "DKK".to_string(),
            description: "NETTO BUTIK 1234".to_string(),
            creditor_name: Some("Netto".to_string()),
            debtor_name: None,
            category: Some("Groceries".to_string()),
            user_category: Some("Food".to_string()),
            category_source: CategorySource::Manual,
        };

        let mut buf = Vec::new();
        assert_eq!(write_transactions(&mut buf, &[account], &[txn]).unwrap(), 1);
        let out = String::from_utf8(buf).unwrap();
        let mut lines = out.lines();
        assert_eq!(
            lines.next().unwrap(),
            "date,account,amount,currency,description,counterparty,category,source,external_id"
        );
        assert_eq!(
            lines.next().unwrap(),
            "2026-02-27,Lønkonto,-49.95,DKK,NETTO BUTIK 1234,Netto,Food,manual,t-7"
        );
    }
}
