use axum::http::StatusCode;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use tally_core::AccountId;
use tally_infra::{Pagination, TransactionFilter};
use tally_ledger::{
    Account, CreateTransactionRequest, EntryRequest, LedgerEntry, PostedTransaction,
    TransactionHeader,
};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

/// Missing fields deserialize to their empty value so the validator can report them
/// with a specific code instead of a generic parse error.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateTransactionBody {
    pub idempotency_key: String,
    pub description: Option<String>,
    pub source: String,
    pub posted_at: Option<String>,
    pub entries: Vec<EntryBody>,
}

#[derive(Debug, Deserialize)]
pub struct EntryBody {
    #[serde(default)]
    pub account_id: String,
    pub amount: i64,
}

impl From<CreateTransactionBody> for CreateTransactionRequest {
    fn from(body: CreateTransactionBody) -> Self {
        CreateTransactionRequest {
            idempotency_key: body.idempotency_key,
            description: body.description.unwrap_or_default(),
            source: body.source,
            posted_at: body.posted_at,
            entries: body
                .entries
                .into_iter()
                .map(|e| EntryRequest {
                    account_id: e.account_id,
                    amount: e.amount,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateAccountBody {
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: String,
    pub currency: String,
}

/// Query string of `GET /transactions`. Everything arrives as text so each parameter
/// gets its own error code.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListTransactionsQuery {
    pub account_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

impl ListTransactionsQuery {
    pub fn into_filter(self) -> Result<(TransactionFilter, Pagination), axum::response::Response> {
        let account_id = match non_empty(self.account_id) {
            None => None,
            Some(raw) => Some(raw.parse::<AccountId>().map_err(|_| {
                errors::json_error(StatusCode::BAD_REQUEST, "invalid_account_id", "invalid account_id")
            })?),
        };
        let start_date = parse_date(self.start_date, "invalid_start_date", "invalid start_date (use RFC3339)")?;
        let end_date = parse_date(self.end_date, "invalid_end_date", "invalid end_date (use RFC3339)")?;
        let limit = parse_u32(self.limit, "invalid_limit", "limit must be a non-negative integer")?;
        let offset = parse_u32(self.offset, "invalid_offset", "offset must be a non-negative integer")?;

        Ok((
            TransactionFilter {
                account_id,
                start_date,
                end_date,
            },
            Pagination::new(limit, offset),
        ))
    }
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_date(
    raw: Option<String>,
    code: &'static str,
    message: &'static str,
) -> Result<Option<DateTime<Utc>>, axum::response::Response> {
    match non_empty(raw) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, code, message)),
    }
}

fn parse_u32(
    raw: Option<String>,
    code: &'static str,
    message: &'static str,
) -> Result<Option<u32>, axum::response::Response> {
    match non_empty(raw) {
        None => Ok(None),
        Some(s) => s
            .parse::<u32>()
            .map(Some)
            .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, code, message)),
    }
}

// -------------------------
// Response mapping
// -------------------------

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn header_to_json(h: &TransactionHeader) -> Value {
    json!({
        "id": h.id.to_string(),
        "idempotency_key": h.idempotency_key,
        "description": h.description.as_deref().unwrap_or_default(),
        "source": h.source.as_str(),
        "posted_at": timestamp(h.posted_at),
        "created_at": timestamp(h.created_at),
    })
}

fn entry_to_json(e: &LedgerEntry) -> Value {
    json!({
        "id": e.id.to_string(),
        "account_id": e.account_id.to_string(),
        "amount": e.amount,
        "currency": e.currency.as_str(),
    })
}

pub fn transaction_to_json(tx: &PostedTransaction) -> Value {
    let mut body = header_to_json(&tx.header);
    body["currency"] = json!(tx.currency().map(|c| c.as_str().to_string()));
    body["entries"] = Value::Array(tx.entries.iter().map(entry_to_json).collect());
    body
}

pub fn account_to_json(a: &Account) -> Value {
    json!({
        "id": a.id.to_string(),
        "name": a.name,
        "type": a.account_type.as_str(),
        "currency": a.currency.as_str(),
        "created_at": timestamp(a.created_at),
        "updated_at": timestamp(a.updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_means_no_filter_and_default_page() {
        let (filter, page) = ListTransactionsQuery::default().into_filter().unwrap();
        assert_eq!(filter, TransactionFilter::default());
        assert_eq!(page, Pagination::default());
    }

    #[test]
    fn query_values_are_parsed() {
        let id = AccountId::new();
        let (filter, page) = ListTransactionsQuery {
            account_id: Some(id.to_string()),
            start_date: Some("2025-01-01T00:00:00Z".to_string()),
            end_date: Some("".to_string()),
            limit: Some("500".to_string()),
            offset: Some("20".to_string()),
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.account_id, Some(id));
        assert!(filter.start_date.is_some());
        assert_eq!(filter.end_date, None);
        assert_eq!(page.limit, 200);
        assert_eq!(page.offset, 20);
    }

    #[test]
    fn bad_query_values_are_rejected() {
        let bad_date = ListTransactionsQuery {
            start_date: Some("January".to_string()),
            ..ListTransactionsQuery::default()
        };
        assert_eq!(bad_date.into_filter().unwrap_err().status(), StatusCode::BAD_REQUEST);

        let bad_limit = ListTransactionsQuery {
            limit: Some("-1".to_string()),
            ..ListTransactionsQuery::default()
        };
        assert_eq!(bad_limit.into_filter().unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_body_fields_become_empty_request_fields() {
        let body: CreateTransactionBody = serde_json::from_str(r#"{"source":"api"}"#).unwrap();
        let req = CreateTransactionRequest::from(body);
        assert_eq!(req.idempotency_key, "");
        assert_eq!(req.description, "");
        assert!(req.entries.is_empty());
    }
}
