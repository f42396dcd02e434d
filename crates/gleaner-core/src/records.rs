//! Raw source payloads and their normalization into domain records.
//!
//! Each source has an explicit optional-field struct. Unknown fields are
//! dropped by serde; known fields may arrive under several names (the
//! `alias` attributes). Normalization fails closed: a record that is not an
//! object, has a field of the wrong type, or lacks a required field is
//! rejected with [`AppError::SchemaReject`]. Rejection is per record, the
//! caller counts it and moves on.

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::models::{NewAddress, NewCreditCard, NewUser, RelatedKind, RelatedRecord};

/// Request for one page of a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Opaque cursor returned by the previous page.
    pub cursor: Option<String>,
    /// External id of the user being enriched, for per-parent sources.
    pub parent: Option<i64>,
}

impl PageRequest {
    pub fn for_parent(parent_external_id: i64) -> Self {
        Self {
            cursor: None,
            parent: Some(parent_external_id),
        }
    }
}

/// One page of loosely-typed items.
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub items: Vec<Value>,
    /// Cursor for the next page, `None` on the last page.
    pub next_cursor: Option<String>,
}

impl SourcePage {
    pub fn last(items: Vec<Value>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

// =============================================================================
// Users
// =============================================================================

/// User as served by JSONPlaceholder-like sources.
#[derive(Debug, Deserialize)]
pub struct RawUser {
    #[serde(alias = "user_id", alias = "external_id")]
    pub id: Option<Value>,
    #[serde(alias = "full_name")]
    pub name: Option<String>,
    #[serde(alias = "login", alias = "user_name")]
    pub username: Option<String>,
    #[serde(alias = "email_address")]
    pub email: Option<String>,
    #[serde(alias = "phone_number")]
    pub phone: Option<String>,
    #[serde(alias = "url")]
    pub website: Option<String>,
    pub company: Option<RawCompany>,
}

#[derive(Debug, Deserialize)]
pub struct RawCompany {
    pub name: Option<String>,
    #[serde(rename = "catchPhrase", alias = "catch_phrase")]
    pub catch_phrase: Option<String>,
    pub bs: Option<String>,
}

/// Normalizes one raw user item.
pub fn normalize_user(raw: &Value) -> Result<NewUser, AppError> {
    let raw = RawUser::deserialize(raw).map_err(|e| reject("user", e))?;

    let external_id = raw
        .id
        .as_ref()
        .and_then(external_id_from)
        .ok_or_else(|| AppError::SchemaReject("user: missing or invalid id".to_string()))?;

    let company = raw.company;
    Ok(NewUser {
        external_id,
        name: required("user", "name", raw.name)?,
        username: required("user", "username", raw.username)?,
        email: required("user", "email", raw.email)?,
        phone: optional(raw.phone),
        website: optional(raw.website),
        company_name: company.as_ref().and_then(|c| optional(c.name.clone())),
        company_catchphrase: company
            .as_ref()
            .and_then(|c| optional(c.catch_phrase.clone())),
        company_bs: company.and_then(|c| optional(c.bs)),
    })
}

// =============================================================================
// Addresses
// =============================================================================

/// Address as served by random-data-api-like sources.
#[derive(Debug, Deserialize)]
pub struct RawAddress {
    pub uid: Option<String>,
    #[serde(alias = "building_number")]
    pub street_number: Option<Value>,
    pub street_name: Option<String>,
    pub city: Option<String>,
    #[serde(alias = "province", alias = "region")]
    pub state: Option<String>,
    pub country: Option<String>,
    // Sources send several of these at once, so they are not serde aliases.
    pub postal_code: Option<Value>,
    pub zip_code: Option<Value>,
    pub zip: Option<Value>,
    pub postcode: Option<Value>,
}

/// Normalizes one raw address item fetched for `parent_external_id`.
pub fn normalize_address(raw: &Value, parent_external_id: i64) -> Result<NewAddress, AppError> {
    let raw = RawAddress::deserialize(raw).map_err(|e| reject("address", e))?;

    let street_name = required("address", "street_name", raw.street_name)?;
    let city = required("address", "city", raw.city)?;
    let country = required("address", "country", raw.country)?;
    let street_number = raw.street_number.as_ref().and_then(text_from);
    let state = optional(raw.state);
    let postal_code = [&raw.postal_code, &raw.zip_code, &raw.zip, &raw.postcode]
        .into_iter()
        .find_map(|v| v.as_ref().and_then(text_from));

    let source_key = optional(raw.uid).unwrap_or_else(|| {
        content_key(
            parent_external_id,
            &[
                street_number.as_deref(),
                Some(street_name.as_str()),
                Some(city.as_str()),
                state.as_deref(),
                Some(country.as_str()),
                postal_code.as_deref(),
            ],
        )
    });

    Ok(NewAddress {
        source_key,
        street_number,
        street_name: Some(street_name),
        city: Some(city),
        state,
        country: Some(country),
        postal_code,
    })
}

// =============================================================================
// Credit cards
// =============================================================================

/// Credit card as served by random-data-api-like sources.
#[derive(Debug, Deserialize)]
pub struct RawCreditCard {
    pub uid: Option<String>,
    #[serde(alias = "card_number")]
    pub credit_card_number: Option<String>,
    #[serde(alias = "card_type")]
    pub credit_card_type: Option<String>,
    #[serde(alias = "expiry_date", alias = "expiration_date")]
    pub credit_card_expiry_date: Option<String>,
}

/// Normalizes one raw credit card item fetched for `parent_external_id`.
pub fn normalize_credit_card(
    raw: &Value,
    parent_external_id: i64,
) -> Result<NewCreditCard, AppError> {
    let raw = RawCreditCard::deserialize(raw).map_err(|e| reject("credit card", e))?;

    let card_number = required("credit card", "credit_card_number", raw.credit_card_number)?;
    let card_type = required("credit card", "credit_card_type", raw.credit_card_type)?;
    let expiry_date = optional(raw.credit_card_expiry_date);

    let source_key = optional(raw.uid).unwrap_or_else(|| {
        content_key(
            parent_external_id,
            &[
                Some(card_number.as_str()),
                Some(card_type.as_str()),
                expiry_date.as_deref(),
            ],
        )
    });

    Ok(NewCreditCard {
        source_key,
        card_number: Some(card_number),
        card_type: Some(card_type),
        expiry_date,
    })
}

/// Normalizes a related item of the given kind.
pub fn normalize_related(
    kind: RelatedKind,
    raw: &Value,
    parent_external_id: i64,
) -> Result<RelatedRecord, AppError> {
    match kind {
        RelatedKind::Address => {
            normalize_address(raw, parent_external_id).map(RelatedRecord::Address)
        }
        RelatedKind::CreditCard => {
            normalize_credit_card(raw, parent_external_id).map(RelatedRecord::CreditCard)
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn reject(what: &str, err: serde_json::Error) -> AppError {
    AppError::SchemaReject(format!("{}: {}", what, err))
}

fn required(what: &str, field: &str, value: Option<String>) -> Result<String, AppError> {
    optional(value).ok_or_else(|| AppError::SchemaReject(format!("{}: missing {}", what, field)))
}

/// Trims and drops blank strings.
fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Accepts a positive integer id given as a number or a numeric string.
fn external_id_from(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|id| *id > 0)
}

/// Accepts a string or a number as text.
fn text_from(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => optional(Some(s.clone())),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// SHA-256 over the parent id and the normalized fields. Used as upstream
/// identity when the source does not provide a `uid`.
fn content_key(parent_external_id: i64, fields: &[Option<&str>]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent_external_id.to_string().as_bytes());
    for field in fields {
        hasher.update(b"\x1f");
        hasher.update(field.unwrap_or("").as_bytes());
    }
    hex::encode(hasher.finalize())
}
