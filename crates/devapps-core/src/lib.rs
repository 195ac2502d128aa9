//! Core domain model for Brisbane development applications: the raw feature
//! shape returned by the council's geo API, the canonical persisted record,
//! and the pure normalize/dedupe steps between them.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "devapps-core";

/// Base of the public details page; the application number is appended verbatim.
pub const DEFAULT_INFO_URL_BASE: &str =
    "https://developmenti.brisbane.qld.gov.au/Home/FilterDirect?filters=DANumber=";

/// Property bag attached to every feature. Every field is optional because the
/// source omits them freely.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureProperties {
    #[serde(default)]
    pub application_number: Option<String>,
    /// Combined `"<address> - <description>"` text.
    #[serde(default)]
    pub description: Option<String>,
    /// Stored as text whatever scalar the source sent.
    #[serde(default, deserialize_with = "scalar_as_text")]
    pub date_received: Option<String>,
}

fn scalar_as_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

/// One geographic feature record as returned by the remote source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawFeature {
    #[serde(default)]
    pub geometry: Option<JsonValue>,
    #[serde(default)]
    pub properties: Option<FeatureProperties>,
}

impl RawFeature {
    /// Key used for deduplication. Missing properties and missing numbers both
    /// map to the empty string.
    pub fn application_key(&self) -> &str {
        self.properties
            .as_ref()
            .and_then(|p| p.application_number.as_deref())
            .unwrap_or_default()
    }
}

/// Canonical persisted development application row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevelopmentApplication {
    pub application_number: String,
    pub address: String,
    pub description: String,
    pub info_url: String,
    pub date_scraped: String,
    pub date_received: Option<String>,
}

/// Split `"<address> - <description>"` on the first `-`.
///
/// Further dashes stay inside the description. Without any dash the whole
/// string is the address and the description is empty.
pub fn split_address_description(combined: &str) -> (String, String) {
    match combined.split_once('-') {
        Some((address, rest)) => (address.trim().to_string(), rest.trim().to_string()),
        None => (combined.trim().to_string(), String::new()),
    }
}

pub fn format_scrape_date(run_date: NaiveDate) -> String {
    run_date.format("%Y-%m-%d").to_string()
}

/// Map a raw feature into the canonical row. Total over every input.
pub fn normalize(
    feature: &RawFeature,
    run_date: NaiveDate,
    info_url_base: &str,
) -> DevelopmentApplication {
    let details = feature.properties.clone().unwrap_or_default();
    let (address, description) = details
        .description
        .as_deref()
        .map(split_address_description)
        .unwrap_or_default();
    let application_number = details.application_number.unwrap_or_default();

    DevelopmentApplication {
        info_url: format!("{info_url_base}{application_number}"),
        application_number,
        address,
        description,
        date_scraped: format_scrape_date(run_date),
        date_received: details.date_received,
    }
}

/// Keep the first feature seen for each application number, preserving order.
///
/// The source returns one feature per land parcel, so a single application can
/// appear many times with near-identical data. Features without a number all
/// share the empty key and collapse into one.
pub fn dedupe(features: Vec<RawFeature>) -> Vec<RawFeature> {
    let mut seen: HashSet<String> = HashSet::with_capacity(features.len());
    features
        .into_iter()
        .filter(|feature| seen.insert(feature.application_key().to_string()))
        .collect()
}
