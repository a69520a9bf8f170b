//! Country resolution: keep a usable upstream country value, otherwise ask
//! the fallback listing and normalize what it returns.

use std::collections::BTreeSet;

use fts_storage::FetchError;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{FundingSource, Resource};

/// Placeholder country values that upstream uses when it has no real answer.
/// A missing value is treated the same way.
pub const COUNTRY_BLACKLIST: [&str; 4] = ["Region", "none", "", "null"];

/// Emitted when no usable country can be resolved.
pub const NO_COUNTRIES: &str = "N/A";

pub fn is_blacklisted(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(value) => COUNTRY_BLACKLIST.contains(&value.trim()),
    }
}

/// Where the fallback country listing for an entity lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CountryLookup {
    /// Projects funded under an appeal, one `{country}` object each.
    Appeal(String),
    /// Emergency funding grouped by country, `{grouping: [{type}]}`.
    Emergency(String),
}

impl CountryLookup {
    pub fn resource(&self) -> Resource {
        Resource::Countries(self.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupingEntry {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CountryEntry {
    #[serde(default)]
    pub country: Option<String>,
}

/// The two shapes the fallback endpoints answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountryListing {
    Grouping(Vec<GroupingEntry>),
    Flat(Vec<CountryEntry>),
}

impl CountryListing {
    /// Picks the variant by the document's outer shape: an object carrying a
    /// `grouping` key, or a bare array.
    pub fn decode(doc: JsonValue) -> Result<Self, String> {
        match doc {
            JsonValue::Object(mut map) => match map.remove("grouping") {
                Some(grouping) => serde_json::from_value(grouping)
                    .map(CountryListing::Grouping)
                    .map_err(|err| format!("invalid `grouping` list: {err}")),
                None => Err("object without a `grouping` key".to_string()),
            },
            doc @ JsonValue::Array(_) => serde_json::from_value(doc)
                .map(CountryListing::Flat)
                .map_err(|err| format!("invalid country list: {err}")),
            _ => Err("expected a `grouping` object or a country list".to_string()),
        }
    }

    pub fn names(&self) -> Vec<Option<&str>> {
        match self {
            CountryListing::Grouping(entries) => {
                entries.iter().map(|e| e.kind.as_deref()).collect()
            }
            CountryListing::Flat(entries) => {
                entries.iter().map(|e| e.country.as_deref()).collect()
            }
        }
    }
}

/// Distinct usable names, double-quoted and comma-joined in sorted order, or
/// [`NO_COUNTRIES`] when none are left.
pub fn normalize_countries<'a>(names: impl IntoIterator<Item = Option<&'a str>>) -> String {
    let distinct: BTreeSet<&str> = names
        .into_iter()
        .filter(|name| !is_blacklisted(*name))
        .flatten()
        .map(str::trim)
        .collect();

    if distinct.is_empty() {
        return NO_COUNTRIES.to_string();
    }
    distinct
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(",")
}

/// Returns `raw` trimmed when usable, otherwise the normalized fallback
/// listing.
pub async fn resolve_countries<S>(
    source: &S,
    raw: Option<&str>,
    lookup: &CountryLookup,
) -> Result<String, FetchError>
where
    S: FundingSource + ?Sized,
{
    if let Some(value) = raw {
        if !is_blacklisted(Some(value)) {
            return Ok(value.trim().to_string());
        }
    }
    let listing = source.fetch_countries(lookup).await?;
    Ok(normalize_countries(listing.names()))
}
