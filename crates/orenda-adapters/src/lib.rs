//! Listing source contracts + the DomRia provider/normalizer pair.

use std::collections::BTreeMap;

use async_trait::async_trait;
use orenda_core::{
    Address, DomainError, GeoLocation, Image, Listing, ListingBuilder, Money, RawListing,
};
use orenda_http::{HttpRequest, PolicyClient, TransportError};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "orenda-adapters";

pub const DOMRIA_SOURCE: &str = "domria";

const DOMRIA_SEARCH_PATH: &str = "/node/searchEngine/v2/";
const DOMRIA_PHOTO_BASE: &str = "https://cdn.riastatic.com/";
const DOMRIA_BASE_DOMAIN: &str = "https://dom.ria.com";
const NO_TITLE: &str = "Без назви";

pub type SearchFilters = BTreeMap<String, String>;

/// One page of search results: external ids plus the cursor for the next
/// page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<String>,
    pub next_cursor: Option<u32>,
    pub total_count: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected status {status} fetching {url}")]
    Status { status: u16, url: String },
    #[error("decoding {context}: {source}")]
    Decode {
        context: &'static str,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("payload field {0} is missing or empty")]
    MissingField(&'static str),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Extract-phase port: paginated id search plus per-item fetch.
#[async_trait]
pub trait ListingProvider: Send + Sync {
    fn source_code(&self) -> &'static str;

    async fn search(
        &self,
        filters: Option<&SearchFilters>,
        cursor: Option<u32>,
    ) -> Result<Page, ProviderError>;

    async fn fetch(&self, ids: &[String]) -> Result<Vec<RawListing>, ProviderError>;
}

/// Transform-phase port: pure payload mapping, no I/O.
pub trait ListingNormalizer: Send + Sync {
    fn source_code(&self) -> &'static str;

    fn normalize(&self, raw: &RawListing) -> Result<Listing, NormalizeError>;
}

#[derive(Debug, Deserialize)]
struct DomRiaSearchBody {
    #[serde(default)]
    items: Vec<JsonValue>,
    #[serde(default)]
    count: Option<u64>,
}

pub struct DomRiaProvider {
    client: PolicyClient,
}

impl DomRiaProvider {
    pub fn new(client: PolicyClient) -> Self {
        Self { client }
    }

    /// Canonical long-term-rent search filters applied when the caller
    /// supplies none.
    pub fn default_filters() -> SearchFilters {
        [
            ("addMoreRealty", "false"),
            ("excludeSold", "1"),
            ("category", "1"),
            ("realty_type", "2"),
            ("operation", "3"),
            ("state_id", "0"),
            ("city_id", "0"),
            ("in_radius", "0"),
            ("with_newbuilds", "0"),
            ("price_cur", "1"),
            ("wo_dupl", "1"),
            ("sort", "created_at"),
            ("period", "0"),
            ("firstIteraction", "false"),
            ("limit", "20"),
            ("client", "searchV2"),
            ("type", "list"),
            ("operation_type", "3"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }
}

fn item_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ListingProvider for DomRiaProvider {
    fn source_code(&self) -> &'static str {
        DOMRIA_SOURCE
    }

    async fn search(
        &self,
        filters: Option<&SearchFilters>,
        cursor: Option<u32>,
    ) -> Result<Page, ProviderError> {
        let page = cursor.unwrap_or(0);
        let filters = filters.cloned().unwrap_or_else(Self::default_filters);

        let req = HttpRequest::get(DOMRIA_SEARCH_PATH)
            .with_params([("page".to_string(), page.to_string())])
            .with_params(filters);
        let resp = self.client.send(&req).await?;
        if !resp.status.is_success() {
            return Err(ProviderError::Status {
                status: resp.status.as_u16(),
                url: resp.final_url,
            });
        }

        let body: DomRiaSearchBody =
            serde_json::from_slice(&resp.body).map_err(|source| ProviderError::Decode {
                context: "search page",
                source,
            })?;

        let items: Vec<String> = body.items.iter().filter_map(item_id).collect();
        debug!(page, items = items.len(), "searched domria page");

        Ok(Page {
            items,
            next_cursor: Some(page + 1),
            total_count: body.count,
        })
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<RawListing>, ProviderError> {
        let mut raws = Vec::with_capacity(ids.len());
        for id in ids {
            let req = HttpRequest::get(format!("/realty/data/{id}"))
                .with_params([("lang_id", "4"), ("key", "")]);
            let resp = self.client.send(&req).await?;
            if !resp.status.is_success() {
                return Err(ProviderError::Status {
                    status: resp.status.as_u16(),
                    url: resp.final_url,
                });
            }

            let payload: JsonValue =
                serde_json::from_slice(&resp.body).map_err(|source| ProviderError::Decode {
                    context: "realty payload",
                    source,
                })?;

            raws.push(RawListing::new(DOMRIA_SOURCE, id, payload)?.with_fetch_url(resp.final_url));
        }
        Ok(raws)
    }
}

#[derive(Debug, Clone)]
pub struct DomRiaNormalizer {
    photo_base_url: String,
    base_domain: String,
}

impl Default for DomRiaNormalizer {
    fn default() -> Self {
        Self {
            photo_base_url: DOMRIA_PHOTO_BASE.to_string(),
            base_domain: DOMRIA_BASE_DOMAIN.to_string(),
        }
    }
}

/// Non-empty string at `key`, trimmed.
fn string_field(payload: &JsonValue, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Ukrainian-localized field with fallback to the plain one.
fn localized_field(payload: &JsonValue, key: &str) -> Option<String> {
    string_field(payload, &format!("{key}_uk")).or_else(|| string_field(payload, key))
}

fn i32_field(payload: &JsonValue, key: &str) -> Option<i32> {
    payload
        .get(key)
        .and_then(JsonValue::as_i64)
        .and_then(|v| i32::try_from(v).ok())
}

fn f64_field(payload: &JsonValue, key: &str) -> Option<f64> {
    payload.get(key).and_then(JsonValue::as_f64)
}

impl DomRiaNormalizer {
    fn build_url(&self, payload: &JsonValue) -> Option<String> {
        string_field(payload, "beautiful_url")
            .map(|beautiful_url| format!("{}/{}", self.base_domain, beautiful_url))
    }

    /// Composite title from type, rooms, area and place, with a sentinel when
    /// the payload carries none of them.
    fn build_title(&self, payload: &JsonValue) -> String {
        let mut parts: Vec<String> = Vec::new();

        if let Some(realty_type) = localized_field(payload, "realty_type_name") {
            parts.push(realty_type);
        }
        if let Some(rooms) = i32_field(payload, "rooms_count") {
            parts.push(format!("{rooms}-кімн."));
        }
        if let Some(area) = f64_field(payload, "total_square_meters") {
            parts.push(format!("{area} м²"));
        }
        if let Some(city) = localized_field(payload, "city_name") {
            parts.push(city);
        }
        if let Some(district) = localized_field(payload, "district_name") {
            parts.push(district);
        }

        if parts.is_empty() {
            NO_TITLE.to_string()
        } else {
            parts.join(", ")
        }
    }

    fn extract_price(&self, payload: &JsonValue) -> Result<Option<Money>, DomainError> {
        let Some(amount) = f64_field(payload, "price") else {
            return Ok(None);
        };

        let currency = match payload.get("currency_type_id").and_then(JsonValue::as_i64) {
            Some(1) => "USD",
            Some(2) => "EUR",
            _ => "UAH",
        };

        Money::new(amount, currency).map(Some)
    }

    fn extract_address(&self, payload: &JsonValue) -> Option<Address> {
        let city = localized_field(payload, "city_name")?;

        Some(Address {
            country: "Україна".to_string(),
            state: localized_field(payload, "state_name"),
            city,
            district: localized_field(payload, "district_name"),
            street: localized_field(payload, "street_name"),
            building: string_field(payload, "building_number_str"),
            zip_code: None,
        })
    }

    /// Combined "lat,lon" string or discrete fields; anything malformed or
    /// partial yields no geolocation.
    fn extract_location(&self, payload: &JsonValue) -> Option<GeoLocation> {
        if let Some(location) = string_field(payload, "location") {
            let mut parts = location.split(',');
            let latitude = parts.next()?.trim().parse::<f64>().ok()?;
            let longitude = parts.next()?.trim().parse::<f64>().ok()?;
            if parts.next().is_some() {
                return None;
            }
            return GeoLocation::new(latitude, longitude).ok();
        }

        let latitude = f64_field(payload, "latitude")?;
        let longitude = f64_field(payload, "longitude")?;
        GeoLocation::new(latitude, longitude).ok()
    }

    fn extract_photos(&self, payload: &JsonValue) -> Vec<Image> {
        let Some(photos) = payload.get("photos").and_then(JsonValue::as_object) else {
            return Vec::new();
        };

        let mut entries: Vec<&JsonValue> = photos.values().collect();
        // missing ordering sorts last
        entries.sort_by_key(|photo| {
            photo
                .get("ordering")
                .and_then(JsonValue::as_i64)
                .unwrap_or(999)
        });

        entries
            .iter()
            .filter_map(|photo| {
                let file = photo.get("file").and_then(JsonValue::as_str)?;
                let order = photo
                    .get("ordering")
                    .and_then(JsonValue::as_u64)
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(0);
                Image::new(format!("{}{}", self.photo_base_url, file), order).ok()
            })
            .collect()
    }
}

impl ListingNormalizer for DomRiaNormalizer {
    fn source_code(&self) -> &'static str {
        DOMRIA_SOURCE
    }

    fn normalize(&self, raw: &RawListing) -> Result<Listing, NormalizeError> {
        let payload = raw.payload();

        let external_id = payload
            .get("realty_id")
            .and_then(item_id)
            .ok_or(NormalizeError::MissingField("realty_id"))?;
        let url = self
            .build_url(payload)
            .ok_or(NormalizeError::MissingField("beautiful_url"))?;
        let title = self.build_title(payload);

        let mut builder: ListingBuilder =
            Listing::builder(raw.source_code(), external_id, url, title);

        if let Some(price) = self.extract_price(payload)? {
            builder = builder.price(price);
        }
        if let Some(address) = self.extract_address(payload) {
            builder = builder.address(address);
        }
        if let Some(location) = self.extract_location(payload) {
            builder = builder.location(location);
        }
        if let Some(rooms) = i32_field(payload, "rooms_count") {
            builder = builder.room_count(rooms);
        }
        if let Some(area) = f64_field(payload, "total_square_meters") {
            builder = builder.area(area);
        }
        if let Some(floor) = i32_field(payload, "floor") {
            builder = builder.floor(floor);
        }
        if let Some(total_floors) = i32_field(payload, "floors_count") {
            builder = builder.total_floors(total_floors);
        }
        if let Some(description) = localized_field(payload, "description") {
            builder = builder.description(description);
        }

        let photos = self.extract_photos(payload);
        if !photos.is_empty() {
            builder = builder.photos(photos);
        }

        Ok(builder.build()?)
    }
}
