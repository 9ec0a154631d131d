//! Canonical rental-listing domain model, fingerprinting and dedup services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "orenda-core";

/// Area delta (square meters) under which two same-address listings are
/// considered the same unit.
pub const AREA_TOLERANCE: f64 = 5.0;

const FINGERPRINT_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("amount cannot be negative")]
    NegativeAmount,
    #[error("currency must be a 3-letter code")]
    InvalidCurrency,
    #[error("latitude must be between -90 and 90")]
    LatitudeOutOfRange,
    #[error("longitude must be between -180 and 180")]
    LongitudeOutOfRange,
    #[error("image url cannot be empty")]
    EmptyImageUrl,
    #[error("rating must be between 0 and 5")]
    RatingOutOfRange,
    #[error("at least one contact channel is required for fingerprinting")]
    NoContactChannels,
}

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Money {
    pub amount: f64,
    pub currency: String,
}

impl Money {
    pub fn new(amount: f64, currency: impl Into<String>) -> Result<Self, DomainError> {
        let currency = currency.into();
        if amount < 0.0 {
            return Err(DomainError::NegativeAmount);
        }
        if currency.len() != 3 {
            return Err(DomainError::InvalidCurrency);
        }
        Ok(Self { amount, currency })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, DomainError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(DomainError::LatitudeOutOfRange);
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(DomainError::LongitudeOutOfRange);
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub country: String,
    pub state: Option<String>,
    pub city: String,
    pub district: Option<String>,
    pub street: Option<String>,
    pub building: Option<String>,
    pub zip_code: Option<String>,
}

impl Address {
    pub fn display_string(&self) -> String {
        let mut parts = vec![self.city.clone()];
        parts.extend(self.district.clone());
        parts.extend(self.street.clone());
        if let Some(building) = &self.building {
            parts.push(format!("building {building}"));
        }
        parts.join(", ")
    }

    /// Normalized key used for duplicate search across sources.
    pub fn search_key(&self) -> String {
        [
            Some(self.city.as_str()),
            self.district.as_deref(),
            self.street.as_deref(),
            self.building.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(|part| part.trim().to_lowercase())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("|")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
    pub order: u32,
}

impl Image {
    pub fn new(url: impl Into<String>, order: u32) -> Result<Self, DomainError> {
        let url = url.into();
        if url.is_empty() {
            return Err(DomainError::EmptyImageUrl);
        }
        Ok(Self { url, order })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub phone: Option<String>,
    pub telegram: Option<String>,
    pub viber: Option<String>,
    pub whatsapp: Option<String>,
    pub email: Option<String>,
}

impl ContactInfo {
    pub fn has_any_contact(&self) -> bool {
        [
            &self.phone,
            &self.telegram,
            &self.viber,
            &self.whatsapp,
            &self.email,
        ]
        .into_iter()
        .any(|channel| channel.is_some())
    }

    /// First available channel as (kind, value), in priority order.
    pub fn primary_contact(&self) -> Option<(&'static str, &str)> {
        if let Some(phone) = &self.phone {
            return Some(("phone", phone));
        }
        if let Some(telegram) = &self.telegram {
            return Some(("telegram", telegram));
        }
        if let Some(viber) = &self.viber {
            return Some(("viber", viber));
        }
        if let Some(whatsapp) = &self.whatsapp {
            return Some(("whatsapp", whatsapp));
        }
        if let Some(email) = &self.email {
            return Some(("email", email));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    Private,
    Realtor,
    Agency,
    #[default]
    Unknown,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::Private => "private",
            OwnerType::Realtor => "realtor",
            OwnerType::Agency => "agency",
            OwnerType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerInfo {
    pub name: Option<String>,
    pub owner_type: OwnerType,
    pub contact: Option<ContactInfo>,
}

impl OwnerInfo {
    pub fn is_realtor(&self) -> bool {
        matches!(self.owner_type, OwnerType::Realtor | OwnerType::Agency)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    #[default]
    Active,
    Rented,
    Removed,
    Duplicate,
    Archived,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::Rented => "rented",
            ListingStatus::Removed => "removed",
            ListingStatus::Duplicate => "duplicate",
            ListingStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Processed,
    Failed,
    Skipped,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Processed => "processed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
        }
    }
}

/// One fetch from a source, kept verbatim. Status transitions return a new
/// value; the record itself never mutates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    id: Option<i64>,
    source_code: String,
    external_id: String,
    payload: JsonValue,
    schema_version: String,
    fetch_url: Option<String>,
    fetched_at: DateTime<Utc>,
    processing_status: ProcessingStatus,
    processing_error: Option<String>,
    processed_at: Option<DateTime<Utc>>,
}

impl RawListing {
    pub fn new(
        source_code: impl Into<String>,
        external_id: impl Into<String>,
        payload: JsonValue,
    ) -> Result<Self, DomainError> {
        let source_code = source_code.into().trim().to_lowercase();
        let external_id = external_id.into().trim().to_string();
        if source_code.is_empty() {
            return Err(DomainError::MissingField("source_code"));
        }
        if external_id.is_empty() {
            return Err(DomainError::MissingField("external_id"));
        }
        Ok(Self {
            id: None,
            source_code,
            external_id,
            payload,
            schema_version: "1.0".to_string(),
            fetch_url: None,
            fetched_at: Utc::now(),
            processing_status: ProcessingStatus::Pending,
            processing_error: None,
            processed_at: None,
        })
    }

    pub fn with_fetch_url(mut self, fetch_url: impl Into<String>) -> Self {
        self.fetch_url = Some(fetch_url.into());
        self
    }

    pub fn with_schema_version(mut self, schema_version: impl Into<String>) -> Self {
        self.schema_version = schema_version.into();
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn fetch_url(&self) -> Option<&str> {
        self.fetch_url.as_deref()
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn processing_status(&self) -> ProcessingStatus {
        self.processing_status
    }

    pub fn processing_error(&self) -> Option<&str> {
        self.processing_error.as_deref()
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    /// Unique key within the whole system, independent of storage ids.
    pub fn natural_key(&self) -> (&str, &str) {
        (&self.source_code, &self.external_id)
    }

    pub fn mark_processing(mut self) -> Self {
        self.processing_status = ProcessingStatus::Processing;
        self
    }

    pub fn mark_processed(mut self) -> Self {
        self.processing_status = ProcessingStatus::Processed;
        self.processed_at = Some(Utc::now());
        self
    }

    pub fn mark_failed(mut self, error: impl Into<String>) -> Self {
        self.processing_status = ProcessingStatus::Failed;
        self.processing_error = Some(error.into());
        self.processed_at = Some(Utc::now());
        self
    }

    pub fn mark_skipped(mut self, reason: impl Into<String>) -> Self {
        self.processing_status = ProcessingStatus::Skipped;
        self.processing_error = Some(reason.into());
        self.processed_at = Some(Utc::now());
        self
    }
}

/// Canonical listing aggregate produced by normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub source_code: String,
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub fingerprint: String,
    pub owner_id: Option<i64>,
    pub owner_info: Option<OwnerInfo>,
    pub price: Option<Money>,
    pub address: Option<Address>,
    pub location: Option<GeoLocation>,
    pub room_count: Option<i32>,
    pub area: Option<f64>,
    pub floor: Option<i32>,
    pub total_floors: Option<i32>,
    pub description: Option<String>,
    pub photos: Vec<Image>,
    pub status: ListingStatus,
    pub is_verified: bool,
    pub view_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn builder(
        source_code: impl Into<String>,
        external_id: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
    ) -> ListingBuilder {
        ListingBuilder {
            source_code: source_code.into(),
            external_id: external_id.into(),
            url: url.into(),
            title: title.into(),
            owner_id: None,
            owner_info: None,
            price: None,
            address: None,
            location: None,
            room_count: None,
            area: None,
            floor: None,
            total_floors: None,
            description: None,
            photos: Vec::new(),
            status: ListingStatus::Active,
            fingerprint: None,
            first_seen_at: None,
            last_seen_at: None,
        }
    }

    pub fn natural_key(&self) -> (&str, &str) {
        (&self.source_code, &self.external_id)
    }

    /// Links the listing to a stored owner row.
    pub fn assign_owner(&mut self, owner_id: i64) {
        self.owner_id = Some(owner_id);
        self.updated_at = Utc::now();
    }

    pub fn update_price(&mut self, new_price: Money) {
        if self.price.as_ref() != Some(&new_price) {
            self.price = Some(new_price);
            self.updated_at = Utc::now();
        }
    }

    /// Records that the listing was found again in a later run.
    pub fn mark_seen(&mut self) {
        self.last_seen_at = Utc::now();
        self.updated_at = self.last_seen_at;
    }

    pub fn change_status(&mut self, new_status: ListingStatus) {
        if self.status != new_status {
            self.status = new_status;
            self.updated_at = Utc::now();
        }
    }

    pub fn mark_verified(&mut self) {
        self.is_verified = true;
        self.updated_at = Utc::now();
    }

    pub fn increment_views(&mut self) {
        self.view_count += 1;
        self.updated_at = Utc::now();
    }

    pub fn is_from_realtor(&self) -> bool {
        self.owner_info
            .as_ref()
            .is_some_and(OwnerInfo::is_realtor)
    }

    /// Two-tier duplicate check: exact fingerprint match, or matching address
    /// key with the same rooms/floor and an area delta under the tolerance.
    pub fn is_duplicate_of(&self, other: &Listing) -> bool {
        if self.fingerprint == other.fingerprint {
            return true;
        }

        if let (Some(address), Some(other_address)) = (&self.address, &other.address) {
            let same_address = address.search_key() == other_address.search_key();
            let same_params = self.room_count == other.room_count
                && self.floor == other.floor
                && (self.area.unwrap_or(0.0) - other.area.unwrap_or(0.0)).abs() < AREA_TOLERANCE;
            return same_address && same_params;
        }

        false
    }
}

fn derive_fingerprint(
    address: Option<&Address>,
    room_count: Option<i32>,
    area: Option<f64>,
    floor: Option<i32>,
    source_code: &str,
    external_id: &str,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(address) = address {
        let key = address.search_key();
        if !key.is_empty() {
            parts.push(key);
        }
    }
    if let Some(rooms) = room_count {
        parts.push(format!("rooms:{rooms}"));
    }
    if let Some(area) = area {
        // One decimal place so near-identical areas collapse together.
        parts.push(format!("area:{area:.1}"));
    }
    if let Some(floor) = floor {
        parts.push(format!("floor:{floor}"));
    }

    if parts.is_empty() {
        parts.push(source_code.to_string());
        parts.push(external_id.to_string());
    }

    hash_key(&parts.join("|"))
}

pub struct ListingBuilder {
    source_code: String,
    external_id: String,
    url: String,
    title: String,
    owner_id: Option<i64>,
    owner_info: Option<OwnerInfo>,
    price: Option<Money>,
    address: Option<Address>,
    location: Option<GeoLocation>,
    room_count: Option<i32>,
    area: Option<f64>,
    floor: Option<i32>,
    total_floors: Option<i32>,
    description: Option<String>,
    photos: Vec<Image>,
    status: ListingStatus,
    fingerprint: Option<String>,
    first_seen_at: Option<DateTime<Utc>>,
    last_seen_at: Option<DateTime<Utc>>,
}

impl ListingBuilder {
    pub fn owner_id(mut self, owner_id: i64) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn owner_info(mut self, owner_info: OwnerInfo) -> Self {
        self.owner_info = Some(owner_info);
        self
    }

    pub fn price(mut self, price: Money) -> Self {
        self.price = Some(price);
        self
    }

    pub fn address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn location(mut self, location: GeoLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn room_count(mut self, room_count: i32) -> Self {
        self.room_count = Some(room_count);
        self
    }

    pub fn area(mut self, area: f64) -> Self {
        self.area = Some(area);
        self
    }

    pub fn floor(mut self, floor: i32) -> Self {
        self.floor = Some(floor);
        self
    }

    pub fn total_floors(mut self, total_floors: i32) -> Self {
        self.total_floors = Some(total_floors);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn photos(mut self, photos: Vec<Image>) -> Self {
        self.photos = photos;
        self
    }

    pub fn status(mut self, status: ListingStatus) -> Self {
        self.status = status;
        self
    }

    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn first_seen_at(mut self, first_seen_at: DateTime<Utc>) -> Self {
        self.first_seen_at = Some(first_seen_at);
        self
    }

    pub fn last_seen_at(mut self, last_seen_at: DateTime<Utc>) -> Self {
        self.last_seen_at = Some(last_seen_at);
        self
    }

    pub fn build(self) -> Result<Listing, DomainError> {
        let source_code = self.source_code.trim().to_lowercase();
        let external_id = self.external_id.trim().to_string();
        let url = self.url.trim().to_string();
        let title = self.title.trim().to_string();

        if source_code.is_empty() {
            return Err(DomainError::MissingField("source_code"));
        }
        if external_id.is_empty() {
            return Err(DomainError::MissingField("external_id"));
        }
        if url.is_empty() {
            return Err(DomainError::MissingField("url"));
        }
        if title.is_empty() {
            return Err(DomainError::MissingField("title"));
        }

        let fingerprint = self.fingerprint.unwrap_or_else(|| {
            derive_fingerprint(
                self.address.as_ref(),
                self.room_count,
                self.area,
                self.floor,
                &source_code,
                &external_id,
            )
        });

        let now = Utc::now();
        Ok(Listing {
            id: -1,
            source_code,
            external_id,
            url,
            title,
            fingerprint,
            owner_id: self.owner_id,
            owner_info: self.owner_info,
            price: self.price,
            address: self.address,
            location: self.location,
            room_count: self.room_count,
            area: self.area,
            floor: self.floor,
            total_floors: self.total_floors,
            description: self.description,
            photos: self.photos,
            status: self.status,
            is_verified: false,
            view_count: 0,
            first_seen_at: self.first_seen_at.unwrap_or(now),
            last_seen_at: self.last_seen_at.unwrap_or(now),
            created_at: now,
            updated_at: now,
        })
    }
}

/// Owner aggregate unifying listings across sources by contact fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    pub id: i64,
    pub fingerprint: String,
    pub name: Option<String>,
    pub owner_type: OwnerType,
    pub contact: Option<ContactInfo>,
    pub rating: f64,
    pub listing_count: i64,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Owner {
    pub fn new(id: i64, fingerprint: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            fingerprint: fingerprint.into(),
            name: None,
            owner_type: OwnerType::Unknown,
            contact: None,
            rating: 0.0,
            listing_count: 0,
            verified: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn update_info(
        &mut self,
        name: Option<String>,
        owner_type: Option<OwnerType>,
        contact: Option<ContactInfo>,
    ) {
        if let Some(name) = name {
            self.name = Some(name);
        }
        if let Some(owner_type) = owner_type {
            self.owner_type = owner_type;
        }
        if let Some(contact) = contact {
            self.contact = Some(contact);
        }
        self.updated_at = Utc::now();
    }

    pub fn increment_listing_count(&mut self) {
        self.listing_count += 1;
        self.updated_at = Utc::now();
    }

    pub fn decrement_listing_count(&mut self) {
        if self.listing_count > 0 {
            self.listing_count -= 1;
        }
        self.updated_at = Utc::now();
    }

    pub fn update_rating(&mut self, new_rating: f64) -> Result<(), DomainError> {
        if !(0.0..=5.0).contains(&new_rating) {
            return Err(DomainError::RatingOutOfRange);
        }
        self.rating = new_rating;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_verified(&mut self) {
        self.verified = true;
        self.updated_at = Utc::now();
    }

    pub fn is_suspicious(&self) -> bool {
        matches!(self.owner_type, OwnerType::Realtor | OwnerType::Agency)
            || self.listing_count > 10
            || self.rating < 2.0
    }
}

/// Fingerprint built from normalized contact channels, in a fixed channel
/// order independent of which channels were supplied. Zero usable channels is
/// an error, never a placeholder.
pub fn owner_fingerprint(contact: &ContactInfo) -> Result<String, DomainError> {
    let mut parts: Vec<String> = Vec::new();

    if let Some(phone) = &contact.phone {
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        if !digits.is_empty() {
            parts.push(format!("phone:{digits}"));
        }
    }
    if let Some(email) = &contact.email {
        let email = email.trim().to_lowercase();
        if !email.is_empty() {
            parts.push(format!("email:{email}"));
        }
    }
    if let Some(telegram) = &contact.telegram {
        let handle = telegram.trim().to_lowercase();
        let handle = handle.trim_start_matches('@');
        if !handle.is_empty() {
            parts.push(format!("tg:{handle}"));
        }
    }

    if parts.is_empty() {
        return Err(DomainError::NoContactChannels);
    }

    parts.sort();
    Ok(hash_key(&parts.join("|")))
}

/// Fingerprint-first duplicate detection over a candidate set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateDetector;

impl DuplicateDetector {
    pub fn find_duplicates<'a>(
        &self,
        listing: &Listing,
        candidates: &'a [Listing],
    ) -> Vec<&'a Listing> {
        candidates
            .iter()
            .filter(|candidate| listing.id != candidate.id && listing.is_duplicate_of(candidate))
            .collect()
    }

    /// Marks every duplicate and pulls the primary's first-seen timestamp
    /// back to the earliest sighting across the merged set.
    pub fn merge_duplicates(&self, primary: &mut Listing, duplicates: &mut [Listing]) {
        for duplicate in duplicates.iter_mut() {
            duplicate.change_status(ListingStatus::Duplicate);
        }

        if let Some(earliest) = duplicates.iter().map(|d| d.first_seen_at).min() {
            if earliest < primary.first_seen_at {
                primary.first_seen_at = earliest;
            }
        }
    }
}

/// The one place listing counters change.
pub fn link_listing_to_owner(listing: &mut Listing, owner: &mut Owner) {
    listing.assign_owner(owner.id);
    owner.increment_listing_count();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn kyiv_address() -> Address {
        Address {
            country: "Україна".to_string(),
            state: Some("Київська".to_string()),
            city: "Київ".to_string(),
            district: Some("Печерський".to_string()),
            street: Some("Хрещатик".to_string()),
            building: Some("12".to_string()),
            zip_code: None,
        }
    }

    fn base_listing() -> Listing {
        Listing::builder("domria", "101", "https://dom.ria.com/101", "2-кімн. квартира")
            .address(kyiv_address())
            .room_count(2)
            .area(54.3)
            .floor(3)
            .build()
            .expect("valid listing")
    }

    #[test]
    fn fingerprint_is_deterministic_for_identical_attributes() {
        let a = base_listing();
        let b = Listing::builder("domria", "999", "https://dom.ria.com/999", "other title")
            .address(kyiv_address())
            .room_count(2)
            .area(54.3)
            .floor(3)
            .build()
            .expect("valid listing");

        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn fingerprint_changes_when_any_key_attribute_changes() {
        let base = base_listing();

        let different_floor =
            Listing::builder("domria", "101", "https://dom.ria.com/101", "2-кімн. квартира")
                .address(kyiv_address())
                .room_count(2)
                .area(54.3)
                .floor(4)
                .build()
                .expect("valid listing");
        let different_area =
            Listing::builder("domria", "101", "https://dom.ria.com/101", "2-кімн. квартира")
                .address(kyiv_address())
                .room_count(2)
                .area(60.0)
                .floor(3)
                .build()
                .expect("valid listing");

        assert_ne!(base.fingerprint, different_floor.fingerprint);
        assert_ne!(base.fingerprint, different_area.fingerprint);
    }

    #[test]
    fn fingerprint_falls_back_to_natural_key_without_attributes() {
        let a = Listing::builder("domria", "101", "https://dom.ria.com/101", "no details")
            .build()
            .expect("valid listing");
        let b = Listing::builder("domria", "102", "https://dom.ria.com/102", "no details")
            .build()
            .expect("valid listing");

        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn area_is_rounded_to_one_decimal_for_fingerprinting() {
        let a = Listing::builder("domria", "101", "https://dom.ria.com/101", "t")
            .address(kyiv_address())
            .area(54.31)
            .build()
            .expect("valid listing");
        let b = Listing::builder("domria", "102", "https://dom.ria.com/102", "t")
            .address(kyiv_address())
            .area(54.29)
            .build()
            .expect("valid listing");

        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn listing_requires_identity_fields() {
        let err = Listing::builder("domria", "101", "", "title")
            .build()
            .unwrap_err();
        assert_eq!(err, DomainError::MissingField("url"));

        let err = Listing::builder("domria", "101", "https://x", "  ")
            .build()
            .unwrap_err();
        assert_eq!(err, DomainError::MissingField("title"));
    }

    #[test]
    fn money_and_geolocation_validate_ranges() {
        assert_eq!(
            Money::new(-1.0, "UAH").unwrap_err(),
            DomainError::NegativeAmount
        );
        assert_eq!(
            Money::new(100.0, "HRYVNIA").unwrap_err(),
            DomainError::InvalidCurrency
        );
        assert_eq!(
            GeoLocation::new(90.5, 30.0).unwrap_err(),
            DomainError::LatitudeOutOfRange
        );
        assert_eq!(
            GeoLocation::new(50.4, 181.0).unwrap_err(),
            DomainError::LongitudeOutOfRange
        );
        assert!(GeoLocation::new(50.45, 30.52).is_ok());
    }

    #[test]
    fn raw_listing_transitions_are_copies() {
        let raw = RawListing::new("DomRia", "101", json!({"realty_id": 101})).expect("valid raw");
        assert_eq!(raw.source_code(), "domria");
        assert_eq!(raw.processing_status(), ProcessingStatus::Pending);
        assert!(raw.processed_at().is_none());

        let failed = raw.clone().mark_failed("missing title");
        assert_eq!(failed.processing_status(), ProcessingStatus::Failed);
        assert_eq!(failed.processing_error(), Some("missing title"));
        assert!(failed.processed_at().is_some());
        // the original value is untouched
        assert_eq!(raw.processing_status(), ProcessingStatus::Pending);

        let processed = raw.mark_processed();
        assert_eq!(processed.processing_status(), ProcessingStatus::Processed);
        assert!(processed.processing_error().is_none());
    }

    #[test]
    fn owner_fingerprint_is_channel_order_independent() {
        let phone_first = ContactInfo {
            phone: Some("+380 (67) 123-45-67".to_string()),
            email: Some("Owner@Example.COM ".to_string()),
            ..ContactInfo::default()
        };
        let email_first = ContactInfo {
            email: Some("owner@example.com".to_string()),
            phone: Some("380671234567".to_string()),
            ..ContactInfo::default()
        };

        assert_eq!(
            owner_fingerprint(&phone_first).unwrap(),
            owner_fingerprint(&email_first).unwrap()
        );
    }

    #[test]
    fn owner_fingerprint_normalizes_telegram_handles() {
        let with_at = ContactInfo {
            telegram: Some("@Landlord".to_string()),
            ..ContactInfo::default()
        };
        let without_at = ContactInfo {
            telegram: Some("landlord".to_string()),
            ..ContactInfo::default()
        };

        assert_eq!(
            owner_fingerprint(&with_at).unwrap(),
            owner_fingerprint(&without_at).unwrap()
        );
    }

    #[test]
    fn owner_fingerprint_fails_without_channels() {
        assert_eq!(
            owner_fingerprint(&ContactInfo::default()).unwrap_err(),
            DomainError::NoContactChannels
        );
        // viber/whatsapp alone never feed the fingerprint
        let unusable = ContactInfo {
            viber: Some("380671234567".to_string()),
            ..ContactInfo::default()
        };
        assert_eq!(
            owner_fingerprint(&unusable).unwrap_err(),
            DomainError::NoContactChannels
        );
    }

    #[test]
    fn duplicate_detection_matches_fingerprint_or_fuzzy_address() {
        let primary = base_listing();

        let mut exact = base_listing();
        exact.id = 2;
        assert!(primary.is_duplicate_of(&exact));

        // different fingerprint (area off by 3), same address and params
        let mut fuzzy = Listing::builder("olx", "555", "https://olx.ua/555", "same flat")
            .address(kyiv_address())
            .room_count(2)
            .area(57.0)
            .floor(3)
            .build()
            .expect("valid listing");
        fuzzy.id = 3;
        assert_ne!(primary.fingerprint, fuzzy.fingerprint);
        assert!(primary.is_duplicate_of(&fuzzy));

        // area delta at the tolerance boundary is not a duplicate
        let mut distinct = Listing::builder("olx", "556", "https://olx.ua/556", "bigger flat")
            .address(kyiv_address())
            .room_count(2)
            .area(59.3)
            .floor(3)
            .build()
            .expect("valid listing");
        distinct.id = 4;
        assert!(!primary.is_duplicate_of(&distinct));
    }

    #[test]
    fn merge_keeps_primary_and_adopts_earliest_first_seen() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 8, 9, 30, 0).single().unwrap();

        let mut primary = base_listing();
        primary.first_seen_at = t0;
        let mut duplicate = base_listing();
        duplicate.id = 2;
        duplicate.first_seen_at = t1;

        let detector = DuplicateDetector;
        let mut duplicates = vec![duplicate];
        detector.merge_duplicates(&mut primary, &mut duplicates);

        assert_eq!(primary.status, ListingStatus::Active);
        assert_eq!(duplicates[0].status, ListingStatus::Duplicate);
        assert_eq!(primary.first_seen_at, t1);
    }

    #[test]
    fn owner_linking_is_the_only_counter_path() {
        let mut listing = base_listing();
        let mut owner = Owner::new(7, "fp");

        link_listing_to_owner(&mut listing, &mut owner);

        assert_eq!(listing.owner_id, Some(7));
        assert_eq!(owner.listing_count, 1);
    }

    #[test]
    fn address_search_key_lowercases_and_skips_blanks() {
        let address = Address {
            country: "Україна".to_string(),
            state: None,
            city: " Київ ".to_string(),
            district: None,
            street: Some("Хрещатик".to_string()),
            building: Some("".to_string()),
            zip_code: None,
        };
        assert_eq!(address.search_key(), "київ|хрещатик");
    }

    #[test]
    fn intent_revealing_mutators_touch_updated_at() {
        let mut listing = base_listing();
        let before = listing.updated_at;

        listing.increment_views();
        assert_eq!(listing.view_count, 1);
        assert!(listing.updated_at >= before);

        listing.change_status(ListingStatus::Rented);
        assert_eq!(listing.status, ListingStatus::Rented);

        listing.update_price(Money::new(18000.0, "UAH").unwrap());
        assert_eq!(listing.price.as_ref().unwrap().amount, 18000.0);

        listing.mark_verified();
        assert!(listing.is_verified);
    }

    #[test]
    fn owner_rating_is_bounded() {
        let mut owner = Owner::new(1, "fp");
        assert_eq!(
            owner.update_rating(5.5).unwrap_err(),
            DomainError::RatingOutOfRange
        );
        owner.update_rating(4.5).unwrap();
        assert_eq!(owner.rating, 4.5);
    }
}
