//! Loader port + idempotent persistence keyed on natural identity.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orenda_core::{
    owner_fingerprint, DomainError, Image, Listing, Owner, OwnerInfo, RawListing,
};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "orenda-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Load-phase port. Every write is an upsert: (source, external_id) for raw
/// and canonical listings, contact fingerprint for owners. Conflicts update
/// observational fields only; identity and creation timestamps stay put.
#[async_trait]
pub trait ListingLoader: Send + Sync {
    async fn save_raw(&self, raw: &RawListing) -> Result<RawListing, StorageError>;

    async fn save_listing(&self, listing: &Listing) -> Result<Listing, StorageError>;

    async fn bulk_save_raw(&self, raws: &[RawListing]) -> Result<Vec<RawListing>, StorageError>;

    async fn bulk_save_listings(
        &self,
        listings: &[Listing],
    ) -> Result<Vec<Listing>, StorageError>;
}

const RAW_INSERT_COLUMNS: &str = "INSERT INTO raw_listings \
    (source_id, external_id, payload, schema_version, fetch_url, fetched_at, \
     processing_status, processing_error, processed_at) ";

const RAW_CONFLICT_UPDATE: &str = " ON CONFLICT (source_id, external_id) DO UPDATE SET \
    payload = EXCLUDED.payload, \
    schema_version = EXCLUDED.schema_version, \
    fetch_url = EXCLUDED.fetch_url, \
    fetched_at = EXCLUDED.fetched_at, \
    processing_status = EXCLUDED.processing_status, \
    processing_error = EXCLUDED.processing_error, \
    processed_at = EXCLUDED.processed_at \
    RETURNING id, external_id";

const LISTING_INSERT_COLUMNS: &str = "INSERT INTO listings \
    (source_id, external_id, owner_id, url, title, fingerprint, \
     price_amount, price_currency, \
     address_country, address_state, address_city, address_district, \
     address_street, address_building, address_zip, \
     latitude, longitude, \
     room_count, area, floor, total_floors, description, \
     owner_name, owner_type_declared, \
     status, is_verified, view_count, first_seen_at, last_seen_at) ";

const LISTING_CONFLICT_UPDATE: &str = " ON CONFLICT (source_id, external_id) DO UPDATE SET \
    price_amount = EXCLUDED.price_amount, \
    price_currency = EXCLUDED.price_currency, \
    status = EXCLUDED.status, \
    view_count = EXCLUDED.view_count, \
    description = EXCLUDED.description, \
    owner_id = EXCLUDED.owner_id, \
    last_seen_at = EXCLUDED.last_seen_at, \
    updated_at = now() \
    RETURNING id, external_id, created_at, updated_at";

/// Keep the last occurrence per natural key; a paginating run can hand the
/// same id back twice and a multi-row upsert must not touch a row twice.
fn dedup_by_natural_key<'a, T, K>(items: &'a [T], key: K) -> Vec<&'a T>
where
    K: Fn(&T) -> (&str, &str),
{
    let mut by_key: HashMap<(String, String), &T> = HashMap::new();
    for item in items {
        let (source, external) = key(item);
        by_key.insert((source.to_string(), external.to_string()), item);
    }
    let mut deduped: Vec<&T> = by_key.into_values().collect();
    deduped.sort_by_key(|item| {
        let (source, external) = key(item);
        (source.to_string(), external.to_string())
    });
    deduped
}

pub struct PgListingLoader {
    pool: PgPool,
}

impl PgListingLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn get_or_create_source(
        tx: &mut Transaction<'_, Postgres>,
        code: &str,
    ) -> Result<i64, StorageError> {
        sqlx::query("INSERT INTO sources (code, name) VALUES ($1, $2) ON CONFLICT (code) DO NOTHING")
            .bind(code)
            .bind(code.to_uppercase())
            .execute(&mut **tx)
            .await?;

        let row = sqlx::query("SELECT id FROM sources WHERE code = $1")
            .bind(code)
            .fetch_one(&mut **tx)
            .await?;
        Ok(row.try_get("id")?)
    }

    /// Owner creation races resolve through the unique fingerprint
    /// constraint: insert-or-ignore, then read whichever row won.
    async fn get_or_create_owner(
        tx: &mut Transaction<'_, Postgres>,
        info: &OwnerInfo,
    ) -> Result<i64, StorageError> {
        let contact = info
            .contact
            .as_ref()
            .ok_or(DomainError::NoContactChannels)?;
        let fingerprint = owner_fingerprint(contact)?;

        sqlx::query(
            "INSERT INTO owners \
                (fingerprint, name, owner_type, contact_phone, contact_telegram, \
                 contact_viber, contact_whatsapp, contact_email) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (fingerprint) DO NOTHING",
        )
        .bind(&fingerprint)
        .bind(&info.name)
        .bind(info.owner_type.as_str())
        .bind(&contact.phone)
        .bind(&contact.telegram)
        .bind(&contact.viber)
        .bind(&contact.whatsapp)
        .bind(&contact.email)
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query("SELECT id FROM owners WHERE fingerprint = $1")
            .bind(&fingerprint)
            .fetch_one(&mut **tx)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn resolve_owner_id(
        tx: &mut Transaction<'_, Postgres>,
        listing: &Listing,
    ) -> Result<Option<i64>, StorageError> {
        if listing.owner_id.is_some() {
            return Ok(listing.owner_id);
        }
        match &listing.owner_info {
            Some(info) if info.contact.is_some() => {
                Ok(Some(Self::get_or_create_owner(tx, info).await?))
            }
            _ => Ok(None),
        }
    }

    async fn replace_photos(
        tx: &mut Transaction<'_, Postgres>,
        listing_id: i64,
        photos: &[Image],
    ) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM listing_photos WHERE listing_id = $1")
            .bind(listing_id)
            .execute(&mut **tx)
            .await?;

        if photos.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO listing_photos (listing_id, url, position) ");
        // position is the slot in the already-sorted set, not the source's
        // raw ordering value
        builder.push_values(photos.iter().enumerate(), |mut row, (position, photo)| {
            row.push_bind(listing_id)
                .push_bind(&photo.url)
                .push_bind(position as i32);
        });
        builder.build().execute(&mut **tx).await?;
        Ok(())
    }

    fn push_listing_values<'args>(
        builder: &mut QueryBuilder<'args, Postgres>,
        rows: &[(&'args Listing, Option<i64>)],
        source_id: i64,
    ) {
        builder.push_values(rows, |mut row, (listing, owner_id)| {
            let address = listing.address.as_ref();
            row.push_bind(source_id)
                .push_bind(&listing.external_id)
                .push_bind(*owner_id)
                .push_bind(&listing.url)
                .push_bind(&listing.title)
                .push_bind(&listing.fingerprint)
                .push_bind(listing.price.as_ref().map(|p| p.amount))
                .push_bind(listing.price.as_ref().map(|p| p.currency.as_str()))
                .push_bind(address.map(|a| a.country.as_str()))
                .push_bind(address.and_then(|a| a.state.as_deref()))
                .push_bind(address.map(|a| a.city.as_str()))
                .push_bind(address.and_then(|a| a.district.as_deref()))
                .push_bind(address.and_then(|a| a.street.as_deref()))
                .push_bind(address.and_then(|a| a.building.as_deref()))
                .push_bind(address.and_then(|a| a.zip_code.as_deref()))
                .push_bind(listing.location.map(|l| l.latitude))
                .push_bind(listing.location.map(|l| l.longitude))
                .push_bind(listing.room_count)
                .push_bind(listing.area)
                .push_bind(listing.floor)
                .push_bind(listing.total_floors)
                .push_bind(listing.description.as_deref())
                .push_bind(listing.owner_info.as_ref().and_then(|o| o.name.as_deref()))
                .push_bind(listing.owner_info.as_ref().map(|o| o.owner_type.as_str()))
                .push_bind(listing.status.as_str())
                .push_bind(listing.is_verified)
                .push_bind(listing.view_count)
                .push_bind(listing.first_seen_at)
                .push_bind(listing.last_seen_at);
        });
    }
}

#[async_trait]
impl ListingLoader for PgListingLoader {
    async fn save_raw(&self, raw: &RawListing) -> Result<RawListing, StorageError> {
        let mut tx = self.pool.begin().await?;
        let source_id = Self::get_or_create_source(&mut tx, raw.source_code()).await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(RAW_INSERT_COLUMNS);
        builder.push_values([raw], |mut row, raw| {
            row.push_bind(source_id)
                .push_bind(raw.external_id())
                .push_bind(raw.payload())
                .push_bind(raw.schema_version())
                .push_bind(raw.fetch_url())
                .push_bind(raw.fetched_at())
                .push_bind(raw.processing_status().as_str())
                .push_bind(raw.processing_error())
                .push_bind(raw.processed_at());
        });
        builder.push(RAW_CONFLICT_UPDATE);

        let row = builder.build().fetch_one(&mut *tx).await?;
        let id: i64 = row.try_get("id")?;
        tx.commit().await?;

        Ok(raw.clone().with_id(id))
    }

    async fn save_listing(&self, listing: &Listing) -> Result<Listing, StorageError> {
        let mut tx = self.pool.begin().await?;
        let source_id = Self::get_or_create_source(&mut tx, &listing.source_code).await?;
        let owner_id = Self::resolve_owner_id(&mut tx, listing).await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(LISTING_INSERT_COLUMNS);
        Self::push_listing_values(&mut builder, &[(listing, owner_id)], source_id);
        builder.push(LISTING_CONFLICT_UPDATE);

        let row = builder.build().fetch_one(&mut *tx).await?;
        let id: i64 = row.try_get("id")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        Self::replace_photos(&mut tx, id, &listing.photos).await?;
        tx.commit().await?;

        let mut stored = listing.clone();
        stored.id = id;
        stored.owner_id = owner_id;
        stored.created_at = created_at;
        stored.updated_at = updated_at;
        Ok(stored)
    }

    async fn bulk_save_raw(&self, raws: &[RawListing]) -> Result<Vec<RawListing>, StorageError> {
        if raws.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let source_id = Self::get_or_create_source(&mut tx, raws[0].source_code()).await?;

        let deduped = dedup_by_natural_key(raws, RawListing::natural_key);
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(RAW_INSERT_COLUMNS);
        builder.push_values(&deduped, |mut row, raw| {
            row.push_bind(source_id)
                .push_bind(raw.external_id())
                .push_bind(raw.payload())
                .push_bind(raw.schema_version())
                .push_bind(raw.fetch_url())
                .push_bind(raw.fetched_at())
                .push_bind(raw.processing_status().as_str())
                .push_bind(raw.processing_error())
                .push_bind(raw.processed_at());
        });
        builder.push(RAW_CONFLICT_UPDATE);

        let rows = builder.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let mut id_map: HashMap<String, i64> = HashMap::with_capacity(rows.len());
        for row in rows {
            id_map.insert(row.try_get("external_id")?, row.try_get("id")?);
        }
        debug!(saved = id_map.len(), "bulk upserted raw listings");

        Ok(raws
            .iter()
            .map(|raw| match id_map.get(raw.external_id()) {
                Some(&id) => raw.clone().with_id(id),
                None => raw.clone(),
            })
            .collect())
    }

    async fn bulk_save_listings(
        &self,
        listings: &[Listing],
    ) -> Result<Vec<Listing>, StorageError> {
        if listings.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let source_id = Self::get_or_create_source(&mut tx, &listings[0].source_code).await?;

        let deduped = dedup_by_natural_key(listings, Listing::natural_key);
        let mut rows_to_insert: Vec<(&Listing, Option<i64>)> = Vec::with_capacity(deduped.len());
        for listing in deduped {
            let owner_id = Self::resolve_owner_id(&mut tx, listing).await?;
            rows_to_insert.push((listing, owner_id));
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(LISTING_INSERT_COLUMNS);
        Self::push_listing_values(&mut builder, &rows_to_insert, source_id);
        builder.push(LISTING_CONFLICT_UPDATE);

        let rows = builder.build().fetch_all(&mut *tx).await?;

        struct StoredRow {
            id: i64,
            created_at: DateTime<Utc>,
            updated_at: DateTime<Utc>,
        }
        let mut stored_map: HashMap<String, StoredRow> = HashMap::with_capacity(rows.len());
        for row in rows {
            stored_map.insert(
                row.try_get("external_id")?,
                StoredRow {
                    id: row.try_get("id")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                },
            );
        }

        let owner_map: HashMap<&str, Option<i64>> = rows_to_insert
            .iter()
            .map(|(listing, owner_id)| (listing.external_id.as_str(), *owner_id))
            .collect();

        let mut stored_listings = Vec::with_capacity(listings.len());
        for listing in listings {
            let mut stored = listing.clone();
            if let Some(row) = stored_map.get(&listing.external_id) {
                stored.id = row.id;
                stored.created_at = row.created_at;
                stored.updated_at = row.updated_at;
                Self::replace_photos(&mut tx, row.id, &stored.photos).await?;
            }
            if let Some(owner_id) = owner_map.get(listing.external_id.as_str()) {
                stored.owner_id = *owner_id;
            }
            stored_listings.push(stored);
        }

        tx.commit().await?;
        debug!(saved = stored_listings.len(), "bulk upserted listings");
        Ok(stored_listings)
    }
}

/// In-memory loader with the same upsert semantics; backs pipeline tests and
/// dry local runs without a database.
#[derive(Debug, Default)]
pub struct MemoryListingLoader {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_raw_id: i64,
    next_listing_id: i64,
    next_owner_id: i64,
    raws: HashMap<(String, String), RawListing>,
    listings: HashMap<(String, String), Listing>,
    owners: HashMap<String, Owner>,
}

impl MemoryState {
    fn upsert_raw(&mut self, raw: &RawListing) -> RawListing {
        let key = (
            raw.source_code().to_string(),
            raw.external_id().to_string(),
        );
        let id = match self.raws.get(&key) {
            Some(existing) => existing.id().expect("stored raw always has an id"),
            None => {
                self.next_raw_id += 1;
                self.next_raw_id
            }
        };
        let stored = raw.clone().with_id(id);
        self.raws.insert(key, stored.clone());
        stored
    }

    fn get_or_create_owner(&mut self, info: &OwnerInfo) -> Result<i64, StorageError> {
        let contact = info
            .contact
            .as_ref()
            .ok_or(DomainError::NoContactChannels)?;
        let fingerprint = owner_fingerprint(contact)?;

        if let Some(owner) = self.owners.get(&fingerprint) {
            return Ok(owner.id);
        }

        self.next_owner_id += 1;
        let mut owner = Owner::new(self.next_owner_id, fingerprint.clone());
        owner.update_info(info.name.clone(), Some(info.owner_type), Some(contact.clone()));
        self.owners.insert(fingerprint, owner);
        Ok(self.next_owner_id)
    }

    fn upsert_listing(&mut self, listing: &Listing) -> Result<Listing, StorageError> {
        let owner_id = match (&listing.owner_id, &listing.owner_info) {
            (Some(id), _) => Some(*id),
            (None, Some(info)) if info.contact.is_some() => {
                Some(self.get_or_create_owner(info)?)
            }
            _ => None,
        };

        let key = (listing.source_code.clone(), listing.external_id.clone());
        let stored = match self.listings.get(&key) {
            Some(existing) => {
                let mut updated = existing.clone();
                // same mutable subset as the SQL conflict clause
                updated.price = listing.price.clone();
                updated.status = listing.status;
                updated.view_count = listing.view_count;
                updated.description = listing.description.clone();
                updated.owner_id = owner_id;
                updated.last_seen_at = listing.last_seen_at;
                updated.photos = listing.photos.clone();
                updated.updated_at = Utc::now();
                updated
            }
            None => {
                self.next_listing_id += 1;
                let mut created = listing.clone();
                created.id = self.next_listing_id;
                created.owner_id = owner_id;
                created
            }
        };
        self.listings.insert(key, stored.clone());
        Ok(stored)
    }
}

impl MemoryListingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn raw_count(&self) -> usize {
        self.state.lock().await.raws.len()
    }

    pub async fn listing_count(&self) -> usize {
        self.state.lock().await.listings.len()
    }

    pub async fn owner_count(&self) -> usize {
        self.state.lock().await.owners.len()
    }

    pub async fn get_raw(&self, source_code: &str, external_id: &str) -> Option<RawListing> {
        self.state
            .lock()
            .await
            .raws
            .get(&(source_code.to_string(), external_id.to_string()))
            .cloned()
    }

    pub async fn get_listing(&self, source_code: &str, external_id: &str) -> Option<Listing> {
        self.state
            .lock()
            .await
            .listings
            .get(&(source_code.to_string(), external_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ListingLoader for MemoryListingLoader {
    async fn save_raw(&self, raw: &RawListing) -> Result<RawListing, StorageError> {
        Ok(self.state.lock().await.upsert_raw(raw))
    }

    async fn save_listing(&self, listing: &Listing) -> Result<Listing, StorageError> {
        self.state.lock().await.upsert_listing(listing)
    }

    async fn bulk_save_raw(&self, raws: &[RawListing]) -> Result<Vec<RawListing>, StorageError> {
        let mut state = self.state.lock().await;
        Ok(raws.iter().map(|raw| state.upsert_raw(raw)).collect())
    }

    async fn bulk_save_listings(
        &self,
        listings: &[Listing],
    ) -> Result<Vec<Listing>, StorageError> {
        let mut state = self.state.lock().await;
        listings
            .iter()
            .map(|listing| state.upsert_listing(listing))
            .collect()
    }
}
