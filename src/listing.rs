//! Listing Repository
//!
//! Vehicle listings stored in the `cars` collection, and the operations
//! the dashboard and public pages run against it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::assets::{AssetState, ImageAsset};
use crate::auth::Session;
use crate::backend::{
    timestamp_from_value, timestamp_value, BackendError, DocumentStore, Fields, Filter,
    ObjectStorage, Record,
};

/// Document collection holding listings
pub const LISTINGS_COLLECTION: &str = "cars";

const WHATSAPP_SEND_URL: &str = "https://api.whatsapp.com/send";

/// Descriptive fields of a vehicle, as entered in the form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingFields {
    pub name: String,
    pub model: String,
    pub year: String,
    pub km: String,
    pub price: String,
    pub city: String,
    pub description: String,
    pub whatsapp: String,
}

/// A vehicle for sale
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: String,
    #[serde(flatten)]
    pub fields: ListingFields,
    /// Display name of the seller
    pub owner: String,
    pub owner_uid: String,
    pub created_at: Option<DateTime<Utc>>,
    pub images: Vec<ImageAsset>,
}

impl Listing {
    /// Decode a stored document
    pub fn from_record(record: Record) -> Result<Self, ListingError> {
        let id = record.id;
        let document: ListingDocument = serde_json::from_value(Value::Object(record.fields))
            .map_err(|e| ListingError::Malformed {
                id: id.clone(),
                message: e.to_string(),
            })?;

        let created_at = record
            .create_time
            .or_else(|| document.created.as_ref().and_then(timestamp_from_value));

        let images = document
            .images
            .into_iter()
            .map(|image| ImageAsset {
                asset_id: image.name,
                owner_uid: image.uid,
                remote_url: image.url,
                local_preview_url: None,
                state: AssetState::Attached,
            })
            .collect();

        Ok(Self {
            id,
            fields: ListingFields {
                name: document.name,
                model: document.model,
                year: document.year,
                km: document.km,
                price: document.price,
                city: document.city,
                description: document.description,
                whatsapp: document.whatsapp,
            },
            owner: document.owner,
            owner_uid: document.uid,
            created_at,
            images,
        })
    }

    /// First photo, used as the card cover
    pub fn cover_url(&self) -> Option<&str> {
        self.images.first().map(|image| image.remote_url.as_str())
    }

    /// Link opening a WhatsApp chat with the seller about this vehicle
    pub fn whatsapp_link(&self) -> Option<String> {
        let text = format!(
            "Olá, vi o seu {} no site WP Veículos e fiquei interessado!",
            self.fields.name
        );
        Url::parse_with_params(
            WHATSAPP_SEND_URL,
            &[("phone", self.fields.whatsapp.as_str()), ("text", text.as_str())],
        )
        .ok()
        .map(String::from)
    }
}

/// Stored shape of a listing; field names match existing documents
#[derive(Debug, Serialize, Deserialize)]
struct ListingDocument {
    name: String,
    #[serde(default)]
    model: String,
    #[serde(default, deserialize_with = "string_or_number")]
    year: String,
    #[serde(default, deserialize_with = "string_or_number")]
    km: String,
    #[serde(default, deserialize_with = "string_or_number")]
    price: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    whatsapp: String,
    #[serde(default)]
    owner: String,
    uid: String,
    #[serde(default)]
    images: Vec<StoredImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredImage {
    uid: String,
    name: String,
    url: String,
}

/// Older documents carry numeric prices and mileages
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Integer(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
    })
}

/// Outcome of [`ListingRepository::delete_listing`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub listing_id: String,
    pub assets_attempted: usize,
    /// Storage paths that could not be removed and are now orphaned
    pub failed_assets: Vec<String>,
}

/// Listings in the document store, with cascade cleanup in object storage
pub struct ListingRepository {
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStorage>,
}

impl ListingRepository {
    pub fn new(documents: Arc<dyn DocumentStore>, objects: Arc<dyn ObjectStorage>) -> Self {
        Self { documents, objects }
    }

    /// Write a new listing owned by `owner` with `images` attached.
    ///
    /// Images are not rolled back when the write fails.
    pub async fn create_listing(
        &self,
        fields: &ListingFields,
        owner: &Session,
        images: &[ImageAsset],
    ) -> Result<Listing, ListingError> {
        if let Some(pending) = images.iter().find(|image| image.remote_url.is_empty()) {
            return Err(ListingError::ImageNotUploaded(pending.asset_id.clone()));
        }

        let document = ListingDocument {
            name: fields.name.clone(),
            model: fields.model.clone(),
            year: fields.year.clone(),
            km: fields.km.clone(),
            price: fields.price.clone(),
            city: fields.city.clone(),
            description: fields.description.clone(),
            whatsapp: fields.whatsapp.clone(),
            owner: owner.display_name.clone(),
            uid: owner.uid.clone(),
            images: images
                .iter()
                .map(|image| StoredImage {
                    uid: image.owner_uid.clone(),
                    name: image.asset_id.clone(),
                    url: image.remote_url.clone(),
                })
                .collect(),
            created: Some(timestamp_value(Utc::now())),
        };

        let fields: Fields = match serde_json::to_value(&document) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(ListingError::Write(BackendError::Parse("listing is not an object".into()))),
            Err(e) => return Err(ListingError::Write(BackendError::Parse(e.to_string()))),
        };

        let record = self
            .documents
            .create(LISTINGS_COLLECTION, fields)
            .await
            .map_err(|e| {
                error!("Failed to create listing for {}: {}", owner.uid, e);
                ListingError::Write(e)
            })?;

        info!("Created listing {} with {} images", record.id, images.len());
        Listing::from_record(record)
    }

    /// Fetch one listing by id
    pub async fn get_listing(&self, id: &str) -> Result<Option<Listing>, ListingError> {
        let record = self
            .documents
            .get(LISTINGS_COLLECTION, id)
            .await
            .map_err(ListingError::Read)?;
        record.map(Listing::from_record).transpose()
    }

    /// Every listing, in backend order
    pub async fn list_all(&self) -> Result<Vec<Listing>, ListingError> {
        self.query(&Filter::All).await
    }

    /// Every listing owned by `owner_uid`, in backend order
    pub async fn list_by_owner(&self, owner_uid: &str) -> Result<Vec<Listing>, ListingError> {
        self.query(&Filter::eq("uid", owner_uid)).await
    }

    /// Listings whose name contains `term`, ignoring case
    pub async fn search(&self, term: &str) -> Result<Vec<Listing>, ListingError> {
        Ok(filter_by_name(self.list_all().await?, term))
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Listing>, ListingError> {
        let records = self
            .documents
            .query(LISTINGS_COLLECTION, filter)
            .await
            .map_err(ListingError::Read)?;

        Ok(records
            .into_iter()
            .filter_map(|record| match Listing::from_record(record) {
                Ok(listing) => Some(listing),
                Err(e) => {
                    warn!("Skipping listing: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Delete `listing` and then every image it references.
    ///
    /// Image failures are reported, never raised: the record is already gone.
    pub async fn delete_listing(
        &self,
        session: &Session,
        listing: &Listing,
    ) -> Result<DeleteReport, ListingError> {
        if listing.owner_uid != session.uid {
            return Err(ListingError::NotOwner(listing.id.clone()));
        }

        self.documents
            .delete(LISTINGS_COLLECTION, &listing.id)
            .await
            .map_err(ListingError::Delete)?;
        info!("Deleted listing {}", listing.id);

        let mut failed_assets = Vec::new();
        for image in &listing.images {
            let path = image.storage_path();
            if let Err(e) = self.objects.delete(&path).await {
                error!("Failed to delete image {} of listing {}: {}", path, listing.id, e);
                failed_assets.push(path);
            }
        }

        Ok(DeleteReport {
            listing_id: listing.id.clone(),
            assets_attempted: listing.images.len(),
            failed_assets,
        })
    }
}

/// Keep listings whose name contains `term`, ignoring case; a blank term keeps all
pub fn filter_by_name(listings: Vec<Listing>, term: &str) -> Vec<Listing> {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return listings;
    }
    listings
        .into_iter()
        .filter(|listing| listing.fields.name.to_lowercase().contains(&needle))
        .collect()
}

/// Listing repository errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ListingError {
    #[error("Failed to save listing: {0}")]
    Write(BackendError),

    #[error("Failed to load listings: {0}")]
    Read(BackendError),

    #[error("Failed to delete listing: {0}")]
    Delete(BackendError),

    #[error("Listing {id} is malformed: {message}")]
    Malformed { id: String, message: String },

    #[error("Only the owner can delete listing {0}")]
    NotOwner(String),

    #[error("Image {0} has not finished uploading")]
    ImageNotUploaded(String),
}

/// Fields for a stored listing document, used when seeding test stores
#[cfg(test)]
pub(crate) fn document_fields(name: &str, owner_uid: &str, image_ids: &[&str]) -> Fields {
    let images: Vec<Value> = image_ids
        .iter()
        .map(|id| {
            serde_json::json!({
                "uid": owner_uid,
                "name": id,
                "url": format!("https://storage.test/images/{owner_uid}/{id}"),
            })
        })
        .collect();
    let value = serde_json::json!({
        "name": name,
        "model": "Modelo",
        "year": "2020",
        "km": 15000,
        "price": 49900.5,
        "city": "Curitiba - PR",
        "description": "Bem conservado",
        "whatsapp": "41999998888",
        "owner": "Ana",
        "uid": owner_uid,
        "images": images,
    });
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}
