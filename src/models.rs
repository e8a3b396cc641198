use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One produced image as seen by a viewer: in memory, in the local cache, or in the cloud.
///
/// Serialized with camelCase keys; this is also the on-disk shape of the local gallery blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImageRecord {
    pub id: String,
    pub style: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub is_local_saved: bool,
    pub is_cloud_saved: bool,
    #[serde(default)]
    pub cloud_image_id: Option<String>,
    #[serde(default)]
    pub cloud_storage_path: Option<String>,
    #[serde(default)]
    pub generation_id: Option<String>,
}

/// One candidate Russian rendering of an Arabic {hook, offer, cta} triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdCopyVariant {
    pub hook_ru: String,
    pub offer_ru: String,
    pub cta_ru: String,
    pub full_copy_ru: String,
}

/// The unit of image fan-out: one style's worth of generations.
#[derive(Debug, Clone)]
pub struct StyleGenerationRequest {
    pub style: String,
    pub prompt_modifier: String,
    pub count: u32,
    pub russian_text: String,
    pub visual_instructions: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub style: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleError {
    pub style: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Ad {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub image_instructions: Option<String>,
    pub override_global_image_instructions: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read model for copy batches; `copies` holds a JSON array of `AdCopyVariant`.
#[derive(Debug, Clone, FromRow)]
pub struct CopyBatchRow {
    pub id: String,
    pub ad_id: String,
    pub user_id: String,
    pub hook_ar: String,
    pub offer_ar: String,
    pub cta_ar: String,
    pub copies: String,
    pub is_approved_batch: bool,
    pub approved_copy_index: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CopyBatch {
    pub id: String,
    pub ad_id: String,
    pub hook_ar: String,
    pub offer_ar: String,
    pub cta_ar: String,
    pub copies: Vec<AdCopyVariant>,
    pub is_approved_batch: bool,
    pub approved_copy_index: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<CopyBatchRow> for CopyBatch {
    type Error = serde_json::Error;

    fn try_from(row: CopyBatchRow) -> Result<Self, Self::Error> {
        Ok(CopyBatch {
            copies: serde_json::from_str(&row.copies)?,
            id: row.id,
            ad_id: row.ad_id,
            hook_ar: row.hook_ar,
            offer_ar: row.offer_ar,
            cta_ar: row.cta_ar,
            is_approved_batch: row.is_approved_batch,
            approved_copy_index: row.approved_copy_index,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovedCopy {
    pub batch_id: String,
    pub copy_index: i64,
    pub copy: AdCopyVariant,
}

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct UserSettings {
    pub user_id: String,
    pub russian_instructions: Option<String>,
    pub global_image_instructions: Option<String>,
}

/// A `generated_images` row as the cloud gallery returns it. `image_url` is either an
/// absolute/inline URL or an opaque storage path.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct CloudImageRow {
    pub id: String,
    pub style: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
    pub generation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloudSaveResult {
    pub id: String,
    pub storage_path: String,
    pub generation_id: String,
}
