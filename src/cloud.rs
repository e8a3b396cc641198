use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gallery::CloudGallery;
use crate::models::{CloudImageRow, CloudSaveResult};
use crate::storage::{self, ObjectStore};
use crate::store;

/// The cloud tier for one user: image rows in the database, bytes in the object store.
pub struct Cloud {
    pool: SqlitePool,
    objects: Arc<ObjectStore>,
    user_id: String,
    ttl: Duration,
}

impl Cloud {
    pub fn new(pool: SqlitePool, objects: Arc<ObjectStore>, user_id: String, ttl: Duration) -> Self {
        Self {
            pool,
            objects,
            user_id,
            ttl,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Upload an image (inline data URL or http(s) URL) and record it.
    ///
    /// An unknown or missing `generation_id` gets a fresh, empty generation. Images tied
    /// to an ad are stored under the ad; free-standing ones under their generation.
    /// The object is uploaded before any row is written, and removed again (with a
    /// freshly created generation) if recording it fails.
    pub async fn save_image(
        &self,
        ad_id: Option<&str>,
        style: &str,
        url: &str,
        generation_id: Option<&str>,
    ) -> Result<CloudSaveResult> {
        let image = storage::decode_image_source(url).await.context("loading image")?;

        let existing = match generation_id {
            Some(id) if store::generation_exists(&self.pool, &self.user_id, id).await? => Some(id.to_string()),
            _ => None,
        };
        let is_new_generation = existing.is_none();
        let generation_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

        let folder = ad_id.unwrap_or(&generation_id);
        let storage_path = storage::new_storage_path(&self.user_id, folder, image.extension());
        self.objects
            .put(&storage_path, &image.bytes)
            .await
            .with_context(|| format!("uploading {storage_path}"))?;

        match self
            .record(ad_id, style, &storage_path, &generation_id, is_new_generation)
            .await
        {
            Ok(id) => {
                info!(id = %id, style = %style, path = %storage_path, bytes = image.bytes.len(), "image saved to cloud");
                Ok(CloudSaveResult {
                    id,
                    storage_path,
                    generation_id,
                })
            }
            Err(e) => {
                if let Err(cleanup) = self.objects.delete(&storage_path).await {
                    warn!(path = %storage_path, error = %cleanup, "failed to remove orphaned object");
                }
                Err(e)
            }
        }
    }

    async fn record(
        &self,
        ad_id: Option<&str>,
        style: &str,
        storage_path: &str,
        generation_id: &str,
        is_new_generation: bool,
    ) -> Result<String> {
        if is_new_generation {
            store::insert_generation(&self.pool, generation_id, &self.user_id, "", "", "").await?;
        }
        match store::insert_generated_image(&self.pool, &self.user_id, generation_id, ad_id, style, storage_path).await {
            Ok(id) => Ok(id),
            Err(e) => {
                if is_new_generation
                    && let Err(cleanup) = store::delete_generation(&self.pool, &self.user_id, generation_id).await
                {
                    warn!(generation_id = %generation_id, error = %cleanup, "failed to remove orphaned generation");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CloudGallery for Cloud {
    async fn list_images(&self, ad_id: Option<&str>) -> Result<Vec<CloudImageRow>> {
        store::list_generated_images(&self.pool, &self.user_id, ad_id).await
    }

    async fn create_signed_urls(&self, paths: &[String]) -> Result<Vec<Option<String>>> {
        Ok(self.objects.create_signed_urls(paths, self.ttl).await)
    }
}
