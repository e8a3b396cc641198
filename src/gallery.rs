//! Gallery reconciliation between the local image cache and the cloud.
//!
//! The local cache is a single JSON blob holding every image the user saved
//! locally. The cloud side is a list of image rows whose URLs may be private
//! storage paths that need signing first. Reconciliation produces one
//! deduplicated, newest-first view and writes the locally saved subset back.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{CloudImageRow, GeneratedImageRecord};

/// Storage paths are exchanged for signed URLs in batches of this size.
pub const SIGNED_URL_CHUNK: usize = 100;

/// Remote side of the gallery: image rows plus signed-URL exchange.
#[async_trait]
pub trait CloudGallery: Send + Sync {
    async fn list_images(&self, ad_id: Option<&str>) -> Result<Vec<CloudImageRow>>;

    /// One entry per path, in order; `None` where no usable URL could be issued.
    async fn create_signed_urls(&self, paths: &[String]) -> Result<Vec<Option<String>>>;
}

pub fn is_external_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://") || url.starts_with("data:")
}

/// A freshly generated image that lives in neither persistence tier yet.
pub fn create_draft_image(style: &str, url: &str) -> GeneratedImageRecord {
    GeneratedImageRecord {
        id: format!("img-{}", Uuid::new_v4()),
        style: style.to_string(),
        url: url.to_string(),
        created_at: Utc::now(),
        is_local_saved: false,
        is_cloud_saved: false,
        cloud_image_id: None,
        cloud_storage_path: None,
        generation_id: None,
    }
}

fn sort_newest_first(records: &mut [GeneratedImageRecord]) {
    // Stable: equal timestamps keep their relative order.
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Bring a stored entry (possibly written by an older version) up to the current shape.
/// Entries without a string `style` and `url` are unusable and dropped.
fn normalize_entry(entry: &Value, index: usize) -> Option<GeneratedImageRecord> {
    let obj = entry.as_object()?;
    let style = string_field(obj, "style")?;
    let url = string_field(obj, "url")?;

    let created_at = string_field(obj, "createdAt")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let cloud_image_id = string_field(obj, "cloudImageId");
    let cloud_storage_path = string_field(obj, "cloudStoragePath");
    let generation_id = string_field(obj, "generationId");
    let is_cloud_saved = obj
        .get("isCloudSaved")
        .and_then(Value::as_bool)
        .unwrap_or(cloud_image_id.is_some() || cloud_storage_path.is_some());
    let is_local_saved = obj.get("isLocalSaved").and_then(Value::as_bool).unwrap_or(true);
    let id = string_field(obj, "id")
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("legacy-{index}-{}", Uuid::new_v4()));

    Some(GeneratedImageRecord {
        id,
        style,
        url,
        created_at,
        is_local_saved,
        is_cloud_saved,
        cloud_image_id,
        cloud_storage_path,
        generation_id,
    })
}

/// The local key-value blob of saved images.
///
/// Read-modify-write is not synchronized across writers; the last write wins.
#[derive(Debug, Clone)]
pub struct LocalGallery {
    path: PathBuf,
}

impl LocalGallery {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load, normalize and sort the cache. A missing or unreadable blob is an empty gallery.
    pub fn read(&self) -> Vec<GeneratedImageRecord> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read local gallery");
                return Vec::new();
            }
        };

        let entries: Vec<Value> = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(entries)) => entries,
            Ok(_) => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "local gallery is not valid JSON, ignoring it");
                return Vec::new();
            }
        };

        let mut records: Vec<GeneratedImageRecord> = entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| normalize_entry(entry, i))
            .collect();
        sort_newest_first(&mut records);

        // Persist the normalized form so legacy entries are migrated once.
        if let Err(e) = self.write(&records) {
            warn!(error = %e, "failed to write normalized local gallery");
        }

        records
    }

    pub fn write(&self, records: &[GeneratedImageRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string(records).context("serializing local gallery")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// Insert or replace one record by id.
    pub fn upsert(&self, record: GeneratedImageRecord) -> Result<Vec<GeneratedImageRecord>> {
        let mut current = self.read();
        match current.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => current.push(record),
        }
        sort_newest_first(&mut current);
        self.write(&current)?;
        Ok(current)
    }

    /// Union with the stored records by id; incoming records replace stored ones.
    pub fn merge(&self, records: &[GeneratedImageRecord]) -> Result<Vec<GeneratedImageRecord>> {
        let mut merged = self.read();
        let mut index: HashMap<String, usize> = merged.iter().enumerate().map(|(i, r)| (r.id.clone(), i)).collect();

        for record in records {
            match index.get(&record.id) {
                Some(&i) => merged[i] = record.clone(),
                None => {
                    index.insert(record.id.clone(), merged.len());
                    merged.push(record.clone());
                }
            }
        }

        sort_newest_first(&mut merged);
        self.write(&merged)?;
        Ok(merged)
    }
}

/// Turn cloud rows into gallery records, signing private storage paths.
///
/// Any failed signing batch fails the whole step; rows that end up without a usable
/// URL are dropped rather than shown with a broken link.
pub async fn resolve_remote(rows: Vec<CloudImageRow>, remote: &dyn CloudGallery) -> Result<Vec<GeneratedImageRecord>> {
    let storage_paths: Vec<String> = rows
        .iter()
        .map(|r| r.image_url.clone())
        .filter(|url| !is_external_url(url))
        .collect();

    let mut signed: HashMap<String, String> = HashMap::new();
    for chunk in storage_paths.chunks(SIGNED_URL_CHUNK) {
        let urls = remote.create_signed_urls(chunk).await.context("creating signed URLs")?;
        for (path, url) in chunk.iter().zip(urls) {
            if let Some(url) = url.filter(|u| !u.is_empty()) {
                signed.insert(path.clone(), url);
            }
        }
    }

    let total = rows.len();
    let records: Vec<GeneratedImageRecord> = rows
        .into_iter()
        .filter_map(|row| {
            let external = is_external_url(&row.image_url);
            let url = if external {
                row.image_url.clone()
            } else {
                match signed.get(&row.image_url) {
                    Some(url) => url.clone(),
                    None => {
                        debug!(id = %row.id, path = %row.image_url, "no signed URL, dropping image");
                        return None;
                    }
                }
            };
            Some(GeneratedImageRecord {
                id: format!("cloud-{}", row.id),
                style: row.style,
                url,
                created_at: row.created_at,
                is_local_saved: false,
                is_cloud_saved: true,
                cloud_image_id: Some(row.id),
                cloud_storage_path: if external { None } else { Some(row.image_url) },
                generation_id: row.generation_id,
            })
        })
        .collect();

    if records.len() < total {
        warn!(dropped = total - records.len(), "cloud images without a usable URL were dropped");
    }
    Ok(records)
}

/// Merge cloud records into the local list.
///
/// A cloud record matches a local one by `cloudImageId`, then by `cloudStoragePath`
/// (and finally by identical record id). Matches mark the local record cloud-saved and
/// fill its missing cloud references without overwriting populated ones; everything
/// else is appended. The result is sorted newest first; equal timestamps keep local
/// records ahead of appended cloud ones.
pub fn reconcile(local: Vec<GeneratedImageRecord>, remote: Vec<GeneratedImageRecord>) -> Vec<GeneratedImageRecord> {
    let mut merged = local;

    let mut by_cloud_id: HashMap<String, usize> = HashMap::new();
    let mut by_cloud_path: HashMap<String, usize> = HashMap::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    for (i, record) in merged.iter().enumerate() {
        if let Some(id) = &record.cloud_image_id {
            by_cloud_id.entry(id.clone()).or_insert(i);
        }
        if let Some(path) = &record.cloud_storage_path {
            by_cloud_path.entry(path.clone()).or_insert(i);
        }
        by_id.entry(record.id.clone()).or_insert(i);
    }

    for cloud in remote {
        let matched = cloud
            .cloud_image_id
            .as_ref()
            .and_then(|id| by_cloud_id.get(id))
            .or_else(|| cloud.cloud_storage_path.as_ref().and_then(|p| by_cloud_path.get(p)))
            .or_else(|| by_id.get(&cloud.id))
            .copied();

        match matched {
            Some(i) => {
                let local = &mut merged[i];
                local.is_cloud_saved = true;
                if local.cloud_image_id.is_none() {
                    local.cloud_image_id = cloud.cloud_image_id;
                }
                if local.cloud_storage_path.is_none() {
                    local.cloud_storage_path = cloud.cloud_storage_path;
                }
                if local.generation_id.is_none() {
                    local.generation_id = cloud.generation_id;
                }
            }
            None => {
                by_id.insert(cloud.id.clone(), merged.len());
                merged.push(GeneratedImageRecord {
                    is_local_saved: false,
                    is_cloud_saved: true,
                    ..cloud
                });
            }
        }
    }

    sort_newest_first(&mut merged);
    merged
}

/// A reconciled gallery. `error` is set when the cloud could not be reached, in which
/// case `images` is the local cache alone.
#[derive(Debug, Serialize)]
pub struct GalleryView {
    pub images: Vec<GeneratedImageRecord>,
    pub error: Option<String>,
}

/// One full pass: read the local cache, reconcile with the cloud when there is one,
/// and write the locally saved subset back. `ad_id` narrows the cloud rows only.
pub async fn load_gallery(local: &LocalGallery, remote: Option<&dyn CloudGallery>, ad_id: Option<&str>) -> GalleryView {
    let local_images = local.read();

    let Some(remote) = remote else {
        debug!(count = local_images.len(), "no cloud identity, local gallery only");
        return GalleryView {
            images: local_images,
            error: None,
        };
    };

    let resolved = match fetch_remote(remote, ad_id).await {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "cloud gallery unavailable, showing local images only");
            return GalleryView {
                images: local_images,
                error: Some(format!("{e:#}")),
            };
        }
    };

    let local_count = local_images.len();
    let remote_count = resolved.len();
    let merged = reconcile(local_images, resolved);

    let saved: Vec<GeneratedImageRecord> = merged.iter().filter(|r| r.is_local_saved).cloned().collect();
    let error = match local.merge(&saved) {
        Ok(_) => None,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "failed to write reconciled local gallery");
            Some(format!("{e:#}"))
        }
    };

    info!(local = local_count, cloud = remote_count, merged = merged.len(), "gallery reconciled");
    GalleryView { images: merged, error }
}

async fn fetch_remote(remote: &dyn CloudGallery, ad_id: Option<&str>) -> Result<Vec<GeneratedImageRecord>> {
    let rows = remote.list_images(ad_id).await.context("fetching cloud images")?;
    resolve_remote(rows, remote).await
}
