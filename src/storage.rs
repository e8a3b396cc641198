//! Private object bucket on local disk, readable through expiring signed URLs.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::StorageError;

type HmacSha256 = Hmac<Sha256>;

pub struct ObjectStore {
    root: PathBuf,
    public_base_url: String,
    signing_key: Vec<u8>,
}

impl ObjectStore {
    pub fn new(root: PathBuf, public_base_url: &str, signing_key: Option<&str>) -> Self {
        let signing_key = match signing_key {
            Some(k) if !k.is_empty() => k.as_bytes().to_vec(),
            _ => {
                let mut key = vec![0u8; 32];
                rand::rng().fill(&mut key[..]);
                key
            }
        };
        Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_key,
        }
    }

    fn object_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(path);
        let valid = !path.is_empty()
            && !path.contains('\\')
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }

    pub async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.object_path(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        debug!(path = %path, bytes = bytes.len(), "object stored");
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.object_path(path)?;
        Ok(tokio::fs::read(&target).await?)
    }

    pub async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.object_path(path)?;
        tokio::fs::remove_file(&target).await?;
        debug!(path = %path, "object removed");
        Ok(())
    }

    pub async fn exists(&self, path: &str) -> bool {
        match self.object_path(path) {
            Ok(target) => tokio::fs::try_exists(&target).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    fn signature(&self, path: &str, expires: i64) -> String {
        // new_from_slice only fails for fixed-size MACs; HMAC accepts any key length.
        let mut mac = match HmacSha256::new_from_slice(&self.signing_key) {
            Ok(m) => m,
            Err(_) => return String::new(),
        };
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        format!("{:x}", mac.finalize().into_bytes())
    }

    /// Sign a single path valid for `ttl` from `now`.
    pub fn sign(&self, path: &str, ttl: Duration, now: DateTime<Utc>) -> String {
        let expires = now.timestamp() + ttl.as_secs() as i64;
        format!(
            "{}/objects/{}?expires={expires}&sig={}",
            self.public_base_url,
            path,
            self.signature(path, expires)
        )
    }

    /// One entry per input path, in order; `None` where the object does not exist.
    pub async fn create_signed_urls(&self, paths: &[String], ttl: Duration) -> Vec<Option<String>> {
        let now = Utc::now();
        let mut urls = Vec::with_capacity(paths.len());
        for path in paths {
            if self.exists(path).await {
                urls.push(Some(self.sign(path, ttl, now)));
            } else {
                urls.push(None);
            }
        }
        urls
    }

    pub fn verify(&self, path: &str, expires: i64, sig: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        if expires < now.timestamp() {
            return Err(StorageError::BadSignature);
        }
        let expected = self.signature(path, expires);
        if expected.is_empty() || !bool::from(expected.as_bytes().ct_eq(sig.as_bytes())) {
            return Err(StorageError::BadSignature);
        }
        Ok(())
    }
}

/// Decoded image bytes plus their mime type.
pub struct ImageBytes {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImageBytes {
    pub fn extension(&self) -> &str {
        match self.mime_type.split_once('/') {
            Some((_, sub)) if !sub.is_empty() => sub.split(['+', ';']).next().unwrap_or("png"),
            _ => "png",
        }
    }
}

pub fn decode_data_url(url: &str) -> Result<ImageBytes, StorageError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| StorageError::InvalidImage("not a data URL".to_string()))?;
    let (meta, data) = rest
        .split_once(',')
        .ok_or_else(|| StorageError::InvalidImage("data URL has no payload".to_string()))?;
    let mime_type = meta
        .strip_suffix(";base64")
        .ok_or_else(|| StorageError::InvalidImage("only base64 data URLs are supported".to_string()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| StorageError::InvalidImage(e.to_string()))?;
    let mime_type = if mime_type.is_empty() { "image/png" } else { mime_type };
    Ok(ImageBytes {
        mime_type: mime_type.to_string(),
        bytes,
    })
}

/// Load image bytes from an inline `data:` URL or download them from an http(s) URL.
pub async fn decode_image_source(url: &str) -> Result<ImageBytes, StorageError> {
    if url.starts_with("data:") {
        return decode_data_url(url);
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(StorageError::InvalidImage(format!("unsupported image URL '{url}'")));
    }
    let response = reqwest::get(url).await?.error_for_status()?;
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/png")
        .to_string();
    let bytes = response.bytes().await?.to_vec();
    Ok(ImageBytes { mime_type, bytes })
}

/// `{user}/{ad}/{unix_millis}-{random hex}.{ext}`
pub fn new_storage_path(user_id: &str, ad_id: &str, extension: &str) -> String {
    let suffix: u64 = rand::rng().random();
    format!(
        "{user_id}/{ad_id}/{}-{suffix:x}.{extension}",
        Utc::now().timestamp_millis()
    )
}
