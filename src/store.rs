use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ApprovalError;
use crate::models::{Ad, AdCopyVariant, ApprovedCopy, CloudImageRow, CopyBatch, CopyBatchRow, UserSettings};

const AD_COLUMNS: &str =
    "id, user_id, title, image_instructions, override_global_image_instructions, created_at, updated_at";

const BATCH_COLUMNS: &str =
    "id, ad_id, user_id, hook_ar, offer_ar, cta_ar, copies, is_approved_batch, approved_copy_index, created_at";

/// Timestamps are stored as RFC 3339 text with millisecond precision so they sort lexically.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// ── Ads ────────────────────────────────────────────────────────────────

pub async fn list_ads(pool: &SqlitePool, user_id: &str) -> Result<Vec<Ad>> {
    let query = format!("SELECT {AD_COLUMNS} FROM ads WHERE user_id = ? ORDER BY created_at DESC");
    let ads = sqlx::query_as::<_, Ad>(&query)
        .bind(user_id)
        .fetch_all(pool)
        .await
        .context("listing ads")?;
    Ok(ads)
}

pub async fn get_ad(pool: &SqlitePool, user_id: &str, id: &str) -> Result<Option<Ad>> {
    let query = format!("SELECT {AD_COLUMNS} FROM ads WHERE id = ? AND user_id = ?");
    let ad = sqlx::query_as::<_, Ad>(&query)
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .context("querying ad")?;
    Ok(ad)
}

pub async fn create_ad(pool: &SqlitePool, user_id: &str, title: &str) -> Result<Ad> {
    let id = Uuid::new_v4().to_string();
    let now = fmt_ts(Utc::now());
    sqlx::query("INSERT INTO ads (id, user_id, title, created_at, updated_at) VALUES (?, ?, ?, ?, ?)")
        .bind(&id)
        .bind(user_id)
        .bind(title)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await
        .context("inserting ad")?;

    debug!(id = %id, title = %title, "created ad");
    get_ad(pool, user_id, &id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("ad '{id}' vanished after insert"))
}

/// Delete an ad together with its batches and image rows. Returns false if it did not exist.
pub async fn delete_ad(pool: &SqlitePool, user_id: &str, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM ads WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await
        .context("deleting ad")?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_ad_image_instructions(
    pool: &SqlitePool,
    id: &str,
    image_instructions: Option<&str>,
    override_global: bool,
) -> Result<()> {
    sqlx::query(
        "UPDATE ads SET image_instructions = ?, override_global_image_instructions = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(image_instructions)
    .bind(override_global)
    .bind(fmt_ts(Utc::now()))
    .bind(id)
    .execute(pool)
    .await
    .context("updating ad image instructions")?;
    Ok(())
}

// ── Copy batches ───────────────────────────────────────────────────────

pub async fn list_copy_batches(pool: &SqlitePool, ad_id: &str) -> Result<Vec<CopyBatch>> {
    let query = format!("SELECT {BATCH_COLUMNS} FROM ad_copy_batches WHERE ad_id = ? ORDER BY created_at DESC");
    let rows = sqlx::query_as::<_, CopyBatchRow>(&query)
        .bind(ad_id)
        .fetch_all(pool)
        .await
        .context("listing copy batches")?;

    rows.into_iter()
        .map(|row| CopyBatch::try_from(row).context("decoding stored copies"))
        .collect()
}

pub async fn create_copy_batch(
    pool: &SqlitePool,
    ad_id: &str,
    user_id: &str,
    hook_ar: &str,
    offer_ar: &str,
    cta_ar: &str,
    copies: &[AdCopyVariant],
) -> Result<CopyBatch> {
    let id = Uuid::new_v4().to_string();
    let copies_json = serde_json::to_string(copies).context("serializing copies")?;
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO ad_copy_batches (id, ad_id, user_id, hook_ar, offer_ar, cta_ar, copies, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(ad_id)
    .bind(user_id)
    .bind(hook_ar)
    .bind(offer_ar)
    .bind(cta_ar)
    .bind(&copies_json)
    .bind(fmt_ts(now))
    .execute(pool)
    .await
    .context("inserting copy batch")?;

    debug!(id = %id, ad_id = %ad_id, copies = copies.len(), "created copy batch");

    Ok(CopyBatch {
        id,
        ad_id: ad_id.to_string(),
        hook_ar: hook_ar.to_string(),
        offer_ar: offer_ar.to_string(),
        cta_ar: cta_ar.to_string(),
        copies: copies.to_vec(),
        is_approved_batch: false,
        approved_copy_index: None,
        created_at: now,
    })
}

/// Make `(batch_id, copy_index)` the ad's single approved copy.
///
/// Clearing the previous approval and setting the new one happen in one transaction,
/// so readers never see zero-then-one or two approved batches for the same ad.
pub async fn approve_copy(
    pool: &SqlitePool,
    ad_id: &str,
    batch_id: &str,
    copy_index: i64,
) -> Result<(), ApprovalError> {
    let mut tx = pool.begin().await?;

    let copies: Option<(String,)> = sqlx::query_as("SELECT copies FROM ad_copy_batches WHERE id = ? AND ad_id = ?")
        .bind(batch_id)
        .bind(ad_id)
        .fetch_optional(&mut *tx)
        .await?;
    let copies = copies.ok_or_else(|| ApprovalError::BatchNotFound(batch_id.to_string()))?;
    let copies: Vec<AdCopyVariant> = serde_json::from_str(&copies.0)?;
    if copy_index < 0 || copy_index as usize >= copies.len() {
        return Err(ApprovalError::IndexOutOfRange {
            index: copy_index,
            len: copies.len(),
        });
    }

    sqlx::query("UPDATE ad_copy_batches SET is_approved_batch = 0, approved_copy_index = NULL WHERE ad_id = ?")
        .bind(ad_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("UPDATE ad_copy_batches SET is_approved_batch = 1, approved_copy_index = ? WHERE id = ?")
        .bind(copy_index)
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(ad_id = %ad_id, batch_id = %batch_id, copy_index, "copy approved");
    Ok(())
}

pub async fn get_approved_copy(pool: &SqlitePool, ad_id: &str) -> Result<Option<ApprovedCopy>> {
    let query = format!("SELECT {BATCH_COLUMNS} FROM ad_copy_batches WHERE ad_id = ? AND is_approved_batch = 1");
    let row = sqlx::query_as::<_, CopyBatchRow>(&query)
        .bind(ad_id)
        .fetch_optional(pool)
        .await
        .context("querying approved copy batch")?;

    let Some(row) = row else {
        return Ok(None);
    };
    let Some(copy_index) = row.approved_copy_index else {
        return Ok(None);
    };
    let batch = CopyBatch::try_from(row).context("decoding stored copies")?;
    let copy = usize::try_from(copy_index).ok().and_then(|i| batch.copies.get(i).cloned());

    Ok(copy.map(|copy| ApprovedCopy {
        batch_id: batch.id,
        copy_index,
        copy,
    }))
}

// ── User settings ──────────────────────────────────────────────────────

pub async fn get_user_settings(pool: &SqlitePool, user_id: &str) -> Result<Option<UserSettings>> {
    let settings = sqlx::query_as::<_, UserSettings>(
        "SELECT user_id, russian_instructions, global_image_instructions FROM user_settings WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("reading user settings")?;
    Ok(settings)
}

pub async fn upsert_user_settings(
    pool: &SqlitePool,
    user_id: &str,
    russian_instructions: Option<&str>,
    global_image_instructions: Option<&str>,
) -> Result<UserSettings> {
    sqlx::query(
        "INSERT INTO user_settings (user_id, russian_instructions, global_image_instructions, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET
           russian_instructions = excluded.russian_instructions,
           global_image_instructions = excluded.global_image_instructions,
           updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(russian_instructions)
    .bind(global_image_instructions)
    .bind(fmt_ts(Utc::now()))
    .execute(pool)
    .await
    .context("upserting user settings")?;

    Ok(UserSettings {
        user_id: user_id.to_string(),
        russian_instructions: russian_instructions.map(str::to_string),
        global_image_instructions: global_image_instructions.map(str::to_string),
    })
}

// ── Generated images ───────────────────────────────────────────────────

pub async fn create_generation(pool: &SqlitePool, user_id: &str, hook_ar: &str, offer_ar: &str, cta_ar: &str) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    insert_generation(pool, &id, user_id, hook_ar, offer_ar, cta_ar).await?;
    Ok(id)
}

/// Insert a generation under a caller-chosen id.
pub async fn insert_generation(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    hook_ar: &str,
    offer_ar: &str,
    cta_ar: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO generations (id, user_id, hook_ar, offer_ar, cta_ar, created_at) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(id)
        .bind(user_id)
        .bind(hook_ar)
        .bind(offer_ar)
        .bind(cta_ar)
        .bind(fmt_ts(Utc::now()))
        .execute(pool)
        .await
        .context("inserting generation")?;
    Ok(())
}

pub async fn delete_generation(pool: &SqlitePool, user_id: &str, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM generations WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await
        .context("deleting generation")?;
    Ok(())
}

pub async fn generation_exists(pool: &SqlitePool, user_id: &str, id: &str) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as("SELECT id FROM generations WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .context("checking generation")?;
    Ok(row.is_some())
}

pub async fn insert_generated_image(
    pool: &SqlitePool,
    user_id: &str,
    generation_id: &str,
    ad_id: Option<&str>,
    style: &str,
    image_url: &str,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO generated_images (id, generation_id, ad_id, user_id, style, image_url, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(generation_id)
    .bind(ad_id)
    .bind(user_id)
    .bind(style)
    .bind(image_url)
    .bind(fmt_ts(Utc::now()))
    .execute(pool)
    .await
    .context("inserting generated image")?;
    Ok(id)
}

/// Cloud image rows for a user, newest first, optionally limited to one ad.
pub async fn list_generated_images(pool: &SqlitePool, user_id: &str, ad_id: Option<&str>) -> Result<Vec<CloudImageRow>> {
    let rows = match ad_id {
        Some(ad_id) => {
            sqlx::query_as::<_, CloudImageRow>(
                "SELECT id, style, image_url, created_at, generation_id FROM generated_images
                 WHERE user_id = ? AND ad_id = ? ORDER BY created_at DESC",
            )
            .bind(user_id)
            .bind(ad_id)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, CloudImageRow>(
                "SELECT id, style, image_url, created_at, generation_id FROM generated_images
                 WHERE user_id = ? ORDER BY created_at DESC",
            )
            .bind(user_id)
            .fetch_all(pool)
            .await
        }
    }
    .context("listing generated images")?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn variant(tag: &str) -> AdCopyVariant {
        AdCopyVariant {
            hook_ru: format!("hook {tag}"),
            offer_ru: format!("offer {tag}"),
            cta_ru: format!("cta {tag}"),
            full_copy_ru: format!("full {tag}"),
        }
    }

    async fn approved_flags(pool: &SqlitePool, ad_id: &str) -> Vec<(String, bool, Option<i64>)> {
        sqlx::query_as("SELECT id, is_approved_batch, approved_copy_index FROM ad_copy_batches WHERE ad_id = ?")
            .bind(ad_id)
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ads_are_scoped_to_their_owner() {
        let pool = db::memory_pool().await.unwrap();
        let ad = create_ad(&pool, "u1", "Ramadan promo").await.unwrap();
        assert_eq!(ad.title, "Ramadan promo");
        assert!(!ad.override_global_image_instructions);

        assert!(get_ad(&pool, "u2", &ad.id).await.unwrap().is_none());
        assert_eq!(list_ads(&pool, "u1").await.unwrap().len(), 1);
        assert!(!delete_ad(&pool, "u2", &ad.id).await.unwrap());
        assert!(delete_ad(&pool, "u1", &ad.id).await.unwrap());
        assert!(list_ads(&pool, "u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn image_instructions_round_trip() {
        let pool = db::memory_pool().await.unwrap();
        let ad = create_ad(&pool, "u1", "t").await.unwrap();
        update_ad_image_instructions(&pool, &ad.id, Some("gold accents"), true).await.unwrap();

        let ad = get_ad(&pool, "u1", &ad.id).await.unwrap().unwrap();
        assert_eq!(ad.image_instructions.as_deref(), Some("gold accents"));
        assert!(ad.override_global_image_instructions);
    }

    #[tokio::test]
    async fn approving_a_new_batch_clears_the_previous_one() {
        let pool = db::memory_pool().await.unwrap();
        let ad = create_ad(&pool, "u1", "t").await.unwrap();
        let x = create_copy_batch(&pool, &ad.id, "u1", "h", "o", "c", &[variant("0"), variant("1"), variant("2")])
            .await
            .unwrap();
        let y = create_copy_batch(&pool, &ad.id, "u1", "h", "o", "c", &[variant("a")]).await.unwrap();

        approve_copy(&pool, &ad.id, &x.id, 2).await.unwrap();
        approve_copy(&pool, &ad.id, &y.id, 0).await.unwrap();

        let flags = approved_flags(&pool, &ad.id).await;
        let approved: Vec<_> = flags.iter().filter(|(_, a, _)| *a).collect();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].0, y.id);
        let x_row = flags.iter().find(|(id, _, _)| *id == x.id).unwrap();
        assert_eq!(x_row.2, None);

        let current = get_approved_copy(&pool, &ad.id).await.unwrap().unwrap();
        assert_eq!(current.batch_id, y.id);
        assert_eq!(current.copy, variant("a"));
    }

    #[tokio::test]
    async fn re_approval_is_idempotent() {
        let pool = db::memory_pool().await.unwrap();
        let ad = create_ad(&pool, "u1", "t").await.unwrap();
        let x = create_copy_batch(&pool, &ad.id, "u1", "h", "o", "c", &[variant("0"), variant("1")])
            .await
            .unwrap();

        approve_copy(&pool, &ad.id, &x.id, 1).await.unwrap();
        approve_copy(&pool, &ad.id, &x.id, 1).await.unwrap();
        approve_copy(&pool, &ad.id, &x.id, 0).await.unwrap();

        let current = get_approved_copy(&pool, &ad.id).await.unwrap().unwrap();
        assert_eq!(current.copy_index, 0);
    }

    #[tokio::test]
    async fn invalid_approvals_leave_state_untouched() {
        let pool = db::memory_pool().await.unwrap();
        let ad = create_ad(&pool, "u1", "t").await.unwrap();
        let other = create_ad(&pool, "u1", "other").await.unwrap();
        let x = create_copy_batch(&pool, &ad.id, "u1", "h", "o", "c", &[variant("0")]).await.unwrap();
        approve_copy(&pool, &ad.id, &x.id, 0).await.unwrap();

        let err = approve_copy(&pool, &ad.id, &x.id, 5).await.unwrap_err();
        assert!(matches!(err, ApprovalError::IndexOutOfRange { index: 5, len: 1 }));
        let err = approve_copy(&pool, &other.id, &x.id, 0).await.unwrap_err();
        assert!(matches!(err, ApprovalError::BatchNotFound(_)));

        let current = get_approved_copy(&pool, &ad.id).await.unwrap().unwrap();
        assert_eq!(current.batch_id, x.id);
        assert!(get_approved_copy(&pool, &other.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batches_list_newest_first_with_copies() {
        let pool = db::memory_pool().await.unwrap();
        let ad = create_ad(&pool, "u1", "t").await.unwrap();
        create_copy_batch(&pool, &ad.id, "u1", "h1", "o", "c", &[variant("old")]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        create_copy_batch(&pool, &ad.id, "u1", "h2", "o", "c", &[variant("new")]).await.unwrap();

        let batches = list_copy_batches(&pool, &ad.id).await.unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].hook_ar, "h2");
        assert_eq!(batches[0].copies, vec![variant("new")]);
    }

    #[tokio::test]
    async fn settings_upsert_overwrites() {
        let pool = db::memory_pool().await.unwrap();
        assert!(get_user_settings(&pool, "u1").await.unwrap().is_none());
        upsert_user_settings(&pool, "u1", Some("a"), None).await.unwrap();
        upsert_user_settings(&pool, "u1", Some("b"), Some("g")).await.unwrap();

        let s = get_user_settings(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(s.russian_instructions.as_deref(), Some("b"));
        assert_eq!(s.global_image_instructions.as_deref(), Some("g"));
    }

    #[tokio::test]
    async fn image_rows_filter_by_ad() {
        let pool = db::memory_pool().await.unwrap();
        let ad = create_ad(&pool, "u1", "t").await.unwrap();
        let generation = create_generation(&pool, "u1", "", "", "").await.unwrap();
        assert!(generation_exists(&pool, "u1", &generation).await.unwrap());
        assert!(!generation_exists(&pool, "u2", &generation).await.unwrap());

        insert_generated_image(&pool, "u1", &generation, Some(&ad.id), "neon", "u1/a/1.png").await.unwrap();
        insert_generated_image(&pool, "u1", &generation, None, "flat", "https://cdn/x.png").await.unwrap();
        insert_generated_image(&pool, "u2", &generation, None, "flat", "u2/x.png").await.unwrap();

        assert_eq!(list_generated_images(&pool, "u1", None).await.unwrap().len(), 2);
        let for_ad = list_generated_images(&pool, "u1", Some(&ad.id)).await.unwrap();
        assert_eq!(for_ad.len(), 1);
        assert_eq!(for_ad[0].style, "neon");
        assert_eq!(for_ad[0].generation_id.as_deref(), Some(generation.as_str()));
    }
}
