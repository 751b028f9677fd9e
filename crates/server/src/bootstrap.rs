//! Admin token initialization.

use anyhow::{Result, bail};
use reel_core::config::AdminConfig;
use reel_core::token::TokenScope;
use reel_metadata::MetadataStore;
use reel_metadata::models::TokenRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Normalize a configured token hash to the lowercase hex form produced by
/// [`crate::auth::hash_token`].
fn normalize_hash(raw: &str) -> Result<String> {
    let hash = raw.strip_prefix("sha256:").unwrap_or(raw).to_lowercase();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid admin token_hash: expected 64 hex chars");
    }
    Ok(hash)
}

/// Ensure the configured admin token exists, rotating the previous one if needed.
///
/// If the token hash changes between restarts, the previous admin token is
/// revoked and a new one is created with the new hash.
pub async fn ensure_admin_token(metadata: &dyn MetadataStore, config: &AdminConfig) -> Result<()> {
    let hash = normalize_hash(&config.token_hash)?;
    let now = OffsetDateTime::now_utc();

    if let Some(existing) = metadata.get_token_by_hash(&hash).await? {
        if existing.revoked_at.is_some() {
            bail!(
                "admin token hash matches a revoked token (id={}); \
                 use a new token hash",
                existing.token_id
            );
        }
        if let Some(expires_at) = existing.expires_at
            && expires_at <= now
        {
            bail!(
                "admin token hash matches an expired token (id={}, expired={}); \
                 use a new token hash",
                existing.token_id,
                expires_at
            );
        }
        metadata.set_bootstrap_token_id(existing.token_id).await?;
        tracing::debug!("Admin token already exists");
        return Ok(());
    }

    // Keep the admin owner stable across rotations so its quota row survives.
    let owner_id = match metadata.get_bootstrap_token_id().await? {
        Some(prev_id) => {
            metadata.revoke_token(prev_id, now).await?;
            tracing::info!(token_id = %prev_id, "Previous admin token revoked");
            metadata
                .get_token(prev_id)
                .await?
                .map(|prev| prev.owner_id)
                .unwrap_or_else(Uuid::new_v4)
        }
        None => Uuid::new_v4(),
    };

    let token = TokenRow {
        token_id: Uuid::new_v4(),
        owner_id,
        token_hash: hash,
        scopes: serde_json::to_string(&[TokenScope::Admin.as_str()])?,
        expires_at: None,
        revoked_at: None,
        created_at: now,
        last_used_at: None,
        description: config.token_description.clone(),
    };

    metadata.create_token(&token).await?;
    metadata.set_bootstrap_token_id(token.token_id).await?;
    tracing::info!(token_id = %token.token_id, owner_id = %owner_id, "Admin token created");

    Ok(())
}
