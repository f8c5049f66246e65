/// Object storage adapter: private-bucket semantics with short-lived
/// HMAC-signed URLs. The bundled backend writes to a local directory;
/// S3-class backends plug in behind the same trait.
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Thumbnail edge length (cover-fit square).
const THUMBNAIL_SIZE: u32 = 300;
const THUMBNAIL_JPEG_QUALITY: u8 = 80;

#[async_trait]
pub trait PhotoStorage: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    /// A URL a client can fetch without credentials until `ttl` elapses.
    fn signed_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Storage key layout: `{userId}/{plantIdOrTempId}/{kind}-{timestampMs}.jpg`.
pub fn photo_key(user_id: &str, owner_segment: &str, kind: &str, timestamp_ms: i64) -> String {
    format!("{user_id}/{owner_segment}/{kind}-{timestamp_ms}.jpg")
}

pub fn thumbnail_key(key: &str) -> String {
    match key.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-thumb.{ext}"),
        None => format!("{key}-thumb"),
    }
}

/// Check for known image magic bytes (JPEG, PNG, WEBP).
pub fn is_image_bytes(data: &[u8]) -> bool {
    data.starts_with(&[0xFF, 0xD8, 0xFF])
        || data.starts_with(&[0x89, 0x50, 0x4E, 0x47])
        || (data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP")
}

/// Decode, cover-fit to 300x300, and re-encode as JPEG quality 80.
pub fn make_thumbnail(bytes: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes).context("failed to decode image for thumbnail")?;
    let thumb = img.resize_to_fill(
        THUMBNAIL_SIZE,
        THUMBNAIL_SIZE,
        image::imageops::FilterType::Lanczos3,
    );

    let mut out = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, THUMBNAIL_JPEG_QUALITY);
    encoder
        .encode_image(&thumb)
        .context("failed to encode thumbnail")?;
    Ok(out)
}

pub struct LocalPhotoStorage {
    root: PathBuf,
    public_base_url: String,
    signing_secret: String,
}

impl LocalPhotoStorage {
    pub fn new(
        root: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        signing_secret: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
            signing_secret: signing_secret.into(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        // keys are service-generated; reject anything that could escape the root
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            bail!("invalid storage key: {key}");
        }
        Ok(self.root.join(rel))
    }

    fn sign(&self, key: &str, expires_at: u64) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid signing secret: {e}"))?;
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires_at.to_string().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Recompute and compare a URL signature (used by the serving side).
    pub fn verify_signature(&self, key: &str, expires_at: u64, signature: &str) -> bool {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(u64::MAX);
        if now > expires_at {
            return false;
        }
        match self.sign(key, expires_at) {
            Ok(expected) => {
                expected.len() == signature.len()
                    && expected.as_bytes().ct_eq(signature.as_bytes()).into()
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl PhotoStorage for LocalPhotoStorage {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            bail!("refusing to store empty object: {key}");
        }
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let expires_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_secs()
            + ttl.as_secs();
        let signature = self.sign(key, expires_at)?;
        Ok(format!(
            "{}/{key}?expires={expires_at}&sig={signature}",
            self.public_base_url.trim_end_matches('/')
        ))
    }
}
