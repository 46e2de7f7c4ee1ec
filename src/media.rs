//! Image registration for catalog entries.

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::crawler::config::CrawlerConfig;
use crate::store::MediaKind;

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub checksum: String,
    pub kind: MediaKind,
    pub moderated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedAsset {
    pub public_id: String,
    pub secure_url: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub format: Option<String>,
    pub license: Option<String>,
    pub license_url: Option<String>,
    pub kind: MediaKind,
    pub moderated: bool,
    pub checksum: String,
}

#[async_trait::async_trait]
pub trait AssetService: Send + Sync {
    fn compute_checksum(&self, url: &str) -> String;
    async fn upload_image(&self, url: &str, options: UploadOptions) -> Result<UploadedAsset>;
}

/// Registers the source URL itself as the asset; no bytes are copied.
#[derive(Debug, Clone, Default)]
pub struct DirectLinkAssets {
    license: Option<String>,
    license_url: Option<String>,
}

impl DirectLinkAssets {
    pub fn new(config: &CrawlerConfig) -> Self {
        Self {
            license: config.asset_license.clone(),
            license_url: config.asset_license_url.clone(),
        }
    }
}

pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn format_from_url(url: &str) -> Option<String> {
    let path = url::Url::parse(url).ok()?.path().to_string();
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("jpg".to_string()),
        "png" | "gif" | "webp" | "avif" | "svg" => Some(ext),
        _ => None,
    }
}

#[async_trait::async_trait]
impl AssetService for DirectLinkAssets {
    fn compute_checksum(&self, url: &str) -> String {
        sha256_hex(url)
    }

    async fn upload_image(&self, url: &str, options: UploadOptions) -> Result<UploadedAsset> {
        let parsed = url::Url::parse(url)?;
        anyhow::ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            "refusing non-http image url {url}"
        );
        Ok(UploadedAsset {
            public_id: format!("direct/{}", &options.checksum[..options.checksum.len().min(16)]),
            secure_url: url.to_string(),
            width: None,
            height: None,
            format: format_from_url(url),
            license: self.license.clone(),
            license_url: self.license_url.clone(),
            kind: options.kind,
            moderated: options.moderated,
            checksum: options.checksum,
        })
    }
}
