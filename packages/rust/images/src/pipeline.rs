//! The image dedup/upload pipeline.
//!
//! One crawl run owns one pipeline. The uploaded-set is seeded from
//! existing stored associations at run start and grows as uploads
//! succeed, so the same normalized URL is fetched at most once per run
//! while every referencing page still gets its association record.

use std::collections::HashSet;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use docsink_shared::config::ImagesConfig;
use docsink_shared::{CancelFlag, DocsinkError, PendingImage, Result};

use crate::normalize::{HostRules, extension_of, normalize_image_url};
use crate::store::ObjectStore;

/// Derive the object-storage key for a normalized image URL: a stable
/// content-independent hash with the fixed transcoded extension.
pub fn storage_key(normalized_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_url.as_bytes());
    format!("{:x}.jpg", hasher.finalize())
}

/// Per-run image accounting.
#[derive(Debug, Clone, Default)]
pub struct ImageStats {
    /// References seen, including repeats.
    pub total: usize,
    /// Distinct normalized URLs seen.
    pub unique: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Outcome of processing one image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    Uploaded { storage_path: String },
    Skipped { reason: String },
    Failed { error: String },
}

/// Run-scoped image pipeline.
pub struct ImagePipeline<'a> {
    config: ImagesConfig,
    rules: HostRules,
    client: reqwest::Client,
    store: &'a dyn ObjectStore,
    bucket: String,
    /// Normalized URLs known to be uploaded (seeded + this run).
    uploaded: HashSet<String>,
    /// Normalized URLs seen this run (for the unique count).
    seen: HashSet<String>,
    /// (page_url, normalized_url) pairs already pending.
    pending_keys: HashSet<(String, String)>,
    pending: Vec<PendingImage>,
    bucket_ready: bool,
    cancel: CancelFlag,
    stats: ImageStats,
}

impl<'a> ImagePipeline<'a> {
    pub fn new(
        config: &ImagesConfig,
        store: &'a dyn ObjectStore,
        bucket: impl Into<String>,
        uploaded_seed: HashSet<String>,
        cancel: CancelFlag,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DocsinkError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            rules: HostRules::from(config),
            config: config.clone(),
            client,
            store,
            bucket: bucket.into(),
            uploaded: uploaded_seed,
            seen: HashSet::new(),
            pending_keys: HashSet::new(),
            pending: Vec::new(),
            bucket_ready: false,
            cancel,
            stats: ImageStats::default(),
        })
    }

    /// Process one image reference found on `page_url`.
    ///
    /// Returns `Err` only for cancellation; every other problem is a
    /// counted per-unit outcome and the crawl continues.
    pub async fn process(&mut self, image_url: &Url, page_url: &str) -> Result<ImageOutcome> {
        self.stats.total += 1;
        let normalized = normalize_image_url(image_url, &self.rules);
        if self.seen.insert(normalized.clone()) {
            self.stats.unique += 1;
        }

        if let Some(ext) = extension_of(image_url) {
            if self.config.exclude_formats.iter().any(|e| *e == ext) {
                debug!(url = %image_url, ext = %ext, "excluded format, skipping");
                self.stats.skipped += 1;
                return Ok(ImageOutcome::Skipped {
                    reason: format!("excluded format {ext}"),
                });
            }
        }

        // Dedup before any download: a hit still records the association.
        if self.uploaded.contains(&normalized) {
            let path = storage_key(&normalized);
            self.push_pending(page_url, &normalized, &path);
            self.stats.skipped += 1;
            return Ok(ImageOutcome::Skipped {
                reason: "already uploaded".into(),
            });
        }

        self.cancel.check()?;
        if let Err(e) = self.ensure_bucket().await {
            if e.is_cancelled() {
                return Err(e);
            }
            warn!(error = %e, "bucket unavailable");
            self.stats.failed += 1;
            return Ok(ImageOutcome::Failed {
                error: e.to_string(),
            });
        }

        self.cancel.check()?;
        let bytes = match self.download(image_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(url = %image_url, error = %e, "image download failed");
                self.stats.failed += 1;
                return Ok(ImageOutcome::Failed {
                    error: e.to_string(),
                });
            }
        };

        // The payload must actually decode; a content-type header alone
        // proves nothing.
        let jpeg = match transcode(&bytes, self.config.max_dimension, self.config.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!(url = %image_url, error = %e, "image validation failed");
                self.stats.failed += 1;
                return Ok(ImageOutcome::Failed {
                    error: e.to_string(),
                });
            }
        };

        self.cancel.check()?;
        let path = storage_key(&normalized);
        if let Err(e) = self
            .store
            .upload(&self.bucket, &path, jpeg, "image/jpeg")
            .await
        {
            warn!(url = %image_url, error = %e, "image upload failed");
            self.stats.failed += 1;
            return Ok(ImageOutcome::Failed {
                error: e.to_string(),
            });
        }

        self.uploaded.insert(normalized.clone());
        self.push_pending(page_url, &normalized, &path);
        self.stats.uploaded += 1;
        Ok(ImageOutcome::Uploaded { storage_path: path })
    }

    /// Drain the pending association records for Bulk Commit.
    pub fn take_pending(&mut self) -> Vec<PendingImage> {
        std::mem::take(&mut self.pending)
    }

    pub fn stats(&self) -> &ImageStats {
        &self.stats
    }

    fn push_pending(&mut self, page_url: &str, normalized: &str, storage_path: &str) {
        let key = (page_url.to_string(), normalized.to_string());
        if self.pending_keys.insert(key) {
            self.pending.push(PendingImage {
                page_url: page_url.to_string(),
                original_url: normalized.to_string(),
                storage_path: storage_path.to_string(),
            });
        }
    }

    /// Idempotent create-if-absent bucket check, run once per pipeline.
    async fn ensure_bucket(&mut self) -> Result<()> {
        if self.bucket_ready {
            return Ok(());
        }
        self.cancel.check()?;
        if !self.store.bucket_exists(&self.bucket).await? {
            self.store.create_bucket(&self.bucket).await?;
        }
        self.bucket_ready = true;
        Ok(())
    }

    async fn download(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| DocsinkError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DocsinkError::Network(format!("{url}: HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DocsinkError::Network(format!("{url}: body read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Validate, bound, flatten, and re-encode an image payload.
///
/// Resizes down to `max_dimension` preserving aspect ratio (never
/// upscales), flattens transparency onto white, and emits JPEG.
fn transcode(bytes: &[u8], max_dimension: u32, quality: u8) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| DocsinkError::Image(format!("not a decodable image: {e}")))?;

    let resized = if decoded.width() > max_dimension || decoded.height() > max_dimension {
        decoded.resize(
            max_dimension,
            max_dimension,
            image::imageops::FilterType::Lanczos3,
        )
    } else {
        decoded
    };

    let rgba = resized.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut flattened = image::RgbImage::from_pixel(width, height, image::Rgb([255, 255, 255]));
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let blend = |fg: u8| ((fg as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        flattened.put_pixel(
            x,
            y,
            image::Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]),
        );
    }

    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode_image(&flattened)
        .map_err(|e| DocsinkError::Image(format!("jpeg encode failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A small in-memory PNG with partial transparency.
    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 40, 40, 128]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .expect("encode test png");
        out.into_inner()
    }

    /// Config whose host rules treat the mock server as a CDN host.
    fn test_config() -> ImagesConfig {
        let mut config = ImagesConfig::default();
        config.strip_query_suffixes.push("127.0.0.1".into());
        config
    }

    #[test]
    fn storage_key_is_stable_and_jpg() {
        let a = storage_key("https://cdn.example.com/a.png");
        let b = storage_key("https://cdn.example.com/a.png");
        assert_eq!(a, b);
        assert!(a.ends_with(".jpg"));
        assert_eq!(a.len(), 64 + 4);
    }

    #[test]
    fn transcode_bounds_dimensions_and_emits_jpeg() {
        let png = sample_png(100, 50);
        let jpeg = transcode(&png, 10, 80).expect("transcode");
        assert_eq!(
            image::guess_format(&jpeg).expect("format"),
            image::ImageFormat::Jpeg
        );
        let decoded = image::load_from_memory(&jpeg).expect("decode");
        assert!(decoded.width() <= 10 && decoded.height() <= 10);
    }

    #[test]
    fn transcode_never_upscales() {
        let png = sample_png(4, 4);
        let jpeg = transcode(&png, 1600, 80).expect("transcode");
        let decoded = image::load_from_memory(&jpeg).expect("decode");
        assert_eq!((decoded.width(), decoded.height()), (4, 4));
    }

    #[test]
    fn transcode_rejects_non_images() {
        let err = transcode(b"<html>not an image</html>", 1600, 80).expect_err("reject");
        assert!(err.to_string().contains("not a decodable image"));
    }

    #[tokio::test]
    async fn same_asset_uploaded_once_with_two_associations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(sample_png(8, 8)))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let config = test_config();
        let mut pipeline = ImagePipeline::new(
            &config,
            &store,
            "imgs",
            HashSet::new(),
            CancelFlag::new(),
        )
        .unwrap();

        let first = Url::parse(&format!("{}/a.png?sig=abc123", server.uri())).unwrap();
        let second = Url::parse(&format!("{}/a.png?sig=xyz999", server.uri())).unwrap();

        let outcome = pipeline
            .process(&first, "https://docs.example.com/page-one")
            .await
            .unwrap();
        assert!(matches!(outcome, ImageOutcome::Uploaded { .. }));

        let outcome = pipeline
            .process(&second, "https://docs.example.com/page-two")
            .await
            .unwrap();
        assert!(matches!(outcome, ImageOutcome::Skipped { .. }));

        assert_eq!(store.object_count("imgs").await, 1);
        let pending = pipeline.take_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].storage_path, pending[1].storage_path);
        assert_eq!(pending[0].original_url, pending[1].original_url);

        let stats = pipeline.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unique, 1);
        assert_eq!(stats.uploaded, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn seeded_uploads_are_skipped_but_still_associated() {
        let store = MemoryStore::new();
        let config = test_config();
        let seeded_url = "https://cdn.example.com/logo.png";
        let mut pipeline = ImagePipeline::new(
            &config,
            &store,
            "imgs",
            HashSet::from([seeded_url.to_string()]),
            CancelFlag::new(),
        )
        .unwrap();

        let url = Url::parse("https://cdn.example.com/logo.png?v=2").unwrap();
        let outcome = pipeline
            .process(&url, "https://docs.example.com/home")
            .await
            .unwrap();

        assert!(matches!(outcome, ImageOutcome::Skipped { .. }));
        assert_eq!(pipeline.take_pending().len(), 1);
    }

    #[tokio::test]
    async fn excluded_formats_are_rejected_before_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let config = test_config();
        let mut pipeline = ImagePipeline::new(
            &config,
            &store,
            "imgs",
            HashSet::new(),
            CancelFlag::new(),
        )
        .unwrap();

        let url = Url::parse(&format!("{}/anim.gif", server.uri())).unwrap();
        let outcome = pipeline
            .process(&url, "https://docs.example.com/home")
            .await
            .unwrap();

        assert!(matches!(outcome, ImageOutcome::Skipped { .. }));
        assert!(pipeline.take_pending().is_empty());
    }

    #[tokio::test]
    async fn undecodable_payload_counts_as_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fake.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html>totally an image</html>")
                    .insert_header("content-type", "image/png"),
            )
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let config = test_config();
        let mut pipeline = ImagePipeline::new(
            &config,
            &store,
            "imgs",
            HashSet::new(),
            CancelFlag::new(),
        )
        .unwrap();

        let url = Url::parse(&format!("{}/fake.png", server.uri())).unwrap();
        let outcome = pipeline
            .process(&url, "https://docs.example.com/home")
            .await
            .unwrap();

        assert!(matches!(outcome, ImageOutcome::Failed { .. }));
        assert_eq!(pipeline.stats().failed, 1);
        assert_eq!(store.object_count("imgs").await, 0);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_processing() {
        let store = MemoryStore::new();
        let config = test_config();
        let cancel = CancelFlag::new();
        let mut pipeline =
            ImagePipeline::new(&config, &store, "imgs", HashSet::new(), cancel.clone()).unwrap();

        cancel.raise();
        let url = Url::parse("https://cdn.example.com/a.png").unwrap();
        let err = pipeline
            .process(&url, "https://docs.example.com/home")
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
    }
}
