//! Object-storage interface and implementations.
//!
//! [`ObjectStore`] is the narrow seam the pipeline uploads through:
//! exactly bucket-exists, bucket-create, and upload. [`HttpBucketStore`]
//! speaks a Supabase-style storage REST API with a service key and an
//! authenticated-user fallback for permission-denied uploads;
//! [`MemoryStore`] backs tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use docsink_shared::{DocsinkError, Result};

/// Narrow object-storage interface: the only operations the pipeline uses.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Create the bucket. Must be idempotent: creating an existing bucket
    /// is not an error.
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HTTP-backed store
// ---------------------------------------------------------------------------

/// Credentials for the authenticated-upload fallback path.
#[derive(Debug, Clone)]
pub struct StoreLogin {
    pub anon_key: String,
    pub email: String,
    pub password: String,
}

/// Supabase-style storage client.
///
/// Uploads go out under the service (highest-privilege) key; a
/// permission-denied response triggers a password-grant sign-in and a
/// retry under the user token instead of failing the unit outright.
pub struct HttpBucketStore {
    client: reqwest::Client,
    endpoint: String,
    service_key: String,
    fallback: Option<StoreLogin>,
    user_token: Mutex<Option<String>>,
}

impl HttpBucketStore {
    pub fn new(endpoint: impl Into<String>, service_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DocsinkError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            fallback: None,
            user_token: Mutex::new(None),
        })
    }

    /// Enable the authenticated-upload fallback.
    pub fn with_fallback(mut self, fallback: StoreLogin) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn bucket_url(&self, bucket: &str) -> String {
        format!("{}/storage/v1/bucket/{bucket}", self.endpoint)
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/storage/v1/object/{bucket}/{key}", self.endpoint)
    }

    /// Sign in with the fallback account and cache the access token.
    async fn sign_in(&self, login: &StoreLogin) -> Result<String> {
        {
            let token = self.user_token.lock().await;
            if let Some(token) = token.as_ref() {
                return Ok(token.clone());
            }
        }

        info!("signing in for authenticated upload fallback");
        let response = self
            .client
            .post(format!(
                "{}/auth/v1/token?grant_type=password",
                self.endpoint
            ))
            .header("apikey", &login.anon_key)
            .json(&serde_json::json!({
                "email": login.email,
                "password": login.password,
            }))
            .send()
            .await
            .map_err(|e| DocsinkError::object_store(None, format!("sign-in: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DocsinkError::object_store(
                status.as_u16(),
                "sign-in rejected",
            ));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DocsinkError::object_store(None, format!("sign-in body: {e}")))?;
        let token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DocsinkError::object_store(None, "sign-in response missing access_token"))?
            .to_string();

        *self.user_token.lock().await = Some(token.clone());
        Ok(token)
    }

    async fn upload_with_token(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        token: &str,
        apikey: &str,
    ) -> Result<()> {
        let response = self
            .client
            .post(self.object_url(bucket, key))
            .bearer_auth(token)
            .header("apikey", apikey)
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| DocsinkError::object_store(None, format!("upload {key}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(DocsinkError::object_store(
            status.as_u16(),
            format!("upload {key} failed"),
        ))
    }
}

#[async_trait]
impl ObjectStore for HttpBucketStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let response = self
            .client
            .get(self.bucket_url(bucket))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .send()
            .await
            .map_err(|e| DocsinkError::object_store(None, format!("bucket check: {e}")))?;

        match response.status().as_u16() {
            200 => Ok(true),
            400 | 404 => Ok(false),
            status => Err(DocsinkError::object_store(status, "bucket check failed")),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/storage/v1/bucket", self.endpoint))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .json(&serde_json::json!({
                "id": bucket,
                "name": bucket,
                "public": true,
            }))
            .send()
            .await
            .map_err(|e| DocsinkError::object_store(None, format!("bucket create: {e}")))?;

        let status = response.status();
        // 409: the bucket already exists. Create-if-absent is idempotent.
        if status.is_success() || status.as_u16() == 409 {
            debug!(bucket, "bucket ready");
            return Ok(());
        }
        Err(DocsinkError::object_store(
            status.as_u16(),
            "bucket create failed",
        ))
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let first = self
            .upload_with_token(
                bucket,
                key,
                bytes.clone(),
                content_type,
                &self.service_key,
                &self.service_key,
            )
            .await;

        match first {
            Ok(()) => Ok(()),
            Err(err) if err.is_permission_denied() => {
                let Some(login) = &self.fallback else {
                    return Err(err);
                };
                warn!(key, "service upload denied, retrying via authenticated session");
                let token = self.sign_in(login).await?;
                self.upload_with_token(bucket, key, bytes, content_type, &token, &login.anon_key)
                    .await
            }
            Err(err) => Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store (tests)
// ---------------------------------------------------------------------------

/// In-memory [`ObjectStore`] for tests.
#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, HashMap<String, (Vec<u8>, String)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects stored in `bucket`.
    pub async fn object_count(&self, bucket: &str) -> usize {
        self.buckets
            .lock()
            .await
            .get(bucket)
            .map(|objects| objects.len())
            .unwrap_or(0)
    }

    /// Fetch one stored object's bytes.
    pub async fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.buckets
            .lock()
            .await
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|(bytes, _)| bytes.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.lock().await.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets
            .lock()
            .await
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let mut buckets = self.buckets.lock().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| DocsinkError::object_store(404, format!("no bucket {bucket}")))?;
        objects.insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(!store.bucket_exists("imgs").await.unwrap());
        store.create_bucket("imgs").await.unwrap();
        store.create_bucket("imgs").await.unwrap(); // idempotent
        assert!(store.bucket_exists("imgs").await.unwrap());

        store
            .upload("imgs", "abc.jpg", vec![1, 2, 3], "image/jpeg")
            .await
            .unwrap();
        assert_eq!(store.object_count("imgs").await, 1);
        assert_eq!(store.object("imgs", "abc.jpg").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn http_store_uploads_with_service_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/imgs/key.jpg"))
            .and(header("authorization", "Bearer service-key"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpBucketStore::new(server.uri(), "service-key").unwrap();
        store
            .upload("imgs", "key.jpg", vec![0xFF], "image/jpeg")
            .await
            .expect("upload");
    }

    #[tokio::test]
    async fn permission_denied_falls_back_to_authenticated_upload() {
        let server = MockServer::start().await;

        // Service-key upload is denied.
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/imgs/key.jpg"))
            .and(header("authorization", "Bearer service-key"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        // Password-grant sign-in hands out a user token.
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(body_string_contains("uploader@example.com"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "access_token": "user-token" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        // Retry under the user token succeeds.
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/imgs/key.jpg"))
            .and(header("authorization", "Bearer user-token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpBucketStore::new(server.uri(), "service-key")
            .unwrap()
            .with_fallback(StoreLogin {
                anon_key: "anon-key".into(),
                email: "uploader@example.com".into(),
                password: "hunter2".into(),
            });

        store
            .upload("imgs", "key.jpg", vec![0xFF], "image/jpeg")
            .await
            .expect("fallback upload");
    }

    #[tokio::test]
    async fn permission_denied_without_fallback_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/imgs/key.jpg"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let store = HttpBucketStore::new(server.uri(), "service-key").unwrap();
        let err = store
            .upload("imgs", "key.jpg", vec![0xFF], "image/jpeg")
            .await
            .expect_err("denied");
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn create_bucket_treats_conflict_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/bucket"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let store = HttpBucketStore::new(server.uri(), "service-key").unwrap();
        store.create_bucket("imgs").await.expect("idempotent create");
    }
}
