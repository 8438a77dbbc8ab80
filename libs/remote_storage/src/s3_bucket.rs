//! Amazon S3 driver: one `PUT Object` per file, authorized with AWS
//! Signature Version 4 and path-style URLs, over a single pooled TLS
//! connection.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{RemotePath, RemoteStorageError};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket_name: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Endpoint override for S3-compatible stores; defaults to
    /// `https://s3.<region>.amazonaws.com`.
    pub endpoint: Option<String>,
    /// Optional `x-amz-storage-class` for uploads.
    pub storage_class: Option<String>,
}

pub struct S3Bucket {
    config: S3Config,
    client: reqwest::Client,
}

impl S3Bucket {
    pub fn new(config: S3Config) -> anyhow::Result<S3Bucket> {
        anyhow::ensure!(!config.bucket_name.is_empty(), "s3 bucket must be set");
        anyhow::ensure!(!config.region.is_empty(), "s3 region must be set");
        let client = reqwest::Client::builder().build()?;
        Ok(S3Bucket { config, client })
    }

    fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.config.region),
        }
    }

    fn host(&self) -> String {
        self.endpoint()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string()
    }

    pub async fn setup(&self) -> Result<(), RemoteStorageError> {
        Ok(())
    }

    pub async fn upload_file(
        &self,
        local_path: &Utf8Path,
        remote_path: &RemotePath,
    ) -> Result<(), RemoteStorageError> {
        let body = tokio::fs::read(local_path).await?;
        let key = format!("{}/{}", self.config.bucket_name, remote_path);
        let now = Utc::now();

        let signed = sign_put(&self.config, &self.host(), &key, &body, now);

        let url = format!("{}/{}", self.endpoint(), key);
        debug!("PUT {url}");
        let mut request = self
            .client
            .put(&url)
            .header("Authorization", signed.authorization)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .body(body);
        if let Some(class) = &self.config.storage_class {
            request = request.header("x-amz-storage-class", class);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RemoteStorageError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteStorageError::Rejected(format!(
                "PUT {url} returned {status}: {body}"
            )));
        }
        Ok(())
    }
}

pub(crate) struct SignedRequest {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
}

/// Sign a path-style `PUT /<bucket>/<key>` under SigV4.
pub(crate) fn sign_put(
    config: &S3Config,
    host: &str,
    bucket_and_key: &str,
    body: &[u8],
    now: DateTime<Utc>,
) -> SignedRequest {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let content_sha256 = hex::encode(Sha256::digest(body));

    let canonical_uri = canonical_uri(bucket_and_key);
    let mut signed_headers = vec!["host", "x-amz-content-sha256", "x-amz-date"];
    let mut canonical_headers = format!(
        "host:{host}\nx-amz-content-sha256:{content_sha256}\nx-amz-date:{amz_date}\n"
    );
    if let Some(class) = &config.storage_class {
        signed_headers.push("x-amz-storage-class");
        canonical_headers.push_str(&format!("x-amz-storage-class:{class}\n"));
    }
    let signed_headers = signed_headers.join(";");

    let canonical_request = format!(
        "PUT\n{canonical_uri}\n\n{canonical_headers}\n{signed_headers}\n{content_sha256}"
    );

    let scope = format!("{date_stamp}/{}/{SERVICE}/aws4_request", config.region);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let signing_key = derive_signing_key(&config.secret_access_key, &date_stamp, &config.region);
    let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        config.access_key_id
    );
    SignedRequest {
        authorization,
        amz_date,
        content_sha256,
    }
}

/// Each path segment is URI-encoded; the separators stay.
fn canonical_uri(bucket_and_key: &str) -> String {
    let encoded = bucket_and_key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{encoded}")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), "s3"), "aws4_request")
fn derive_signing_key(secret: &str, date_stamp: &str, region: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, SERVICE.as_bytes());
    hmac(&k_service, b"aws4_request")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_config() -> S3Config {
        S3Config {
            bucket_name: "backups".to_string(),
            region: "eu-west-1".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            endpoint: None,
            storage_class: None,
        }
    }

    #[test]
    fn canonical_uri_encodes_segments() {
        assert_eq!(canonical_uri("bucket/a/b.txt"), "/bucket/a/b.txt");
        assert_eq!(canonical_uri("bucket/sp ace"), "/bucket/sp%20ace");
        assert_eq!(canonical_uri("bucket/a=b"), "/bucket/a%3Db");
    }

    #[test]
    fn signature_is_deterministic_and_scoped() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let signed = sign_put(&test_config(), "s3.eu-west-1.amazonaws.com", "backups/k", b"hello", now);
        assert_eq!(signed.amz_date, "20300101T000000Z");
        assert!(signed
            .authorization
            .starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20300101/eu-west-1/s3/aws4_request, "));
        assert!(signed
            .authorization
            .contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date, "));
        // Same request signs identically; a different body does not.
        let again = sign_put(&test_config(), "s3.eu-west-1.amazonaws.com", "backups/k", b"hello", now);
        assert_eq!(signed.authorization, again.authorization);
        let other = sign_put(&test_config(), "s3.eu-west-1.amazonaws.com", "backups/k", b"bye", now);
        assert_ne!(signed.authorization, other.authorization);
    }

    #[test]
    fn storage_class_joins_the_signed_headers() {
        let mut config = test_config();
        config.storage_class = Some("GLACIER".to_string());
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let signed = sign_put(&config, "s3.eu-west-1.amazonaws.com", "backups/k", b"", now);
        assert!(signed
            .authorization
            .contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date;x-amz-storage-class, "));
    }

    #[test]
    fn empty_body_hash_is_the_well_known_constant() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let signed = sign_put(&test_config(), "host", "backups/k", b"", now);
        assert_eq!(
            signed.content_sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
