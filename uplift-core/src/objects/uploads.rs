//! Time-bounded, single-use writable locations.
//!
//! An issued location is a URL carrying `expires`, `nonce` and `signature`
//! query parameters. The signature is HMAC-SHA-256 over the method, bucket,
//! key, expiry and nonce, so none of them can be altered without
//! invalidating it. Each nonce is accepted for exactly one write.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;
use zeroize::Zeroizing;

use super::{ObjectMeta, ObjectStore};
use crate::{
    access::{AccessGuard, Action, Resource},
    config::{StorageConfig, UploadConfig},
    error::{PipelineError, Result},
    types::{ObjectLocator, RecordId},
};

type HmacSha256 = Hmac<Sha256>;

const NONCE_BYTES: usize = 16;

/// Location a client may write one object to.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WritableLocation {
    pub url: Url,
    #[serde(skip)]
    pub object: ObjectLocator,
    pub expires_at: DateTime<Utc>,
}

/// Query parameters presented when redeeming a location.
#[derive(Clone, Debug, Deserialize)]
pub struct UploadParams {
    pub expires: i64,
    pub nonce: String,
    pub signature: String,
}

pub struct UploadTargetIssuer {
    signing_key: Zeroizing<Vec<u8>>,
    base_url: Url,
    ttl: chrono::Duration,
    storage: StorageConfig,
    objects: Arc<dyn ObjectStore>,
    guard: AccessGuard,
    /// Redeemed nonces with their expiry, pruned once expired.
    redeemed: Mutex<HashMap<String, i64>>,
}

impl std::fmt::Debug for UploadTargetIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTargetIssuer")
            .field("base_url", &self.base_url.as_str())
            .field("ttl", &self.ttl)
            .field("bucket", &self.storage.bucket)
            .field("principal", &self.guard.principal())
            .finish_non_exhaustive()
    }
}

impl UploadTargetIssuer {
    /// An empty signing key is replaced by a random per-process key.
    pub fn new(
        uploads: &UploadConfig,
        storage: StorageConfig,
        objects: Arc<dyn ObjectStore>,
        guard: AccessGuard,
    ) -> Result<Self> {
        let signing_key = if uploads.signing_key.is_empty() {
            let mut key = Zeroizing::new(vec![0u8; 32]);
            rand::rng().fill_bytes(key.as_mut_slice());
            key
        } else {
            Zeroizing::new(uploads.signing_key.as_bytes().to_vec())
        };

        let mut base_url = Url::parse(&uploads.public_base_url).map_err(|err| {
            PipelineError::Invalid(format!(
                "invalid public base url {}: {err}",
                uploads.public_base_url
            ))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let ttl = chrono::Duration::from_std(uploads.url_ttl()).map_err(|err| {
            PipelineError::Invalid(format!("invalid url ttl: {err}"))
        })?;

        Ok(Self {
            signing_key,
            base_url,
            ttl,
            storage,
            objects,
            guard,
            redeemed: Mutex::new(HashMap::new()),
        })
    }

    pub fn locator_for(&self, file_id: &RecordId) -> ObjectLocator {
        ObjectLocator::new(
            &self.storage.bucket,
            self.storage.object_key(file_id.as_str()),
        )
    }

    pub fn issue(&self, file_id: &RecordId) -> Result<WritableLocation> {
        self.issue_at(file_id, Utc::now())
    }

    pub fn issue_at(
        &self,
        file_id: &RecordId,
        now: DateTime<Utc>,
    ) -> Result<WritableLocation> {
        let object = self.locator_for(file_id);
        self.guard.check(Action::ObjectPut, &Resource::object(&object))?;

        let expires_at = now + self.ttl;
        let expires = expires_at.timestamp();
        let mut nonce = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut nonce);
        let nonce = hex::encode(nonce);
        let signature = hex::encode(self.sign(&object, expires, &nonce)?);

        let mut url = self
            .base_url
            .join(&format!("objects/{}", object.key))
            .map_err(|err| PipelineError::Invalid(format!("invalid object url: {err}")))?;
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("nonce", &nonce)
            .append_pair("signature", &signature);

        debug!(%object, %expires_at, "issued writable location");
        Ok(WritableLocation {
            url,
            object,
            expires_at: Utc
                .timestamp_opt(expires, 0)
                .single()
                .unwrap_or(expires_at),
        })
    }

    /// Verify the presented parameters and store the body. The location is
    /// consumed even if a later write would have been identical.
    pub async fn redeem(
        &self,
        key: &str,
        params: &UploadParams,
        body: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<ObjectMeta> {
        self.redeem_at(key, params, body, content_type, Utc::now()).await
    }

    pub async fn redeem_at(
        &self,
        key: &str,
        params: &UploadParams,
        body: Vec<u8>,
        content_type: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ObjectMeta> {
        let object = ObjectLocator::new(&self.storage.bucket, key);
        self.verify(&object, params)?;

        let now_secs = now.timestamp();
        if now_secs > params.expires {
            return Err(PipelineError::UploadExpired(object.to_string()));
        }

        {
            let mut redeemed = self.redeemed.lock().await;
            redeemed.retain(|_, expires| *expires >= now_secs);
            if redeemed.contains_key(&params.nonce) {
                return Err(PipelineError::UploadRedeemed(object.to_string()));
            }
            redeemed.insert(params.nonce.clone(), params.expires);
        }

        let meta = self.objects.put(&object, body, content_type).await?;
        info!(%object, size = meta.size, "upload stored");
        Ok(meta)
    }

    fn verify(&self, object: &ObjectLocator, params: &UploadParams) -> Result<()> {
        let presented = hex::decode(&params.signature)
            .map_err(|_| PipelineError::InvalidSignature)?;
        self.mac(object, params.expires, &params.nonce)?
            .verify_slice(&presented)
            .map_err(|_| PipelineError::InvalidSignature)
    }

    fn sign(&self, object: &ObjectLocator, expires: i64, nonce: &str) -> Result<Vec<u8>> {
        Ok(self
            .mac(object, expires, nonce)?
            .finalize()
            .into_bytes()
            .to_vec())
    }

    fn mac(
        &self,
        object: &ObjectLocator,
        expires: i64,
        nonce: &str,
    ) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|err| PipelineError::Internal(format!("hmac key: {err}")))?;
        mac.update(
            format!("PUT\n{}\n{}\n{expires}\n{nonce}", object.bucket, object.key)
                .as_bytes(),
        );
        Ok(mac)
    }
}
