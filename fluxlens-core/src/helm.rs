use crate::prelude::*;

use crate::errors::ErrorKind;
use async_trait::async_trait;
use base64::Engine;
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use std::io::Read;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const RELEASE_DATA_KEY: &str = "release";

/// The parts of a stored Helm release the dashboard cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelmReleaseRecord {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub version: i32,
    #[serde(default)]
    pub manifest: String,
}

impl HelmReleaseRecord {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        version: i32,
        manifest: impl Into<String>,
    ) -> Self {
        HelmReleaseRecord {
            name: name.into(),
            namespace: namespace.into(),
            version,
            manifest: manifest.into(),
        }
    }
}

/// Release history lookup, `namespace` is the Helm storage namespace.
#[async_trait]
pub trait HelmHistory: Sync + Send {
    async fn history(&self, namespace: &str, release: &str) -> Result<Vec<HelmReleaseRecord>>;
}

/// Reads releases from the Secrets the Helm `secret` storage driver writes.
pub struct SecretHelmHistory {
    client: Client,
}

impl SecretHelmHistory {
    pub fn new(client: Client) -> Self {
        SecretHelmHistory { client }
    }
}

#[async_trait]
impl HelmHistory for SecretHelmHistory {
    async fn history(&self, namespace: &str, release: &str) -> Result<Vec<HelmReleaseRecord>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("owner=helm,name={release}"));
        let secrets = api.list(&lp).await?;
        let mut records = Vec::new();
        for secret in secrets {
            let secret_name = secret.metadata.name.as_deref().unwrap_or_default();
            let Some(payload) = secret
                .data
                .as_ref()
                .and_then(|data| data.get(RELEASE_DATA_KEY))
            else {
                warn!("Helm storage secret {namespace}/{secret_name} has no release data");
                continue;
            };
            match decode_release(&payload.0) {
                Ok(record) => records.push(record),
                Err(err) => warn!("Failed to decode Helm release {namespace}/{secret_name}: {err}"),
            }
        }
        debug!(
            "Found {} stored revision(s) of Helm release {namespace}/{release}",
            records.len()
        );
        Ok(records)
    }
}

/// Helm stores `base64(gzip(json))`, older releases skip the gzip step.
pub fn decode_release(payload: &[u8]) -> Result<HelmReleaseRecord> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| ErrorKind::HelmStorageError(format!("invalid base64: {e}")))?;
    let json = if decoded.starts_with(&GZIP_MAGIC) {
        let mut buf = Vec::new();
        GzDecoder::new(decoded.as_slice())
            .read_to_end(&mut buf)
            .map_err(|e| ErrorKind::HelmStorageError(format!("invalid gzip: {e}")))?;
        buf
    } else {
        decoded
    };
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    fn stored_release(gzip: bool) -> Vec<u8> {
        let release = json!({
            "name": "podinfo",
            "namespace": "apps",
            "version": 4,
            "info": {"status": "deployed"},
            "manifest": "apiVersion: v1\nkind: Service\nmetadata:\n  name: podinfo\n"
        });
        let raw = serde_json::to_vec(&release).unwrap();
        let body = if gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw).unwrap();
            encoder.finish().unwrap()
        } else {
            raw
        };
        base64::engine::general_purpose::STANDARD
            .encode(body)
            .into_bytes()
    }

    #[test]
    fn decodes_gzipped_release() -> Result<()> {
        let record = decode_release(&stored_release(true))?;
        assert_eq!(record.name, "podinfo");
        assert_eq!(record.namespace, "apps");
        assert_eq!(record.version, 4);
        assert!(record.manifest.contains("kind: Service"));
        Ok(())
    }

    #[test]
    fn decodes_plain_release() -> Result<()> {
        let record = decode_release(&stored_release(false))?;
        assert_eq!(record.version, 4);
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        let err = decode_release(b"not base64 at all!").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::HelmStorageError(_)));
    }
}
