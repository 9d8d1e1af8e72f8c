//! Helm release records stored in the host cluster
//!
//! Helm 3 keeps each release revision in a Secret labelled `owner=helm` and
//! `name=<release>`. The payload under `release` is base64 text of an
//! optionally gzipped JSON document.

use std::collections::BTreeMap;
use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::controller::KubeClient;
use crate::Error;

/// Label helm sets to mark the Secrets it owns
pub const RELEASE_OWNER_LABEL: &str = "owner";

const HELM_OWNER: &str = "helm";
const RELEASE_DATA_KEY: &str = "release";
const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

/// The parts of a helm release the controller looks at
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Release {
    /// Release name
    #[serde(default)]
    pub name: String,
    /// Release namespace
    #[serde(default)]
    pub namespace: String,
    /// Revision number
    #[serde(default)]
    pub version: i64,
    /// Release info
    #[serde(default)]
    pub info: ReleaseInfo,
    /// Chart the release was installed from
    #[serde(default)]
    pub chart: ReleaseChart,
}

/// Release state reported by helm
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ReleaseInfo {
    /// `deployed`, `failed`, `pending-upgrade`, ...
    #[serde(default)]
    pub status: String,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ReleaseChart {
    #[serde(default)]
    pub metadata: ChartMetadata,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ChartMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl Release {
    /// Chart version the release runs
    pub fn chart_version(&self) -> &str {
        &self.chart.metadata.version
    }

    /// Chart name the release runs
    pub fn chart_name(&self) -> &str {
        &self.chart.metadata.name
    }
}

/// A decoded release together with the labels of the Secret it came from
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseRecord {
    /// Decoded release
    pub release: Release,
    /// Labels on the storage Secret
    pub labels: BTreeMap<String, String>,
}

impl ReleaseRecord {
    /// Whether the record was written by helm
    pub fn is_helm_owned(&self) -> bool {
        self.labels
            .get(RELEASE_OWNER_LABEL)
            .is_some_and(|owner| owner == HELM_OWNER)
    }
}

/// Decode the `release` payload of a helm storage Secret
pub fn decode_release(data: &[u8]) -> Result<Release, Error> {
    let text: Vec<u8> = data.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    let raw = BASE64
        .decode(text)
        .map_err(|e| Error::serialization(format!("release payload is not base64: {e}")))?;

    let json = if raw.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| Error::serialization(format!("release payload is not valid gzip: {e}")))?;
        out
    } else {
        raw
    };

    Ok(serde_json::from_slice(&json)?)
}

/// Find the newest revision of a release, `None` when helm has no record of it
pub async fn latest_release(
    kube: &dyn KubeClient,
    name: &str,
    namespace: &str,
) -> Result<Option<ReleaseRecord>, Error> {
    let selector = format!("{RELEASE_OWNER_LABEL}={HELM_OWNER},name={name}");
    let secrets = kube.list_secrets(namespace, &selector).await?;

    let mut latest: Option<ReleaseRecord> = None;
    for secret in secrets {
        let Some(payload) = secret
            .data
            .as_ref()
            .and_then(|d| d.get(RELEASE_DATA_KEY))
        else {
            continue;
        };
        let release = decode_release(&payload.0)?;
        if latest
            .as_ref()
            .is_some_and(|l| l.release.version >= release.version)
        {
            continue;
        }
        latest = Some(ReleaseRecord {
            release,
            labels: secret.metadata.labels.clone().unwrap_or_default(),
        });
    }
    Ok(latest)
}
