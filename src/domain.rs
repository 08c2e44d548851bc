use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SfError;

/// Locator for an object held by a content-addressed store or on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ContentAddress {
    Ipfs { cid: String, label: Option<String> },
    Sha1 { hash: String, name: Option<String> },
    Local(PathBuf),
}

impl ContentAddress {
    pub fn sha1(hash: impl Into<String>, name: Option<&str>) -> Self {
        ContentAddress::Sha1 {
            hash: hash.into(),
            name: name.map(str::to_string),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ContentAddress::Ipfs { .. } => "ipfs",
            ContentAddress::Sha1 { .. } => "sha1",
            ContentAddress::Local(_) => "file",
        }
    }

    pub fn local_path(&self) -> Option<&PathBuf> {
        match self {
            ContentAddress::Local(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentAddress::Ipfs { cid, label: None } => write!(f, "ipfs://{cid}"),
            ContentAddress::Ipfs {
                cid,
                label: Some(label),
            } => write!(f, "ipfs://{cid}?{label}"),
            ContentAddress::Sha1 { hash, name: None } => write!(f, "sha1://{hash}"),
            ContentAddress::Sha1 {
                hash,
                name: Some(name),
            } => write!(f, "sha1://{hash}/{name}"),
            ContentAddress::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for ContentAddress {
    type Err = SfError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(SfError::InvalidAddress(value.to_string()));
        }

        if let Some(rest) = trimmed.strip_prefix("ipfs://") {
            let (cid, label) = match rest.split_once('?') {
                Some((cid, label)) => (cid, Some(label.to_string()).filter(|l| !l.is_empty())),
                None => (rest, None),
            };
            if cid.is_empty() || !cid.chars().all(|ch| ch.is_ascii_alphanumeric()) {
                return Err(SfError::InvalidAddress(value.to_string()));
            }
            return Ok(ContentAddress::Ipfs {
                cid: cid.to_string(),
                label,
            });
        }

        if let Some(rest) = trimmed.strip_prefix("sha1://") {
            let (hash, name) = match rest.split_once('/') {
                Some((hash, name)) => (hash, Some(name.to_string()).filter(|n| !n.is_empty())),
                None => (rest, None),
            };
            let hash = hash.to_ascii_lowercase();
            let is_valid = hash.len() == 40 && hash.chars().all(|ch| ch.is_ascii_hexdigit());
            if !is_valid {
                return Err(SfError::InvalidAddress(value.to_string()));
            }
            return Ok(ContentAddress::Sha1 { hash, name });
        }

        if let Some(path) = trimmed.strip_prefix("file://") {
            if path.is_empty() {
                return Err(SfError::InvalidAddress(value.to_string()));
            }
            return Ok(ContentAddress::Local(PathBuf::from(path)));
        }

        if let Some((scheme, _)) = trimmed.split_once("://") {
            if scheme.chars().all(|ch| ch.is_ascii_alphanumeric()) {
                return Err(SfError::InvalidAddress(value.to_string()));
            }
        }

        Ok(ContentAddress::Local(PathBuf::from(trimmed)))
    }
}

impl TryFrom<String> for ContentAddress {
    type Error = SfError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentAddress> for String {
    fn from(value: ContentAddress) -> Self {
        value.to_string()
    }
}

/// The sorters this pipeline knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SorterName {
    SpykingCircus,
    MountainSort4,
    Tridesclous,
    Kilosort2,
    Kilosort3,
}

impl SorterName {
    pub const ALL: [SorterName; 5] = [
        SorterName::SpykingCircus,
        SorterName::MountainSort4,
        SorterName::Tridesclous,
        SorterName::Kilosort2,
        SorterName::Kilosort3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SorterName::SpykingCircus => "SpykingCircus",
            SorterName::MountainSort4 => "MountainSort4",
            SorterName::Tridesclous => "Tridesclous",
            SorterName::Kilosort2 => "Kilosort2",
            SorterName::Kilosort3 => "Kilosort3",
        }
    }

    pub fn known_names() -> Vec<&'static str> {
        Self::ALL.iter().map(SorterName::as_str).collect()
    }

    /// Program launched for this sorter unless the spec file overrides it.
    pub fn default_command(&self) -> Vec<String> {
        vec![format!("sf-{}", self.as_str().to_ascii_lowercase())]
    }

    /// Kilosort wrappers need a MATLAB license.
    pub fn requires_matlab(&self) -> bool {
        matches!(self, SorterName::Kilosort2 | SorterName::Kilosort3)
    }
}

impl fmt::Display for SorterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SorterName {
    type Err = SfError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == trimmed)
            .ok_or_else(|| SfError::UnknownSorter(value.to_string()))
    }
}

impl TryFrom<String> for SorterName {
    type Error = SfError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SorterName> for String {
    fn from(value: SorterName) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Finished,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// How the sample rate of a sorting is determined when it is attached to a recording.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "policy", content = "hz", rename_all = "lowercase")]
pub enum SampleRate {
    Infer,
    Fixed(f64),
}

impl Default for SampleRate {
    fn default() -> Self {
        SampleRate::Infer
    }
}

impl SampleRate {
    pub fn from_option(value: Option<f64>) -> Result<Self, SfError> {
        match value {
            None => Ok(SampleRate::Infer),
            Some(hz) if hz.is_finite() && hz > 0.0 => Ok(SampleRate::Fixed(hz)),
            Some(hz) => Err(SfError::SampleRate(format!(
                "{hz} is not a positive frequency"
            ))),
        }
    }

    /// Resolve against a recording object. `Fixed` wins over whatever the recording says;
    /// `Infer` fails when the recording does not declare a rate.
    pub fn resolve(&self, recording_object: &Value) -> Result<f64, SfError> {
        let declared = declared_sample_rate(recording_object);
        match (self, declared) {
            (SampleRate::Fixed(hz), Some(found)) if (found - hz).abs() > f64::EPSILON => {
                tracing::warn!(
                    configured = hz,
                    declared = found,
                    "configured sample rate disagrees with recording"
                );
                Ok(*hz)
            }
            (SampleRate::Fixed(hz), _) => Ok(*hz),
            (SampleRate::Infer, Some(found)) => Ok(found),
            (SampleRate::Infer, None) => Err(SfError::SampleRate(
                "recording object does not declare samplerate; pass --sample-rate".to_string(),
            )),
        }
    }
}

fn declared_sample_rate(recording_object: &Value) -> Option<f64> {
    recording_object
        .pointer("/data/samplerate")
        .or_else(|| recording_object.get("samplerate"))
        .and_then(Value::as_f64)
        .filter(|hz| *hz > 0.0)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_sha1_address() {
        let addr: ContentAddress =
            "sha1://05536d7a37efb3f5f2ca42c987964f199305f480/20160415_patch2.json"
                .parse()
                .unwrap();
        assert_matches!(addr, ContentAddress::Sha1 { ref name, .. } if name.as_deref() == Some("20160415_patch2.json"));
        assert_eq!(
            addr.to_string(),
            "sha1://05536d7a37efb3f5f2ca42c987964f199305f480/20160415_patch2.json"
        );
    }

    #[test]
    fn reject_short_sha1() {
        let err = "sha1://abc".parse::<ContentAddress>().unwrap_err();
        assert_matches!(err, SfError::InvalidAddress(_));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = "gs://bucket/file.json".parse::<ContentAddress>().unwrap_err();
        assert_matches!(err, SfError::InvalidAddress(_));
    }

    #[test]
    fn fixed_rate_overrides_recording() {
        let recording = json!({"data": {"samplerate": 20000.0}});
        assert_eq!(SampleRate::Fixed(30000.0).resolve(&recording).unwrap(), 30000.0);
        assert_eq!(SampleRate::Infer.resolve(&recording).unwrap(), 20000.0);
    }
}
