use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde_json::Value;
use sha1::{Digest, Sha1};
use tempfile::Builder;

use crate::domain::ContentAddress;
use crate::error::SfError;
use crate::gateway::RemoteClient;

/// Load/store contract of the content-addressed storage layer.
pub trait ContentStore: Send + Sync {
    fn load_json(&self, address: &ContentAddress) -> Result<Value, SfError>;
    fn store_json(&self, value: &Value) -> Result<ContentAddress, SfError>;
    /// Materializes the object as a local file and returns its path.
    fn load_file(&self, address: &ContentAddress) -> Result<PathBuf, SfError>;

    fn load_text(&self, address: &ContentAddress) -> Result<String, SfError> {
        let path = self.load_file(address)?;
        fs::read_to_string(&path)
            .map_err(|err| SfError::Filesystem(format!("read {}: {err}", path.display())))
    }
}

/// Filesystem store keyed by sha1 of content, with an optional remote for `ipfs://` objects.
pub struct LocalStore<G: RemoteClient> {
    root: Utf8PathBuf,
    remote: Option<G>,
}

impl<G: RemoteClient> LocalStore<G> {
    pub fn new(remote: Option<G>) -> Result<Self, SfError> {
        let root = match std::env::var_os("SF_STORE_DIR") {
            Some(dir) => Utf8PathBuf::from_path_buf(PathBuf::from(dir))
                .map_err(|_| SfError::Filesystem("SF_STORE_DIR is not valid UTF-8".to_string()))?,
            None => BaseDirs::new()
                .and_then(|dirs| {
                    Utf8PathBuf::from_path_buf(
                        dirs.home_dir().join(".cache").join("spikeforest-pipeline"),
                    )
                    .ok()
                })
                .ok_or_else(|| {
                    SfError::Filesystem("unable to resolve store directory".to_string())
                })?,
        };
        Ok(Self { root, remote })
    }

    pub fn new_with_root(root: Utf8PathBuf, remote: Option<G>) -> Self {
        Self { root, remote }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn sha1_path(&self, hash: &str) -> Utf8PathBuf {
        let (a, rest) = hash.split_at(2.min(hash.len()));
        let (b, _) = rest.split_at(2.min(rest.len()));
        self.root.join("sha1").join(a).join(b).join(hash)
    }

    pub fn ipfs_path(&self, cid: &str) -> Utf8PathBuf {
        self.root.join("ipfs").join(cid)
    }

    pub fn ensure_root(&self) -> Result<(), SfError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| SfError::Filesystem(err.to_string()))
    }

    /// Stores raw bytes and returns their sha1 address. Existing objects are not rewritten.
    pub fn store_bytes(&self, bytes: &[u8], name: Option<&str>) -> Result<ContentAddress, SfError> {
        let hash = sha1_hex(bytes);
        let path = self.sha1_path(&hash);
        if !path.as_std_path().exists() {
            write_file_atomic(&path, bytes)?;
        }
        Ok(ContentAddress::sha1(hash, name))
    }

    fn fetch_ipfs(&self, cid: &str) -> Result<PathBuf, SfError> {
        let path = self.ipfs_path(cid);
        if path.as_std_path().exists() {
            return Ok(path.into_std_path_buf());
        }
        let remote = self.remote.as_ref().ok_or_else(|| {
            SfError::ObjectNotFound(format!("ipfs://{cid} (no gateway configured)"))
        })?;
        tracing::info!(cid, "fetching object from gateway");
        let bytes = remote.fetch_ipfs(cid)?;
        write_file_atomic(&path, &bytes)?;
        Ok(path.into_std_path_buf())
    }
}

impl<G: RemoteClient> ContentStore for LocalStore<G> {
    fn load_json(&self, address: &ContentAddress) -> Result<Value, SfError> {
        let path = self.load_file(address)?;
        let content = fs::read_to_string(&path)
            .map_err(|err| SfError::Filesystem(format!("read {}: {err}", path.display())))?;
        serde_json::from_str(&content).map_err(|err| SfError::ObjectDecode {
            address: address.to_string(),
            message: err.to_string(),
        })
    }

    fn store_json(&self, value: &Value) -> Result<ContentAddress, SfError> {
        let bytes = canonical_json(value)?;
        self.store_bytes(&bytes, Some("file.json"))
    }

    fn load_file(&self, address: &ContentAddress) -> Result<PathBuf, SfError> {
        match address {
            ContentAddress::Local(path) => {
                if !path.exists() {
                    return Err(SfError::MissingFile(path.clone()));
                }
                Ok(path.clone())
            }
            ContentAddress::Sha1 { hash, .. } => {
                let path = self.sha1_path(hash);
                if !path.as_std_path().exists() {
                    return Err(SfError::ObjectNotFound(address.to_string()));
                }
                Ok(path.into_std_path_buf())
            }
            ContentAddress::Ipfs { cid, .. } => self.fetch_ipfs(cid),
        }
    }
}

/// Compact serialization with sorted object keys, so equal values hash equally.
///
/// Keys are sorted here rather than relying on `serde_json::Map` ordering, which follows
/// insertion order once any crate in the build enables `preserve_order`.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, SfError> {
    serde_json::to_vec(&sort_keys(value)).map_err(|err| SfError::Filesystem(err.to_string()))
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), sort_keys(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn write_file_atomic(dest: &Utf8Path, bytes: &[u8]) -> Result<(), SfError> {
    let parent = dest
        .parent()
        .ok_or_else(|| SfError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path()).map_err(|err| SfError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix("sf-object")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| SfError::Filesystem(err.to_string()))?;
    temp.write_all(bytes)
        .map_err(|err| SfError::Filesystem(err.to_string()))?;
    temp.persist(dest.as_std_path())
        .map_err(|err| SfError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn read_json_file(path: &Path) -> Result<Value, SfError> {
    let content = fs::read_to_string(path)
        .map_err(|err| SfError::Filesystem(format!("read {}: {err}", path.display())))?;
    serde_json::from_str(&content).map_err(|err| SfError::ObjectDecode {
        address: path.display().to_string(),
        message: err.to_string(),
    })
}
