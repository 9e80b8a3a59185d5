use std::path::{Component, Path, PathBuf};

use dedup_types::{BLOCK_SIZE, DIGEST_ALGORITHM, DIGEST_LEN};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Block store configuration.
///
/// Every field has a default, so a TOML file only needs the keys it
/// overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base directory; the relative paths below are resolved against it.
    pub root: PathBuf,
    /// Directory holding segment files and the segment pointer file.
    pub segments_dir: PathBuf,
    /// Directory holding one manifest per stream name.
    pub manifests_dir: PathBuf,
    /// Journal file of the durable index store.
    pub index_file: PathBuf,
    /// Fixed textual prefix of segment file names.
    pub segment_prefix: String,
    /// Name of the pointer file inside `segments_dir`.
    pub pointer_file: String,
    /// Minimum number of decimal digits after `segment_prefix`.
    pub min_suffix_width: usize,
    /// A segment never grows past this many bytes.
    pub max_segment_size: u64,
    /// Size of one input chunk on ingest and one output buffer on read.
    pub read_buffer_size: usize,
    /// Smallest usable handle bound; below it the process refuses to run.
    pub min_handle_limit: u64,
    /// Fixed handle bound instead of one derived from the OS limit.
    pub handle_limit: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let tag = format!("{DIGEST_ALGORITHM}_{BLOCK_SIZE}");
        Self {
            root: PathBuf::from("/tmp/deduplicated_server"),
            segments_dir: PathBuf::from("hashes"),
            manifests_dir: PathBuf::from(format!("files_{tag}")),
            index_file: PathBuf::from("index.journal"),
            segment_prefix: format!("{tag}_"),
            pointer_file: format!(".{tag}.last"),
            min_suffix_width: 6,
            max_segment_size: 1 << 31,
            read_buffer_size: 64 * 1024,
            min_handle_limit: 50,
            handle_limit: None,
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject values the store cannot run with.
    pub fn validate(&self) -> StoreResult<()> {
        let invalid = |msg: String| Err(StoreError::InvalidConfig(msg));
        if self.read_buffer_size < BLOCK_SIZE.max(DIGEST_LEN)
            || self.read_buffer_size % BLOCK_SIZE != 0
            || self.read_buffer_size % DIGEST_LEN != 0
        {
            return invalid(format!(
                "read_buffer_size {} must be a non-zero multiple of {BLOCK_SIZE} and {DIGEST_LEN}",
                self.read_buffer_size
            ));
        }
        if self.min_suffix_width == 0 {
            return invalid("min_suffix_width must be at least 1".into());
        }
        if self.segment_prefix.is_empty()
            || self.segment_prefix.contains('/')
            || self.segment_prefix.ends_with(|c: char| c.is_ascii_digit())
        {
            return invalid(format!(
                "segment_prefix {:?} must be non-empty, contain no '/', and not end in a digit",
                self.segment_prefix
            ));
        }
        if self.pointer_file.is_empty() || self.pointer_file.contains('/') {
            return invalid(format!("pointer_file {:?} is not a file name", self.pointer_file));
        }
        if self.max_segment_size < (BLOCK_SIZE + dedup_types::LENGTH_PREFIX_WIDTH) as u64 {
            return invalid(format!(
                "max_segment_size {} cannot hold a single block",
                self.max_segment_size
            ));
        }
        if self.handle_limit == Some(0) {
            return invalid("handle_limit must be positive".into());
        }
        Ok(())
    }

    pub fn segments_path(&self) -> PathBuf {
        self.root.join(&self.segments_dir)
    }

    pub fn manifests_path(&self) -> PathBuf {
        self.root.join(&self.manifests_dir)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(&self.index_file)
    }

    pub fn pointer_path(&self) -> PathBuf {
        self.segments_path().join(&self.pointer_file)
    }

    /// Manifest location for a stream name.
    ///
    /// Names may contain `/` to nest streams in subdirectories, but must stay
    /// inside the manifests directory.
    pub fn manifest_path(&self, name: &str) -> StoreResult<PathBuf> {
        let reject = |reason: &str| {
            Err(StoreError::InvalidStreamName {
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };
        if name.is_empty() {
            return reject("name is empty");
        }
        let relative = Path::new(name);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::CurDir => {}
                _ => return reject("name must be a relative path without '..'"),
            }
        }
        if name.ends_with('/') {
            return reject("name must not end with '/'");
        }
        Ok(self.manifests_path().join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = StoreConfig::default();
        assert_eq!(c.segment_prefix, "sha256_16_");
        assert_eq!(c.pointer_file, ".sha256_16.last");
        assert_eq!(c.manifests_dir, PathBuf::from("files_sha256_16"));
        assert_eq!(c.min_suffix_width, 6);
        assert_eq!(c.max_segment_size, 1 << 31);
        assert_eq!(c.read_buffer_size, 64 * 1024);
        assert_eq!(c.min_handle_limit, 50);
        assert!(c.handle_limit.is_none());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn derived_paths() {
        let c = StoreConfig::with_root("/srv/dedup");
        assert_eq!(c.segments_path(), PathBuf::from("/srv/dedup/hashes"));
        assert_eq!(c.pointer_path(), PathBuf::from("/srv/dedup/hashes/.sha256_16.last"));
        assert_eq!(c.index_path(), PathBuf::from("/srv/dedup/index.journal"));
        assert_eq!(
            c.manifest_path("logs/a").unwrap(),
            PathBuf::from("/srv/dedup/files_sha256_16/logs/a")
        );
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let c = StoreConfig::from_toml_str(
            r#"
            root = "/data"
            max_segment_size = 4096
            handle_limit = 64
            "#,
        )
        .unwrap();
        assert_eq!(c.root, PathBuf::from("/data"));
        assert_eq!(c.max_segment_size, 4096);
        assert_eq!(c.handle_limit, Some(64));
        assert_eq!(c.segment_prefix, "sha256_16_");
    }

    #[test]
    fn toml_rejects_bad_buffer_size() {
        let err = StoreConfig::from_toml_str("read_buffer_size = 40").unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_digit_terminated_prefix() {
        let c = StoreConfig {
            segment_prefix: "seg1".into(),
            ..StoreConfig::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_escaping_stream_names() {
        let c = StoreConfig::default();
        assert!(c.manifest_path("").is_err());
        assert!(c.manifest_path("../etc/passwd").is_err());
        assert!(c.manifest_path("/abs").is_err());
        assert!(c.manifest_path("a/../../b").is_err());
        assert!(c.manifest_path("dir/").is_err());
        assert!(c.manifest_path("ok/name").is_ok());
    }
}
