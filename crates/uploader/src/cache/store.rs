//! Cache Store - Upload History and Policy State
//!
//! Holds the four structures every upload decision is derived from and
//! (de)serializes them as one JSON document.
//!
//! # Storage Format
//!
//! ```text
//! {
//!   "i":  [".*\\.ignore.*"],             ignore patterns, in order
//!   "f":  {".*\\.txt": 10, ".*": 20},     freeze pattern -> deadline, in order
//!   "ft": {"/data/a.txt": 1700000000000}, mtime seen when frozen
//!   "t":  {"/data/a.txt": 1700000000500}  last upload timestamp
//! }
//! ```
//!
//! Every key is optional. Timestamps are epoch milliseconds. Paths are
//! normalized with [`normalize_path`](crate::paths::normalize_path) before
//! they are stored or looked up.

use crate::error::{CacheError, CacheResult};
use crate::paths::{modified_millis, normalize_path, path_key, EpochMillis};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A regular expression that must match an entire normalized path.
///
/// The source text is kept verbatim; equality, display and persistence all
/// use it rather than the compiled form.
#[derive(Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    /// Compile a pattern. Fails with [`CacheError::InvalidPattern`].
    pub fn new(source: impl Into<String>) -> CacheResult<Self> {
        let source = source.into();
        match Regex::new(&format!("^(?:{})$", source)) {
            Ok(regex) => Ok(Self { source, regex }),
            Err(err) => Err(CacheError::InvalidPattern {
                pattern: source,
                source: err,
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True if the pattern matches the whole of `path_key`.
    pub fn matches(&self, path_key: &str) -> bool {
        self.regex.is_match(path_key)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for PathPattern {}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathPattern").field(&self.source).finish()
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for PathPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for PathPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        PathPattern::new(source).map_err(serde::de::Error::custom)
    }
}

/// A freeze pattern and the deadline it was declared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeRule {
    pub pattern: PathPattern,
    pub deadline: EpochMillis,
}

/// Everything the cache knows about one path, derived on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileStatus {
    /// Some ignore pattern matches the path.
    pub ignored: bool,
    /// Deadline of the first freeze pattern that matches, if any.
    pub freeze_deadline: Option<EpochMillis>,
    /// Modification time recorded when a freeze walk saw the file.
    pub frozen_at: Option<EpochMillis>,
    /// Timestamp of the last successful upload.
    pub last_uploaded: Option<EpochMillis>,
}

/// Upload history plus ignore/freeze policy.
///
/// Two stores are equal when their ignore lists match in order, their freeze
/// rules match pattern-and-deadline in order, and both timestamp maps hold the
/// same entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStore {
    #[serde(rename = "i", default)]
    ignored: Vec<PathPattern>,

    #[serde(rename = "f", default, with = "freeze_rules")]
    frozen: Vec<FreezeRule>,

    #[serde(rename = "ft", default)]
    frozen_at: BTreeMap<String, EpochMillis>,

    #[serde(rename = "t", default)]
    uploaded_at: BTreeMap<String, EpochMillis>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from disk.
    ///
    /// A missing, empty or whitespace-only file yields an empty store. Any
    /// other content must parse or the load fails with
    /// [`CacheError::MalformedStore`].
    pub fn load(path: &Path) -> CacheResult<Self> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No cache document at {}, starting empty", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(CacheError::Persistence {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if content.iter().all(u8::is_ascii_whitespace) {
            debug!("Cache document {} is empty, starting empty", path.display());
            return Ok(Self::default());
        }

        let malformed = |source: serde_json::Error| CacheError::MalformedStore {
            path: path.to_path_buf(),
            source,
        };
        let document: serde_json::Value = serde_json::from_slice(&content).map_err(malformed)?;
        if !document.is_object() {
            return Err(malformed(serde::de::Error::custom(
                "cache document must be a JSON object",
            )));
        }
        let store: CacheStore = serde_json::from_value(document).map_err(malformed)?;

        debug!(
            ignored = store.ignored.len(),
            frozen = store.frozen.len(),
            frozen_at = store.frozen_at.len(),
            uploaded_at = store.uploaded_at.len(),
            "Loaded cache document {}",
            path.display()
        );
        Ok(store)
    }

    /// Write the whole store to `path`, replacing any previous document.
    pub fn save(&self, path: &Path) -> CacheResult<()> {
        let persistence = |source: io::Error| CacheError::Persistence {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_vec(self).map_err(|err| persistence(err.into()))?;
        atomic_write(path, &json).map_err(persistence)
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Append an ignore pattern. Duplicates are kept.
    pub fn add_ignore(&mut self, pattern: PathPattern) {
        self.ignored.push(pattern);
    }

    /// Append a freeze rule. Duplicates are kept; the earliest still wins.
    pub fn add_freeze(&mut self, pattern: PathPattern, deadline: EpochMillis) {
        self.frozen.push(FreezeRule { pattern, deadline });
    }

    /// Walk `root` and record the current mtime of every entry whose path
    /// matches `pattern`, overwriting earlier snapshots.
    ///
    /// Entries that cannot be read are logged and skipped. Returns how many
    /// entries were recorded.
    pub fn record_frozen_timestamps(&mut self, root: &Path, pattern: &PathPattern) -> usize {
        let root = normalize_path(root);
        let mut recorded = 0usize;

        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Failed to walk entry under {}: {}", root.display(), err);
                    continue;
                }
            };

            let key = entry.path().to_string_lossy().into_owned();
            if !pattern.matches(&key) {
                continue;
            }

            // Follows a matched symlink, as the live stat in `decide` does.
            let modified = fs::metadata(entry.path()).and_then(|metadata| modified_millis(&metadata));
            match modified {
                Ok(modified) => {
                    self.frozen_at.insert(key, modified);
                    recorded += 1;
                }
                Err(err) => {
                    warn!("Failed to read date of frozen file {}: {}", key, err);
                }
            }
        }

        recorded
    }

    /// Remember that `path` was last uploaded at `timestamp`.
    pub fn record_upload(&mut self, path: &Path, timestamp: EpochMillis) {
        self.uploaded_at.insert(path_key(path), timestamp);
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn is_ignored(&self, path: &Path) -> bool {
        let key = path_key(path);
        self.ignored.iter().any(|pattern| pattern.matches(&key))
    }

    /// Deadline of the first freeze rule matching `path`.
    pub fn freeze_deadline(&self, path: &Path) -> Option<EpochMillis> {
        let key = path_key(path);
        self.frozen
            .iter()
            .find(|rule| rule.pattern.matches(&key))
            .map(|rule| rule.deadline)
    }

    pub fn file_status(&self, path: &Path) -> FileStatus {
        let key = path_key(path);
        FileStatus {
            ignored: self.ignored.iter().any(|pattern| pattern.matches(&key)),
            freeze_deadline: self
                .frozen
                .iter()
                .find(|rule| rule.pattern.matches(&key))
                .map(|rule| rule.deadline),
            frozen_at: self.frozen_at.get(&key).copied(),
            last_uploaded: self.uploaded_at.get(&key).copied(),
        }
    }

    pub fn ignored_patterns(&self) -> &[PathPattern] {
        &self.ignored
    }

    pub fn freeze_rules(&self) -> &[FreezeRule] {
        &self.frozen
    }

    /// Freeze-time snapshots keyed by normalized path.
    pub fn frozen_timestamps(&self) -> &BTreeMap<String, EpochMillis> {
        &self.frozen_at
    }

    /// Upload timestamps keyed by normalized path.
    pub fn upload_timestamps(&self) -> &BTreeMap<String, EpochMillis> {
        &self.uploaded_at
    }

    pub fn frozen_timestamp(&self, path: &Path) -> Option<EpochMillis> {
        self.frozen_at.get(&path_key(path)).copied()
    }

    pub fn upload_timestamp(&self, path: &Path) -> Option<EpochMillis> {
        self.uploaded_at.get(&path_key(path)).copied()
    }
}

/// Atomic write via temp file + rename in the destination directory.
fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache".to_string());
    let temp_path = parent.join(format!(".{}.tmp_{}", file_name, uuid::Uuid::new_v4()));

    fs::write(&temp_path, content)?;
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    Ok(())
}

/// `f` is written as an object in rule order. On load an object or a list of
/// `[pattern, deadline]` pairs is accepted, keeping document order either way.
mod freeze_rules {
    use super::{EpochMillis, FreezeRule, PathPattern};
    use serde::de::{MapAccess, SeqAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(rules: &[FreezeRule], serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(rules.len()))?;
        for rule in rules {
            map.serialize_entry(rule.pattern.as_str(), &rule.deadline)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<FreezeRule>, D::Error> {
        deserializer.deserialize_any(FreezeRulesVisitor)
    }

    struct FreezeRulesVisitor;

    impl<'de> Visitor<'de> for FreezeRulesVisitor {
        type Value = Vec<FreezeRule>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of pattern to deadline or a list of [pattern, deadline] pairs")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut rules = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((pattern, deadline)) = access.next_entry::<PathPattern, EpochMillis>()? {
                rules.push(FreezeRule { pattern, deadline });
            }
            Ok(rules)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut rules = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some((pattern, deadline)) = seq.next_element::<(PathPattern, EpochMillis)>()? {
                rules.push(FreezeRule { pattern, deadline });
            }
            Ok(rules)
        }
    }
}
