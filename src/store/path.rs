//! Path validation and the reserved layout.
//!
//! Paths are '/'-delimited and absolute. The root is "/"; every other valid
//! path starts with '/', has no empty tokens and no trailing '/'.
//!
//! All coordination metadata lives under a reserved base path:
//!
//! ```text
//! <base>/lock/<resource>/{read|write}-<seq>
//! <base>/lease/<lease_id>/lease-<seq>
//! <base>/data/<relative>/<index>
//! ```

use crate::core::error::{KeelError, KeelResult};
use serde::{Deserialize, Serialize};

/// Separator between path tokens.
pub const SEPARATOR: char = '/';

/// Root path.
pub const ROOT: &str = "/";

/// Top-level category under the base path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    Lock,
    Lease,
    Data,
    Conf,
    Presence,
    Internal,
}

impl PathKind {
    /// Path token for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Lease => "lease",
            Self::Data => "data",
            Self::Conf => "conf",
            Self::Presence => "presence",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for PathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps path kinds and relative names to absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathScheme {
    base_path: String,
}

impl PathScheme {
    /// Create a scheme rooted at `base_path`.
    pub fn new(base_path: impl Into<String>) -> KeelResult<Self> {
        let base_path = base_path.into();
        if !Self::is_valid_path(&base_path) || base_path == ROOT {
            return Err(KeelError::invalid_path(base_path));
        }
        Ok(Self { base_path })
    }

    /// Reserved base path.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Root of a path kind, e.g. `/keel/lock`.
    pub fn absolute(&self, kind: PathKind) -> String {
        format!("{}/{}", self.base_path, kind)
    }

    /// Absolute path of `relative` under a path kind.
    ///
    /// `relative` may be empty (the kind root) or a '/'-joined sequence of
    /// valid tokens, optionally with a leading '/'.
    pub fn absolute_with(&self, kind: PathKind, relative: &str) -> KeelResult<String> {
        let relative = relative.strip_prefix(SEPARATOR).unwrap_or(relative);
        if relative.is_empty() {
            return Ok(self.absolute(kind));
        }
        let tokens = Self::tokenize(relative);
        Ok(format!("{}/{}", self.absolute(kind), Self::join_tokens(&tokens)?))
    }

    /// Root under which tickets for `resource` are created.
    pub fn lock_root(&self, resource: &str) -> KeelResult<String> {
        self.keyed_root(PathKind::Lock, resource)
    }

    /// Root under which tickets for `lease_id` are created.
    pub fn lease_root(&self, lease_id: &str) -> KeelResult<String> {
        self.keyed_root(PathKind::Lease, lease_id)
    }

    fn keyed_root(&self, kind: PathKind, key: &str) -> KeelResult<String> {
        if !Self::is_valid_token(key) {
            return Err(KeelError::invalid_request(format!(
                "invalid {} id: '{}'",
                kind, key
            )));
        }
        Ok(format!("{}/{}", self.absolute(kind), key))
    }

    /// Parent of a valid path. The root has no parent.
    pub fn parent(path: &str) -> KeelResult<Option<String>> {
        if !Self::is_valid_path(path) {
            return Err(KeelError::invalid_path(path));
        }
        if path == ROOT {
            return Ok(None);
        }
        match path.rfind(SEPARATOR) {
            Some(0) => Ok(Some(ROOT.to_string())),
            Some(idx) => Ok(Some(path[..idx].to_string())),
            None => Err(KeelError::invalid_path(path)),
        }
    }

    /// Last token of a path, empty for the root.
    pub fn leaf(path: &str) -> &str {
        path.rsplit(SEPARATOR).next().unwrap_or("")
    }

    /// Join a parent path and a child token.
    pub fn join(parent: &str, child: &str) -> KeelResult<String> {
        if !Self::is_valid_path(parent) {
            return Err(KeelError::invalid_path(parent));
        }
        let child = child.trim_matches(SEPARATOR);
        if child.is_empty() {
            return Ok(parent.to_string());
        }
        let tokens = Self::tokenize(child);
        let joined = Self::join_tokens(&tokens)?;
        if parent == ROOT {
            Ok(format!("/{}", joined))
        } else {
            Ok(format!("{}/{}", parent, joined))
        }
    }

    /// Split a path into its tokens, ignoring leading and trailing separators.
    pub fn tokenize(path: &str) -> Vec<&str> {
        let trimmed = path.trim().trim_matches(SEPARATOR);
        if trimmed.is_empty() {
            return Vec::new();
        }
        trimmed.split(SEPARATOR).collect()
    }

    /// Join tokens with the separator. Every token must be valid.
    pub fn join_tokens<S: AsRef<str>>(tokens: &[S]) -> KeelResult<String> {
        let mut out = String::new();
        for token in tokens {
            let token = token.as_ref();
            if !Self::is_valid_token(token) {
                return Err(KeelError::invalid_request(format!(
                    "invalid path token: '{}'",
                    token
                )));
            }
            if !out.is_empty() {
                out.push(SEPARATOR);
            }
            out.push_str(token);
        }
        Ok(out)
    }

    /// Check that a token is non-blank and contains no separator.
    pub fn is_valid_token(token: &str) -> bool {
        !token.trim().is_empty() && !token.contains(SEPARATOR)
    }

    /// Check that a path is the root or an absolute path of valid tokens.
    pub fn is_valid_path(path: &str) -> bool {
        if path == ROOT {
            return true;
        }
        match path.strip_prefix(SEPARATOR) {
            Some(rest) => !rest.is_empty() && rest.split(SEPARATOR).all(Self::is_valid_token),
            None => false,
        }
    }

    /// Validate a path, returning it unchanged.
    pub fn check(path: &str) -> KeelResult<&str> {
        if Self::is_valid_path(path) {
            Ok(path)
        } else {
            Err(KeelError::invalid_path(path))
        }
    }
}

impl Default for PathScheme {
    fn default() -> Self {
        Self {
            base_path: "/keel".to_string(),
        }
    }
}
