//! Workflow location resolution
//!
//! Turns a user-supplied location string into a [`CanonicalLocation`], the
//! deduplicated local directory reference used as the registry key.
//!
//! Accepted forms:
//! - `file:` URIs
//! - `callflow://workspace/<path>`: relative to the workspace root
//! - `callflow://context/<path>`: relative to the current location
//! - `/path`: relative to the workspace root
//! - `path`: relative to the current location
//!
//! A string that does not parse as a URI falls through to path interpretation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use url::Url;

use super::error::{ResolutionError, ResolutionResult};

/// URI scheme for workspace/context references
pub const REFERENCE_SCHEME: &str = "callflow";

/// Reference anchor: the workspace root
pub const WORKSPACE_ANCHOR: &str = "workspace";

/// Reference anchor: the caller's current location
pub const CONTEXT_ANCHOR: &str = "context";

/// Canonical, absolute local directory of a callee
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalLocation(PathBuf);

impl CanonicalLocation {
    /// Wrap a path that is already canonical.
    ///
    /// No filesystem access happens here; use [`resolve`] for user input.
    pub fn from_canonical(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Borrow the underlying path
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Whether this location lies at or below `scope`
    pub fn is_within(&self, scope: &Path) -> bool {
        self.0.starts_with(scope)
    }

    /// Last path component, used as the callee's display name
    pub fn display_name(&self) -> String {
        self.0
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }
}

impl AsRef<Path> for CanonicalLocation {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CanonicalLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Where relative locations are anchored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveContext {
    /// Root for `/`-prefixed paths and workspace references
    pub workspace_root: PathBuf,
    /// Base for relative paths and context references
    pub current_dir: PathBuf,
}

impl ResolveContext {
    /// Context rooted at `workspace_root` whose current location is `current_dir`
    pub fn new(workspace_root: impl Into<PathBuf>, current_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            current_dir: current_dir.into(),
        }
    }

    /// Context whose current location is the workspace root itself
    pub fn rooted_at(workspace_root: impl Into<PathBuf>) -> Self {
        let root = workspace_root.into();
        Self {
            current_dir: root.clone(),
            workspace_root: root,
        }
    }
}

/// Resolve a location string to an existing local directory.
pub fn resolve(location: &str, context: &ResolveContext) -> ResolutionResult<CanonicalLocation> {
    let location = location.trim();
    if location.is_empty() {
        return Err(ResolutionError::Empty);
    }

    let candidate = match parse_uri(location) {
        Some(uri) => uri_to_path(&uri, context)?,
        None => path_to_candidate(location, context),
    };

    canonicalize_dir(candidate)
}

/// Parse `location` as a URI, or `None` if it should be treated as a path.
///
/// Single-letter schemes are Windows drive prefixes, not URIs.
fn parse_uri(location: &str) -> Option<Url> {
    match Url::parse(location) {
        Ok(uri) if uri.scheme().len() > 1 => Some(uri),
        Ok(_) => None,
        Err(err) => {
            tracing::trace!(location, %err, "not a URI, resolving as path");
            None
        }
    }
}

fn uri_to_path(uri: &Url, context: &ResolveContext) -> ResolutionResult<PathBuf> {
    match uri.scheme() {
        "file" => uri
            .to_file_path()
            .map_err(|_| ResolutionError::InvalidUri(uri.to_string())),
        REFERENCE_SCHEME => {
            let anchor = match uri.host_str() {
                Some(WORKSPACE_ANCHOR) => &context.workspace_root,
                Some(CONTEXT_ANCHOR) => &context.current_dir,
                Some(other) => return Err(ResolutionError::UnknownReference(other.to_string())),
                None => return Err(ResolutionError::InvalidUri(uri.to_string())),
            };
            let mut path = anchor.clone();
            for segment in uri.path().split('/').filter(|s| !s.is_empty()) {
                let decoded = urlencoding::decode(segment)
                    .map_err(|_| ResolutionError::InvalidUri(uri.to_string()))?;
                path.push(decoded.as_ref());
            }
            Ok(path)
        }
        other => Err(ResolutionError::UnsupportedScheme(other.to_string())),
    }
}

fn path_to_candidate(location: &str, context: &ResolveContext) -> PathBuf {
    let relative = Path::new(location);
    if location.starts_with('/') || location.starts_with(std::path::MAIN_SEPARATOR) {
        let stripped: PathBuf = relative
            .components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect();
        context.workspace_root.join(stripped)
    } else {
        context.current_dir.join(relative)
    }
}

fn canonicalize_dir(candidate: PathBuf) -> ResolutionResult<CanonicalLocation> {
    let canonical = std::fs::canonicalize(&candidate)
        .map_err(|_| ResolutionError::NotFound(candidate.clone()))?;
    if !canonical.is_dir() {
        return Err(ResolutionError::NotADirectory(canonical));
    }
    Ok(CanonicalLocation(canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, ResolveContext) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("flows/child")).unwrap();
        std::fs::create_dir_all(root.join("callers/main")).unwrap();
        std::fs::create_dir_all(root.join("callers/main/local flow")).unwrap();
        std::fs::write(root.join("flows/readme.txt"), b"x").unwrap();
        let context = ResolveContext::new(&root, root.join("callers/main"));
        (temp, context)
    }

    #[test]
    fn test_root_relative_path() {
        let (_temp, context) = workspace();
        let resolved = resolve("/flows/child", &context).unwrap();
        assert_eq!(resolved.path(), context.workspace_root.join("flows/child"));
    }

    #[test]
    fn test_context_relative_path() {
        let (_temp, context) = workspace();
        let resolved = resolve("../../flows/child", &context).unwrap();
        assert_eq!(resolved.path(), context.workspace_root.join("flows/child"));
    }

    #[test]
    fn test_same_directory_dedupes() {
        let (_temp, context) = workspace();
        let a = resolve("/flows/child", &context).unwrap();
        let b = resolve("../../flows/./child", &context).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_file_uri() {
        let (_temp, context) = workspace();
        let target = context.workspace_root.join("flows/child");
        let uri = Url::from_file_path(&target).unwrap();
        let resolved = resolve(uri.as_str(), &context).unwrap();
        assert_eq!(resolved.path(), target);
    }

    #[test]
    fn test_reference_uris() {
        let (_temp, context) = workspace();
        let from_root = resolve("callflow://workspace/flows/child", &context).unwrap();
        assert_eq!(from_root.path(), context.workspace_root.join("flows/child"));

        let from_context = resolve("callflow://context/local%20flow", &context).unwrap();
        assert_eq!(from_context.path(), context.current_dir.join("local flow"));
    }

    #[test]
    fn test_unknown_reference_and_scheme() {
        let (_temp, context) = workspace();
        assert!(matches!(
            resolve("callflow://elsewhere/flows", &context),
            Err(ResolutionError::UnknownReference(_))
        ));
        assert!(matches!(
            resolve("https://example.com/flows", &context),
            Err(ResolutionError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_missing_and_non_directory() {
        let (_temp, context) = workspace();
        assert!(matches!(
            resolve("/flows/nope", &context),
            Err(ResolutionError::NotFound(_))
        ));
        assert!(matches!(
            resolve("/flows/readme.txt", &context),
            Err(ResolutionError::NotADirectory(_))
        ));
        assert!(matches!(resolve("  ", &context), Err(ResolutionError::Empty)));
    }
}
