use std::path::{Path, PathBuf};

/// Expands a leading `~` to the current user's home directory.
///
/// Returns `None` when the path needs a home directory and none is known.
#[must_use]
pub fn expand_home(raw: &str) -> Option<PathBuf> {
    if raw == "~" {
        return dirs::home_dir();
    }
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => Some(PathBuf::from(raw)),
    }
}

/// Case-insensitive allow-list of file extensions.
///
/// An empty list admits every path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionFilter {
    allowed: Vec<String>,
}

impl ExtensionFilter {
    /// Builds the filter. Entries are lower-cased and dot-prefixed, so
    /// `"TXT"` and `".txt"` are equivalent.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed: Vec<String> = Vec::new();
        for raw in extensions {
            let trimmed = raw.as_ref().trim().to_lowercase();
            if trimmed.is_empty() || trimmed == "." {
                continue;
            }
            let normalized = if trimmed.starts_with('.') {
                trimmed
            } else {
                format!(".{trimmed}")
            };
            if !allowed.contains(&normalized) {
                allowed.push(normalized);
            }
        }
        Self { allowed }
    }

    /// Normalized entries.
    #[must_use]
    pub fn extensions(&self) -> &[String] {
        &self.allowed
    }

    /// Whether a change on `path` should be published.
    #[must_use]
    pub fn allows(&self, path: &Path) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_lowercase()))
            .is_some_and(|ext| self.allowed.contains(&ext))
    }
}
