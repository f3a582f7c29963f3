//! Image references (`repository:tag`)

use serde::{Deserialize, Serialize};
use std::fmt;

/// A container image reference built from a fixed repository and a run tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_concatenates() {
        let image = ImageReference::new("quay.io/olmtest/e2e-bundle", "abc123");
        assert_eq!(image.to_string(), "quay.io/olmtest/e2e-bundle:abc123");
    }
}
