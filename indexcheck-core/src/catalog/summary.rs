use serde::Serialize;
use std::collections::BTreeSet;

/// Packages, channels and bundle versions read back from a catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogSummary {
    pub packages: Vec<PackageSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSummary {
    pub name: String,
    pub default_channel: Option<String>,
    pub channels: Vec<ChannelSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSummary {
    pub name: String,
    pub head: String,
    /// Head first, then following `replaces`
    pub bundles: Vec<BundleVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleVersion {
    pub name: String,
    pub version: String,
}

impl CatalogSummary {
    pub fn package(&self, name: &str) -> Option<&PackageSummary> {
        self.packages.iter().find(|p| p.name == name)
    }
}

impl PackageSummary {
    pub fn channel(&self, name: &str) -> Option<&ChannelSummary> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Distinct bundle versions across all channels
    pub fn versions(&self) -> BTreeSet<String> {
        self.channels
            .iter()
            .flat_map(|c| c.bundles.iter().map(|b| b.version.clone()))
            .collect()
    }
}

impl ChannelSummary {
    /// Version of the head bundle
    pub fn head_version(&self) -> Option<&str> {
        self.bundles
            .iter()
            .find(|b| b.name == self.head)
            .map(|b| b.version.as_str())
    }
}
