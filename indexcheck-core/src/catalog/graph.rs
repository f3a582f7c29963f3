//! Channel head selection for bundles added without a package manifest

use std::collections::{BTreeSet, HashSet};

use super::CatalogError;
use crate::manifest::{PackageChannel, PackageManifest};

/// A bundle and the channels its annotations place it in
#[derive(Debug, Clone)]
pub struct ChannelMember {
    pub name: String,
    pub version: String,
    pub replaces: Option<String>,
    pub skips: Vec<String>,
    pub channels: Vec<String>,
}

/// Derive a package manifest from channel members
///
/// A channel's head is the member that no other member of the same channel
/// replaces or skips. When several qualify, the highest semantic version
/// wins (plain string order for versions that do not parse).
pub fn compute_package_manifest(
    package: &str,
    members: &[ChannelMember],
    default_channel: Option<&str>,
) -> Result<PackageManifest, CatalogError> {
    let channel_names: BTreeSet<&str> = members
        .iter()
        .flat_map(|m| m.channels.iter().map(String::as_str))
        .collect();

    let mut channels = Vec::new();
    for channel in channel_names {
        let in_channel: Vec<&ChannelMember> = members
            .iter()
            .filter(|m| m.channels.iter().any(|c| c == channel))
            .collect();

        let superseded: HashSet<&str> = in_channel
            .iter()
            .flat_map(|m| {
                m.replaces
                    .iter()
                    .map(String::as_str)
                    .chain(m.skips.iter().map(String::as_str))
            })
            .collect();

        let head = in_channel
            .iter()
            .filter(|m| !superseded.contains(m.name.as_str()))
            .max_by(|a, b| compare_versions(&a.version, &b.version))
            .ok_or_else(|| CatalogError::ReplacesCycle {
                package: package.to_string(),
                channel: channel.to_string(),
                bundle: in_channel
                    .first()
                    .map(|m| m.name.clone())
                    .unwrap_or_default(),
            })?;

        channels.push(PackageChannel {
            name: channel.to_string(),
            current_csv: head.name.clone(),
        });
    }

    Ok(PackageManifest {
        package_name: package.to_string(),
        channels,
        default_channel: default_channel.map(str::to_string),
    })
}

/// Semver order, or string order when either side is not semver
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}
