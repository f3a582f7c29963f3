use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use super::migrations;
use super::summary::{BundleVersion, CatalogSummary, ChannelSummary, PackageSummary};
use super::{Bundle, CatalogError};
use crate::manifest::{PackageChannel, PackageManifest};

const BUNDLE_COLUMNS: &str =
    "name, package_name, version, replaces, skips, skiprange, bundlepath, csv, bundle";

/// Handle to a catalog database file
pub struct CatalogDatabase {
    conn: Connection,
}

impl CatalogDatabase {
    /// Open (creating if needed) a database file
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        debug!("Opening catalog database {:?}", path);
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CatalogError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    /// Bring the schema to the latest version
    pub fn migrate(&mut self) -> Result<i64, CatalogError> {
        migrations::migrate(&mut self.conn)
    }

    /// Insert a bundle; names are unique
    pub fn add_bundle(&mut self, bundle: &Bundle) -> Result<(), CatalogError> {
        if self.get_bundle(&bundle.name)?.is_some() {
            return Err(CatalogError::DuplicateBundle(bundle.name.clone()));
        }

        let csv = encode(&bundle.name, &bundle.csv)?;
        let objects = encode(&bundle.name, &bundle.objects)?;
        let skips = encode(&bundle.name, &bundle.skips)?;

        self.conn.execute(
            "INSERT INTO operatorbundle (name, package_name, version, replaces, skips, skiprange, bundlepath, csv, bundle)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                bundle.name,
                bundle.package_name,
                bundle.version,
                bundle.replaces,
                skips,
                bundle.skip_range,
                bundle.bundle_path,
                csv,
                objects
            ],
        )?;
        debug!("Loaded bundle {} ({})", bundle.name, bundle.version);
        Ok(())
    }

    pub fn get_bundle(&self, name: &str) -> Result<Option<Bundle>, CatalogError> {
        let sql = format!("SELECT {BUNDLE_COLUMNS} FROM operatorbundle WHERE name = ?1");
        let row = self
            .conn
            .query_row(&sql, params![name], read_bundle_row)
            .optional()?;
        row.transpose()
    }

    /// Replace a package's channels with those in `manifest`
    ///
    /// Each channel's entries are rebuilt by walking `replaces` from the head.
    /// Skipped bundles become extra edges of the skipping bundle and need not
    /// be loaded; a missing `replaces` target is an error.
    pub fn add_package_channels(&mut self, manifest: &PackageManifest) -> Result<(), CatalogError> {
        let package = manifest.package_name.as_str();
        if manifest.channels.is_empty() {
            return Err(CatalogError::NoChannels {
                package: package.to_string(),
            });
        }
        let default_channel = manifest
            .effective_default_channel()
            .ok_or_else(|| CatalogError::MissingDefaultChannel {
                package: package.to_string(),
            })?;
        if !manifest.channels.iter().any(|c| c.name == default_channel) {
            return Err(CatalogError::UnknownDefaultChannel {
                package: package.to_string(),
                channel: default_channel.to_string(),
            });
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM channel_entry WHERE package_name = ?1",
            params![package],
        )?;
        tx.execute("DELETE FROM channel WHERE package_name = ?1", params![package])?;
        tx.execute(
            "INSERT INTO package (name, default_channel) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET default_channel = excluded.default_channel",
            params![package, default_channel],
        )?;

        for channel in &manifest.channels {
            add_channel(&tx, package, channel)?;
        }

        tx.commit()?;
        debug!(
            "Package {} now has {} channel(s), default {}",
            package,
            manifest.channels.len(),
            default_channel
        );
        Ok(())
    }

    pub fn package_names(&self) -> Result<Vec<String>, CatalogError> {
        let mut stmt = self.conn.prepare("SELECT name FROM package ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Package manifest as stored: channels with their heads
    pub fn get_package(&self, name: &str) -> Result<Option<PackageManifest>, CatalogError> {
        let default_channel: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT default_channel FROM package WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(default_channel) = default_channel else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT name, head_operatorbundle_name FROM channel WHERE package_name = ?1 ORDER BY name",
        )?;
        let channels = stmt
            .query_map(params![name], |row| {
                Ok(PackageChannel {
                    name: row.get(0)?,
                    current_csv: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(PackageManifest {
            package_name: name.to_string(),
            channels,
            default_channel,
        }))
    }

    /// Bundle names of a channel, head first
    pub fn channel_bundle_names(&self, package: &str, channel: &str) -> Result<Vec<String>, CatalogError> {
        let mut stmt = self.conn.prepare(
            "SELECT operatorbundle_name, MIN(depth) AS d FROM channel_entry
             WHERE package_name = ?1 AND channel_name = ?2
             GROUP BY operatorbundle_name ORDER BY d, operatorbundle_name",
        )?;
        let names = stmt
            .query_map(params![package, channel], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Channels a bundle appears in
    pub fn bundle_channels(&self, bundle: &str) -> Result<Vec<String>, CatalogError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT channel_name FROM channel_entry WHERE operatorbundle_name = ?1 ORDER BY channel_name",
        )?;
        let channels = stmt
            .query_map(params![bundle], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(channels)
    }

    /// Every loaded bundle that belongs to `package`
    pub fn bundles_for_package(&self, package: &str) -> Result<Vec<Bundle>, CatalogError> {
        let sql = format!(
            "SELECT {BUNDLE_COLUMNS} FROM operatorbundle
             WHERE package_name = ?1
                OR name IN (SELECT operatorbundle_name FROM channel_entry WHERE package_name = ?1)
             ORDER BY name"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![package], read_bundle_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Everything loaded, in a comparable shape
    pub fn summary(&self) -> Result<CatalogSummary, CatalogError> {
        let mut packages = Vec::new();
        for name in self.package_names()? {
            let Some(manifest) = self.get_package(&name)? else {
                continue;
            };

            let mut channels = Vec::new();
            for channel in &manifest.channels {
                let mut bundles = Vec::new();
                for bundle_name in self.channel_bundle_names(&name, &channel.name)? {
                    let version = self
                        .get_bundle(&bundle_name)?
                        .map(|b| b.version)
                        .unwrap_or_default();
                    bundles.push(BundleVersion {
                        name: bundle_name,
                        version,
                    });
                }
                channels.push(ChannelSummary {
                    name: channel.name.clone(),
                    head: channel.current_csv.clone(),
                    bundles,
                });
            }

            packages.push(PackageSummary {
                name,
                default_channel: manifest.default_channel,
                channels,
            });
        }
        Ok(CatalogSummary { packages })
    }
}

fn add_channel(
    tx: &rusqlite::Transaction<'_>,
    package: &str,
    channel: &PackageChannel,
) -> Result<(), CatalogError> {
    tx.execute(
        "INSERT INTO channel (name, package_name, head_operatorbundle_name) VALUES (?1, ?2, ?3)",
        params![channel.name, package, channel.current_csv],
    )?;

    let mut visited = HashSet::new();
    let mut previous: Option<String> = None;
    let mut current = channel.current_csv.clone();
    let mut depth: i64 = 0;

    loop {
        let edges: Option<(Option<String>, Option<String>)> = tx
            .query_row(
                "SELECT replaces, skips FROM operatorbundle WHERE name = ?1",
                params![current],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((replaces, skips)) = edges else {
            return Err(match previous {
                None => CatalogError::MissingHead {
                    package: package.to_string(),
                    channel: channel.name.clone(),
                    head: current,
                },
                Some(bundle) => CatalogError::MissingReplaces {
                    bundle,
                    replaces: current,
                },
            });
        };
        let skips: Vec<String> = skips
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()
            .map_err(|source| CatalogError::Encode {
                name: current.clone(),
                source,
            })?
            .unwrap_or_default();

        tx.execute(
            "INSERT INTO channel_entry (channel_name, package_name, operatorbundle_name, replaces, depth)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![channel.name, package, current, replaces, depth],
        )?;
        for skipped in &skips {
            tx.execute(
                "INSERT INTO channel_entry (channel_name, package_name, operatorbundle_name, replaces, depth)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![channel.name, package, current, skipped, depth],
            )?;
        }
        tx.execute(
            "UPDATE operatorbundle SET package_name = ?1 WHERE name = ?2",
            params![package, current],
        )?;

        visited.insert(current.clone());
        match replaces {
            None => return Ok(()),
            Some(next) if visited.contains(&next) => {
                return Err(CatalogError::ReplacesCycle {
                    package: package.to_string(),
                    channel: channel.name.clone(),
                    bundle: next,
                })
            }
            Some(next) => {
                previous = Some(std::mem::replace(&mut current, next));
                depth += 1;
            }
        }
    }
}

type BundleRow = Result<Bundle, CatalogError>;

/// Map a row of [`BUNDLE_COLUMNS`]; JSON decode failures are reported per row
fn read_bundle_row(row: &Row<'_>) -> rusqlite::Result<BundleRow> {
    let name: String = row.get(0)?;
    let skips: Option<String> = row.get(4)?;
    let csv: String = row.get(7)?;
    let objects: String = row.get(8)?;

    let decoded = (|| {
        let skips: Vec<String> = match skips.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        let csv: Value = serde_json::from_str(&csv)?;
        let objects: Vec<Value> = serde_json::from_str(&objects)?;
        Ok::<_, serde_json::Error>((skips, csv, objects))
    })();

    Ok(match decoded {
        Ok((skips, csv, objects)) => Ok(Bundle {
            name,
            package_name: row.get(1)?,
            version: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            replaces: row.get(3)?,
            skips,
            skip_range: row.get(5)?,
            bundle_path: row.get(6)?,
            csv,
            objects,
        }),
        Err(source) => Err(CatalogError::Encode { name, source }),
    })
}

fn encode<T: serde::Serialize + ?Sized>(name: &str, value: &T) -> Result<String, CatalogError> {
    serde_json::to_string(value).map_err(|source| CatalogError::Encode {
        name: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::bundle;
    use pretty_assertions::assert_eq;

    fn migrated() -> CatalogDatabase {
        let mut db = CatalogDatabase::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn manifest(package: &str, channels: &[(&str, &str)], default: Option<&str>) -> PackageManifest {
        PackageManifest {
            package_name: package.to_string(),
            channels: channels
                .iter()
                .map(|(name, head)| PackageChannel {
                    name: name.to_string(),
                    current_csv: head.to_string(),
                })
                .collect(),
            default_channel: default.map(str::to_string),
        }
    }

    fn load_prometheus(db: &mut CatalogDatabase) {
        db.add_bundle(&bundle("prometheusoperator.0.14.0", "0.14.0", None, &[]))
            .unwrap();
        db.add_bundle(&bundle(
            "prometheusoperator.0.15.0",
            "0.15.0",
            Some("prometheusoperator.0.14.0"),
            &[],
        ))
        .unwrap();
        db.add_bundle(&bundle(
            "prometheusoperator.0.22.2",
            "0.22.2",
            Some("prometheusoperator.0.15.0"),
            &["prometheusoperator.0.22.1"],
        ))
        .unwrap();
    }

    #[test]
    fn test_bundle_round_trip() {
        let mut db = migrated();
        let original = bundle("a.1.0.0", "1.0.0", Some("a.0.9.0"), &["a.0.9.5"])
            .with_bundle_path("quay.io/x/y:abc");
        db.add_bundle(&original).unwrap();

        let loaded = db.get_bundle("a.1.0.0").unwrap().unwrap();
        assert_eq!(loaded, original);
        assert!(db.get_bundle("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_bundle_rejected() {
        let mut db = migrated();
        db.add_bundle(&bundle("a.1.0.0", "1.0.0", None, &[])).unwrap();
        let err = db.add_bundle(&bundle("a.1.0.0", "1.0.0", None, &[])).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateBundle(name) if name == "a.1.0.0"));
    }

    #[test]
    fn test_channel_graph_from_head() {
        let mut db = migrated();
        load_prometheus(&mut db);
        db.add_package_channels(&manifest(
            "prometheus",
            &[("preview", "prometheusoperator.0.22.2")],
            Some("preview"),
        ))
        .unwrap();

        assert_eq!(
            db.channel_bundle_names("prometheus", "preview").unwrap(),
            vec![
                "prometheusoperator.0.22.2",
                "prometheusoperator.0.15.0",
                "prometheusoperator.0.14.0"
            ]
        );
        assert_eq!(
            db.bundle_channels("prometheusoperator.0.14.0").unwrap(),
            vec!["preview"]
        );

        let package = db.get_package("prometheus").unwrap().unwrap();
        assert_eq!(package.default_channel.as_deref(), Some("preview"));
        assert_eq!(package.channels[0].current_csv, "prometheusoperator.0.22.2");

        let owned = db.bundles_for_package("prometheus").unwrap();
        assert_eq!(owned.len(), 3);
        assert!(owned
            .iter()
            .all(|b| b.package_name.as_deref() == Some("prometheus")));
    }

    #[test]
    fn test_missing_head() {
        let mut db = migrated();
        load_prometheus(&mut db);
        let err = db
            .add_package_channels(&manifest("prometheus", &[("preview", "nope")], None))
            .unwrap_err();
        assert!(matches!(err, CatalogError::MissingHead { head, .. } if head == "nope"));
    }

    #[test]
    fn test_missing_replaces_target() {
        let mut db = migrated();
        db.add_bundle(&bundle("a.2.0.0", "2.0.0", Some("a.1.0.0"), &[]))
            .unwrap();
        let err = db
            .add_package_channels(&manifest("a", &[("stable", "a.2.0.0")], None))
            .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::MissingReplaces { bundle, replaces }
                if bundle == "a.2.0.0" && replaces == "a.1.0.0"
        ));
        // Failed transaction leaves nothing behind
        assert!(db.get_package("a").unwrap().is_none());
    }

    #[test]
    fn test_replaces_cycle() {
        let mut db = migrated();
        db.add_bundle(&bundle("a.1", "1.0.0", Some("a.2"), &[])).unwrap();
        db.add_bundle(&bundle("a.2", "2.0.0", Some("a.1"), &[])).unwrap();
        let err = db
            .add_package_channels(&manifest("a", &[("stable", "a.2")], None))
            .unwrap_err();
        assert!(matches!(err, CatalogError::ReplacesCycle { .. }));
    }

    #[test]
    fn test_default_channel_validation() {
        let mut db = migrated();
        load_prometheus(&mut db);

        let err = db
            .add_package_channels(&manifest(
                "prometheus",
                &[("preview", "prometheusoperator.0.22.2")],
                Some("stable"),
            ))
            .unwrap_err();
        assert!(matches!(err, CatalogError::UnknownDefaultChannel { .. }));

        let err = db
            .add_package_channels(&manifest(
                "prometheus",
                &[
                    ("preview", "prometheusoperator.0.22.2"),
                    ("beta", "prometheusoperator.0.15.0"),
                ],
                None,
            ))
            .unwrap_err();
        assert!(matches!(err, CatalogError::MissingDefaultChannel { .. }));
    }

    #[test]
    fn test_channels_are_replaced_not_appended() {
        let mut db = migrated();
        load_prometheus(&mut db);
        db.add_package_channels(&manifest(
            "prometheus",
            &[("preview", "prometheusoperator.0.15.0")],
            None,
        ))
        .unwrap();
        db.add_package_channels(&manifest(
            "prometheus",
            &[("preview", "prometheusoperator.0.22.2")],
            None,
        ))
        .unwrap();

        let names = db.channel_bundle_names("prometheus", "preview").unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(names[0], "prometheusoperator.0.22.2");
    }

    #[test]
    fn test_summary() {
        let mut db = migrated();
        load_prometheus(&mut db);
        db.add_package_channels(&manifest(
            "prometheus",
            &[("preview", "prometheusoperator.0.22.2")],
            Some("preview"),
        ))
        .unwrap();

        let summary = db.summary().unwrap();
        let package = summary.package("prometheus").unwrap();
        let channel = package.channel("preview").unwrap();
        assert_eq!(channel.head, "prometheusoperator.0.22.2");
        assert_eq!(
            channel
                .bundles
                .iter()
                .map(|b| b.version.as_str())
                .collect::<Vec<_>>(),
            vec!["0.22.2", "0.15.0", "0.14.0"]
        );
    }
}
