use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{InvalidConfigSnafu, Result};

const DEFAULT_BATCH_SIZE: usize = 16;

/// An EPSG spatial reference id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Srid(pub u32);

impl Srid {
    pub const WGS84: Srid = Srid(4326);
    pub const WEB_MERCATOR: Srid = Srid(3857);
}

impl fmt::Display for Srid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

/// Where the reference cache keeps its entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    #[default]
    InMemory,
    /// Memory-mapped temporary files, for datasets that don't fit in RAM.
    TempDisk,
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Number of blocks decoded at the same time.
    pub concurrency: usize,
    /// Number of consecutive blocks cached, assembled and persisted together.
    pub batch_size: usize,
    pub source_srid: Srid,
    pub target_srid: Srid,
    pub cache: CacheKind,
    /// Replaces the replication url of the snapshot's header, if set.
    pub replication_url: Option<String>,
    /// Replaces the sequence number of the snapshot's header, if set.
    pub sequence_number: Option<i64>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            concurrency: available_parallelism(),
            batch_size: DEFAULT_BATCH_SIZE,
            source_srid: Srid::WGS84,
            target_srid: Srid::WEB_MERCATOR,
            cache: CacheKind::default(),
            replication_url: None,
            sequence_number: None,
        }
    }
}

impl ImportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return InvalidConfigSnafu {
                description: "concurrency must be at least 1",
            }
            .fail();
        }
        if self.batch_size == 0 {
            return InvalidConfigSnafu {
                description: "batch_size must be at least 1",
            }
            .fail();
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub source_srid: Srid,
    pub target_srid: Srid,
    pub cache: CacheKind,
    pub change_extension: String,
    pub state_extension: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            source_srid: Srid::WGS84,
            target_srid: Srid::WEB_MERCATOR,
            cache: CacheKind::default(),
            change_extension: "osc.gz".to_string(),
            state_extension: "state.txt".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_configs_use_defaults() {
        let config: ImportConfig =
            serde_json::from_str(r#"{"batch_size": 4, "cache": "temp_disk", "target_srid": 4326}"#)
                .expect("config");
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.cache, CacheKind::TempDisk);
        assert_eq!(config.target_srid, Srid::WGS84);
        assert_eq!(config.source_srid, Srid::WGS84);
        assert!(config.concurrency >= 1);
        assert!(config.validate().is_ok());

        let config: UpdateConfig = serde_json::from_str("{}").expect("config");
        assert_eq!(config, UpdateConfig::default());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = ImportConfig {
            batch_size: 0,
            ..ImportConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(crate::Error::InvalidConfig { .. })
        ));
    }
}
