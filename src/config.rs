//! Configuration for indexes, coverage and clustering.
//!
//! This module provides serializable configuration that can be loaded from
//! JSON or TOML and validated before use.

use geoquad_types::bbox::BoundingBox;
use serde::de::Error;
use serde::{Deserialize, Serialize};

/// Longest geohash the coverage algorithm and point hashes will use.
pub const MAX_GEOHASH_LENGTH: usize = 12;

/// Index configuration.
///
/// # Example
///
/// ```rust
/// use geoquad::Config;
///
/// let config = Config::default();
/// assert_eq!(config.bucket_capacity, 10);
///
/// let json = r#"{
///     "bucket_capacity": 32,
///     "rebuild_threshold": 0.3
/// }"#;
/// let config = Config::from_json(json).unwrap();
/// assert_eq!(config.bucket_capacity, 32);
/// assert_eq!(config.max_depth, 24);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Maximum points a leaf holds before it subdivides
    #[serde(default = "Config::default_bucket_capacity")]
    pub bucket_capacity: usize,

    /// Deepest level a node may subdivide to. Leaves at this depth accept
    /// points past their capacity, which only happens for coincident points.
    #[serde(default = "Config::default_max_depth")]
    pub max_depth: usize,

    /// Fraction of the initially indexed points that may be deleted before a
    /// full rebuild is required
    #[serde(default = "Config::default_rebuild_threshold")]
    pub rebuild_threshold: f64,

    /// Upper bound on the number of geohash cells in a coverage set
    #[serde(default = "Config::default_max_coverage_cells")]
    pub max_coverage_cells: usize,

    /// Length of the geohash stored with every persisted index point (1-12)
    #[serde(default = "Config::default_geohash_precision")]
    pub geohash_precision: usize,

    /// Area covered by the root node
    #[serde(default = "BoundingBox::world")]
    pub world: BoundingBox,

    /// Viewport clustering settings
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Config {
    const fn default_bucket_capacity() -> usize {
        10
    }

    const fn default_max_depth() -> usize {
        24
    }

    const fn default_rebuild_threshold() -> f64 {
        0.20
    }

    const fn default_max_coverage_cells() -> usize {
        12
    }

    const fn default_geohash_precision() -> usize {
        MAX_GEOHASH_LENGTH
    }

    pub fn with_bucket_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "Bucket capacity must be greater than zero");
        self.bucket_capacity = capacity;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_rebuild_threshold(mut self, threshold: f64) -> Self {
        self.rebuild_threshold = threshold;
        self
    }

    pub fn with_max_coverage_cells(mut self, max_cells: usize) -> Self {
        assert!(max_cells > 0, "Coverage needs at least one cell");
        self.max_coverage_cells = max_cells;
        self
    }

    pub fn with_geohash_precision(mut self, precision: usize) -> Self {
        assert!(
            (1..=MAX_GEOHASH_LENGTH).contains(&precision),
            "Geohash precision must be between 1 and 12"
        );
        self.geohash_precision = precision;
        self
    }

    pub fn with_world(mut self, world: BoundingBox) -> Self {
        self.world = world;
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket_capacity == 0 {
            return Err("Bucket capacity must be greater than zero".to_string());
        }

        if !self.rebuild_threshold.is_finite() || self.rebuild_threshold < 0.0 {
            return Err("Rebuild threshold must be a finite, non-negative fraction".to_string());
        }

        if self.max_coverage_cells == 0 {
            return Err("Coverage needs at least one cell".to_string());
        }

        if !(1..=MAX_GEOHASH_LENGTH).contains(&self.geohash_precision) {
            return Err("Geohash precision must be between 1 and 12".to_string());
        }

        let w = &self.world;
        if ![w.x, w.y, w.width, w.height].iter().all(|v| v.is_finite())
            || w.width <= 0.0
            || w.height <= 0.0
        {
            return Err("World bounds must be finite with a positive area".to_string());
        }

        self.cluster.validate()
    }

    /// Load configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: Config = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load configuration from TOML string (requires toml feature)
    #[cfg(feature = "toml")]
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        let config: Config = toml::from_str(toml_str)?;
        if let Err(e) = config.validate() {
            return Err(toml::de::Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as TOML string (requires toml feature)
    #[cfg(feature = "toml")]
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_capacity: Self::default_bucket_capacity(),
            max_depth: Self::default_max_depth(),
            rebuild_threshold: Self::default_rebuild_threshold(),
            max_coverage_cells: Self::default_max_coverage_cells(),
            geohash_precision: Self::default_geohash_precision(),
            world: BoundingBox::world(),
            cluster: ClusterConfig::default(),
        }
    }
}

/// One step of the zoom-to-cell-size function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomStep {
    /// Lowest zoom level this step applies to
    pub min_zoom: u8,
    /// Grid cell edge length, in index coordinates
    pub cell_size: f64,
}

/// Viewport clustering settings.
///
/// The cell size is a step function of the zoom level: the step with the
/// largest `min_zoom` not above the requested zoom wins. Steps must shrink
/// as zoom grows so that zooming in never produces coarser clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "ClusterConfig::default_steps")]
    pub steps: Vec<ZoomStep>,

    /// Noun used in the title of multi-member clusters ("12 places")
    #[serde(default = "ClusterConfig::default_plural_noun")]
    pub plural_noun: String,

    /// Field read from the member record for single-member cluster titles
    #[serde(default = "ClusterConfig::default_title_field")]
    pub title_field: String,

    /// Field read from the member record for single-member cluster subtitles
    #[serde(default)]
    pub subtitle_field: Option<String>,
}

impl ClusterConfig {
    /// Screen cell sizes of 88/64/32/16 pixels on 256-pixel tiles,
    /// expressed in degrees of longitude at each zoom band.
    fn default_steps() -> Vec<ZoomStep> {
        let degrees = |pixels: f64, zoom: u8| pixels * 360.0 / (256.0 * f64::from(1u32 << zoom));
        let mut steps: Vec<ZoomStep> = (0..13)
            .map(|zoom| ZoomStep {
                min_zoom: zoom,
                cell_size: degrees(88.0, zoom),
            })
            .collect();
        steps.extend((13..16).map(|zoom| ZoomStep {
            min_zoom: zoom,
            cell_size: degrees(64.0, zoom),
        }));
        steps.extend((16..19).map(|zoom| ZoomStep {
            min_zoom: zoom,
            cell_size: degrees(32.0, zoom),
        }));
        steps.push(ZoomStep {
            min_zoom: 19,
            cell_size: degrees(16.0, 19),
        });
        steps
    }

    fn default_plural_noun() -> String {
        "items".to_string()
    }

    fn default_title_field() -> String {
        "name".to_string()
    }

    /// Build a clustering config from an explicit step table.
    pub fn with_steps(steps: Vec<ZoomStep>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    pub fn with_plural_noun(mut self, noun: impl Into<String>) -> Self {
        self.plural_noun = noun.into();
        self
    }

    pub fn with_title_field(mut self, field: impl Into<String>) -> Self {
        self.title_field = field.into();
        self
    }

    pub fn with_subtitle_field(mut self, field: impl Into<String>) -> Self {
        self.subtitle_field = Some(field.into());
        self
    }

    /// Grid cell size for a zoom level.
    ///
    /// Zoom levels below the first step use the first step's size.
    pub fn cell_size_for_zoom(&self, zoom: u8) -> f64 {
        self.steps
            .iter()
            .rev()
            .find(|step| step.min_zoom <= zoom)
            .or_else(|| self.steps.first())
            .map(|step| step.cell_size)
            .unwrap_or(1.0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("Cluster step table must not be empty".to_string());
        }

        for pair in self.steps.windows(2) {
            if pair[1].min_zoom <= pair[0].min_zoom {
                return Err("Cluster steps must be sorted by ascending zoom".to_string());
            }
            if pair[1].cell_size > pair[0].cell_size {
                return Err("Cluster cell sizes must not grow with zoom".to_string());
            }
        }

        if self
            .steps
            .iter()
            .any(|s| !s.cell_size.is_finite() || s.cell_size <= 0.0)
        {
            return Err("Cluster cell sizes must be finite and positive".to_string());
        }

        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            steps: Self::default_steps(),
            plural_noun: Self::default_plural_noun(),
            title_field: Self::default_title_field(),
            subtitle_field: None,
        }
    }
}
