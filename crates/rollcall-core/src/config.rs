//! Configuration types for rollcall harvests.
//!
//! Everything that used to be hardcoded per classroom (subjects, sheet names,
//! column letters, id ranges) lives in `harvest.toml`. Environment variables
//! can override the tuning knobs for a single run:
//!
//! - `ROLLCALL_CONCURRENCY` - parallel portal sessions
//! - `ROLLCALL_MAX_ATTEMPTS` - attempts per entity
//! - `ROLLCALL_ATTEMPT_TIMEOUT_SECS` - per-attempt timeout
//! - `ROLLCALL_COOLDOWN_SECS` - global cooldown once every credential is throttled
//! - `ROLLCALL_FLUSH_EVERY` - outcomes between incremental flushes

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::a1::{CellRange, CellRef, column_index};
use crate::error::AppError;
use crate::fetcher::FetchPolicy;
use crate::ids::{EntityId, IdConfig};
use crate::record::RecordProjection;
use crate::rotator::RotatorConfig;

// =============================================================================
// Destination Sheets
// =============================================================================

/// How harvested fields land in a sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SheetMode {
    /// Insert a fresh column every run, stamp it with the run time, and
    /// write one field into it. Keeps a history of past runs to the right.
    NewColumn {
        /// Column letters where the new column is inserted.
        insert_at: String,
        /// Row receiving the run timestamp.
        header_row: u32,
        /// Field written into the new column.
        field: String,
    },
    /// Overwrite fixed columns, one per field.
    Fixed {
        /// Field name -> column letters.
        columns: BTreeMap<String, String>,
    },
}

/// A destination sheet.
///
/// # Example
///
/// ```toml
/// [[sheets]]
/// name = "CN"
/// key_range = "A11:A200"
/// mode = "new_column"
/// insert_at = "C"
/// header_row = 10
/// field = "CN"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetConfig {
    /// Worksheet title.
    pub name: String,

    /// Single-column A1 range holding one entity id per row.
    pub key_range: String,

    #[serde(flatten)]
    pub mode: SheetMode,

    /// Ranges cleared before any result is written.
    #[serde(default)]
    pub clear: Vec<String>,
}

impl SheetConfig {
    /// Field -> 1-based column pairs this sheet receives.
    pub fn field_columns(&self) -> Result<Vec<(String, u32)>, AppError> {
        match &self.mode {
            SheetMode::NewColumn {
                insert_at, field, ..
            } => Ok(vec![(field.clone(), column_index(insert_at)?)]),
            SheetMode::Fixed { columns } => columns
                .iter()
                .map(|(field, letters)| Ok((field.clone(), column_index(letters)?)))
                .collect(),
        }
    }
}

/// Fields of one designated entity written down consecutive rows.
///
/// ```toml
/// [[reference_blocks]]
/// sheet = "Attendence CSE-B(2023-27)"
/// entity = "237Z1A0572"
/// anchor = "D8"
/// fields = ["DAA.held", "CN.held"]
/// missing = "0"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceBlockConfig {
    pub sheet: String,
    pub entity: EntityId,
    /// Top cell of the block.
    pub anchor: String,
    pub fields: Vec<String>,
    /// Written for fields the entity's record lacks. Such cells are skipped when unset.
    #[serde(default)]
    pub missing: Option<String>,
}

// =============================================================================
// Harvest Configuration (harvest.toml)
// =============================================================================

/// Root configuration structure for harvest.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Parallel portal sessions.
    pub concurrency: usize,
    /// Outcomes between incremental flushes; 0 flushes only at the end.
    pub flush_every: usize,
    /// Stop starting new fetches after this many seconds.
    pub run_timeout_secs: Option<u64>,
    /// Offset from UTC for the run timestamp, in minutes.
    pub utc_offset_minutes: i32,
    /// chrono format string for the run timestamp.
    pub timestamp_format: String,
    /// Opaque credential handles, in rotation order.
    pub credentials: Vec<String>,
    pub fetch: FetchPolicy,
    pub rotator: RotatorConfig,
    pub ids: IdConfig,
    pub projection: RecordProjection,
    pub sheets: Vec<SheetConfig>,
    pub reference_blocks: Vec<ReferenceBlockConfig>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            flush_every: 20,
            run_timeout_secs: None,
            // Asia/Kolkata
            utc_offset_minutes: 330,
            timestamp_format: "%Y-%m-%d %I:%M %p".to_string(),
            credentials: Vec::new(),
            fetch: FetchPolicy::default(),
            rotator: RotatorConfig::default(),
            ids: IdConfig::default(),
            projection: RecordProjection::default(),
            sheets: Vec::new(),
            reference_blocks: Vec::new(),
        }
    }
}

impl HarvestConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    fn utc_offset(&self) -> Option<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
    }

    /// Renders `now` in the configured offset and format.
    pub fn timestamp(&self, now: DateTime<Utc>) -> String {
        match self.utc_offset() {
            Some(offset) => now
                .with_timezone(&offset)
                .format(&self.timestamp_format)
                .to_string(),
            None => now.format(&self.timestamp_format).to_string(),
        }
    }

    /// Applies `ROLLCALL_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), AppError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a variable is set but not a number.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var::<usize>(&lookup, "ROLLCALL_CONCURRENCY")? {
            self.concurrency = v;
        }
        if let Some(v) = parse_var::<u32>(&lookup, "ROLLCALL_MAX_ATTEMPTS")? {
            self.fetch.max_attempts = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "ROLLCALL_ATTEMPT_TIMEOUT_SECS")? {
            self.fetch.attempt_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "ROLLCALL_COOLDOWN_SECS")? {
            self.rotator.cooldown = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "ROLLCALL_FLUSH_EVERY")? {
            self.flush_every = v;
        }
        Ok(())
    }

    /// Checks values that would only fail midway through a run.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.concurrency == 0 {
            return Err(AppError::ConfigError(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.fetch.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "fetch.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.credentials.is_empty() {
            return Err(AppError::ConfigError(
                "At least one credential is required".to_string(),
            ));
        }
        if self.utc_offset().is_none() {
            return Err(AppError::ConfigError(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            )));
        }
        if self.sheets.is_empty() {
            return Err(AppError::ConfigError(
                "At least one sheet is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for sheet in &self.sheets {
            if !names.insert(sheet.name.as_str()) {
                return Err(AppError::ConfigError(format!(
                    "Duplicate sheet name: '{}'",
                    sheet.name
                )));
            }
            validate_sheet(sheet)?;
        }

        for block in &self.reference_blocks {
            CellRef::from_str(&block.anchor).map_err(|e| in_sheet(&block.sheet, e))?;
            if block.fields.is_empty() {
                return Err(AppError::ConfigError(format!(
                    "Reference block at {}!{} lists no fields",
                    block.sheet, block.anchor
                )));
            }
        }

        Ok(())
    }
}

fn validate_sheet(sheet: &SheetConfig) -> Result<(), AppError> {
    let key_range = CellRange::from_str(&sheet.key_range).map_err(|e| in_sheet(&sheet.name, e))?;
    if !key_range.is_single_column() {
        return Err(AppError::ConfigError(format!(
            "Sheet '{}': key_range '{}' must span a single column",
            sheet.name, sheet.key_range
        )));
    }

    for range in &sheet.clear {
        CellRange::from_str(range).map_err(|e| in_sheet(&sheet.name, e))?;
    }

    match &sheet.mode {
        SheetMode::NewColumn { header_row, .. } if *header_row == 0 => {
            return Err(AppError::ConfigError(format!(
                "Sheet '{}': header_row must be at least 1",
                sheet.name
            )));
        }
        SheetMode::Fixed { columns } if columns.is_empty() => {
            return Err(AppError::ConfigError(format!(
                "Sheet '{}': fixed mode needs at least one column",
                sheet.name
            )));
        }
        _ => {}
    }
    sheet.field_columns().map_err(|e| in_sheet(&sheet.name, e))?;
    Ok(())
}

fn in_sheet(sheet: &str, err: AppError) -> AppError {
    AppError::ConfigError(format!("Sheet '{}': {}", sheet, err))
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!("{} must be a number, got '{}'", key, raw))
        }),
    }
}

// =============================================================================
// Serde helpers
// =============================================================================

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "harvest.toml";

/// Returns the default configuration directory path: `~/.config/rollcall/`
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("rollcall"))
}

/// Returns the default configuration file path.
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join(CONFIG_FILE_NAME))
}

/// Template written on first use of the default path.
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# rollcall harvest configuration
#
# Credentials are opaque handles passed to the sheet store, usually
# service-account key files. They are used in order; when one hits its quota
# the next one takes over.

concurrency = 10
flush_every = 20
# run_timeout_secs = 1800
utc_offset_minutes = 330

credentials = ["credentials1.json", "credentials2.json"]

[fetch]
max_attempts = 3
attempt_timeout_secs = 30
close_timeout_secs = 10
retry_delay_ms = 500

[rotator]
cooldown_secs = 60
max_cooldowns = 2

[ids]
prefix = "237Z1A05"
numeric_start = 72
numeric_end = 99
excluded = ["80", "88"]
letters = "ABCD"

[projection.aliases]
"CN" = "CN"
"DEVOPS" = "DEVOPS"
"MEN" = "MENTORING"
"LIB" = "LIBRARY"

# One column per run, newest first
[[sheets]]
name = "Overall %"
key_range = "A11:A200"
mode = "new_column"
insert_at = "C"
header_row = 10
field = "Overall %"

[[sheets]]
name = "CN"
key_range = "A11:A200"
mode = "new_column"
insert_at = "C"
header_row = 10
field = "CN"

# Attended counts overwritten in place
[[sheets]]
name = "Attendence CSE-B(2023-27)"
key_range = "B27:B91"
mode = "fixed"
clear = ["D8:D20", "H27:H91"]

[sheets.columns]
"CN.attended" = "H"

# Classes held, taken from one student
[[reference_blocks]]
sheet = "Attendence CSE-B(2023-27)"
entity = "237Z1A0572"
anchor = "D8"
fields = ["CN.held", "DEVOPS.held"]
missing = "0"
"#;

/// Load harvest configuration from a TOML file.
///
/// # Arguments
/// * `path` - Optional custom path. If `None`, uses default XDG path.
///
/// # Returns
/// * `Ok(Some(config))` - Configuration loaded successfully
/// * `Ok(None)` - No configuration directory could be determined or created
/// * `Err(e)` - Configuration file is missing at a custom path, or invalid
///
/// # Behavior
/// If no configuration file exists at the default path, a template file
/// is automatically created to help users get started.
pub fn load_harvest_config(path: Option<PathBuf>) -> Result<Option<HarvestConfig>, AppError> {
    let using_default_path = path.is_none();
    let config_path = match path {
        Some(p) => p,
        None => match default_config_path() {
            Some(p) => p,
            None => return Ok(None),
        },
    };

    if !config_path.exists() {
        if using_default_path {
            if let Err(e) = create_default_config(&config_path) {
                tracing::warn!("Could not create default config template: {}", e);
                return Ok(None);
            }
            tracing::info!(
                "Config file created at {}. Edit it before the first harvest.",
                config_path.display()
            );
        } else {
            return Err(AppError::ConfigError(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }
    }

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        AppError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    let config: HarvestConfig = toml::from_str(&content).map_err(|e| {
        AppError::ConfigError(format!(
            "Invalid TOML in '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    Ok(Some(config))
}

/// Create a default configuration file with a template.
///
/// Creates the parent directory if it doesn't exist.
fn create_default_config(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    tracing::info!("Created default config template at: {}", path.display());

    Ok(())
}
