use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "attendance.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub max_connections: u32,
    /// Base URL used when handing out join links.
    pub public_url: String,
    pub data_dir: PathBuf,
    pub session_ttl_hours: i64,
    pub max_upload_bytes: usize,
    pub face: FaceConfig,
    pub attendance: AttendanceConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    pub tolerance: f64,
    pub encoding_len: usize,
    pub encoder_url: String,
    pub encoder_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendanceConfig {
    pub window_buffer_minutes: i64,
    pub default_geofence_radius_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub retention_days: i64,
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            database_url: "postgres://localhost/attendance".to_string(),
            max_connections: 10,
            public_url: "http://127.0.0.1:3000".to_string(),
            data_dir: PathBuf::from("data"),
            session_ttl_hours: 48,
            max_upload_bytes: 16 * 1024 * 1024,
            face: FaceConfig::default(),
            attendance: AttendanceConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.6,
            encoding_len: 128,
            encoder_url: "http://127.0.0.1:5001".to_string(),
            encoder_timeout_secs: 20,
        }
    }
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            window_buffer_minutes: 15,
            default_geofence_radius_m: 150.0,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            sweep_interval_secs: 3600,
        }
    }
}

impl Config {
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads").join("profiles")
    }

    pub fn encodings_dir(&self) -> PathBuf {
        self.data_dir.join("face_encodings")
    }
}

/// Reads the TOML file at `path` (or `ATTENDANCE_CONFIG`, or the default
/// location). A missing file yields the defaults. `DATABASE_URL` and
/// `BIND_ADDR` from the environment take precedence over the file.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => std::env::var("ATTENDANCE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
    };

    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        parse_config(&raw).with_context(|| format!("parsing config {}", path.display()))?
    } else {
        log::info!("No config at {}, using defaults", path.display());
        Config::default()
    };

    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.database_url = url;
    }
    if let Ok(addr) = std::env::var("BIND_ADDR") {
        config.bind_addr = addr;
    }
    Ok(config)
}

pub fn parse_config(raw: &str) -> Result<Config> {
    let config: Config = toml::from_str(raw)?;
    if config.face.tolerance <= 0.0 {
        anyhow::bail!("face.tolerance must be positive");
    }
    if config.face.encoding_len == 0 {
        anyhow::bail!("face.encoding_len must be non-zero");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = parse_config(
            r#"
            public_url = "https://attendance.example.edu"

            [face]
            tolerance = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.public_url, "https://attendance.example.edu");
        assert_eq!(config.face.tolerance, 0.5);
        assert_eq!(config.face.encoding_len, 128);
        assert_eq!(config.events.retention_days, 7);
        assert_eq!(config.attendance.window_buffer_minutes, 15);
    }

    #[test]
    fn example_file_matches_defaults() {
        let config = parse_config(include_str!("../attendance.example.toml")).unwrap();
        let defaults = Config::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.max_upload_bytes, defaults.max_upload_bytes);
        assert_eq!(config.face.encoder_url, defaults.face.encoder_url);
        assert_eq!(config.events.sweep_interval_secs, defaults.events.sweep_interval_secs);
    }

    #[test]
    fn rejects_non_positive_tolerance() {
        assert!(parse_config("[face]\ntolerance = 0.0").is_err());
    }

    #[test]
    fn data_paths_hang_off_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/srv/attendance"),
            ..Config::default()
        };
        assert_eq!(
            config.uploads_dir(),
            PathBuf::from("/srv/attendance/uploads/profiles")
        );
        assert_eq!(
            config.encodings_dir(),
            PathBuf::from("/srv/attendance/face_encodings")
        );
    }
}
