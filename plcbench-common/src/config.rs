//! Configuration for plcbench
//!
//! Endpoint settings for the three protocol paths plus the scenario matrix. Settings
//! come from a TOML file, defaults, and environment overrides; validation only checks
//! that required fields are present and scenario parameters are usable.

use crate::error::{BenchError, Result};
use crate::types::{VariableKind, LTIME_WIDTH_BYTES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Communication path to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    WebApi,
    OpcUa,
    S7,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::WebApi, Protocol::OpcUa, Protocol::S7];

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::WebApi => "web_api",
            Protocol::OpcUa => "opc_ua",
            Protocol::S7 => "s7",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "web_api" | "webapi" | "rest" => Ok(Protocol::WebApi),
            "opc_ua" | "opcua" => Ok(Protocol::OpcUa),
            "s7" => Ok(Protocol::S7),
            other => Err(BenchError::config(format!("unknown protocol '{}'", other))),
        }
    }
}

/// Web API (JSON-RPC over HTTPS) endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebApiConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout_ms: u64,
    /// Bulk writes carry a larger body and get their own timeout
    pub bulk_timeout_ms: u64,
    /// Accept self-signed controller certificates
    pub skip_certificate_validation: bool,
}

impl Default for WebApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://192.168.10.61"),
            username: String::new(),
            password: String::new(),
            timeout_ms: 10_000,
            bulk_timeout_ms: 30_000,
            skip_certificate_validation: true,
        }
    }
}

impl WebApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }
}

/// OPC UA endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcUaConfig {
    pub endpoint_url: String,
    /// Namespace of the controller's data block nodes
    pub namespace_index: u16,
    pub timeout_ms: u64,
    /// Requested session lifetime
    pub session_timeout_ms: u64,
    /// User token policy announced by the server for anonymous logins
    pub anonymous_policy_id: String,
    /// Declared variable types that override the scenario matrix
    pub variable_types: BTreeMap<String, VariableKind>,
}

impl Default for OpcUaConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::from("opc.tcp://192.168.10.61:4840"),
            namespace_index: 3,
            timeout_ms: 5_000,
            session_timeout_ms: 60_000,
            anonymous_policy_id: String::from("Anonymous"),
            variable_types: BTreeMap::new(),
        }
    }
}

impl OpcUaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// S7 (ISO-on-TCP) endpoint and data block layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S7Config {
    pub address: String,
    pub port: u16,
    pub rack: u16,
    pub slot: u16,
    pub db_number: u16,
    pub bool_offset: u32,
    pub bool_bit: u8,
    pub int16_offset: u32,
    pub int32_offset: u32,
    pub bulk_offset: u32,
    pub bulk_element_size: usize,
    pub timeout_ms: u64,
}

impl Default for S7Config {
    fn default() -> Self {
        Self {
            address: String::from("192.168.106.62"),
            port: 102,
            rack: 0,
            slot: 1,
            db_number: 7,
            bool_offset: 0,
            bool_bit: 0,
            int16_offset: 2,
            int32_offset: 4,
            bulk_offset: 136,
            bulk_element_size: 8,
            timeout_ms: 5_000,
        }
    }
}

impl S7Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A controller variable exercised by single-variable scenarios
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub kind: VariableKind,
}

impl VariableSpec {
    pub fn new(name: impl Into<String>, kind: VariableKind) -> Self {
        Self { name: name.into(), kind }
    }
}

/// Workload matrix: which protocols, variables, rates and sizes to run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioMatrix {
    pub protocols: Vec<Protocol>,
    pub variables: Vec<VariableSpec>,
    /// Target rates in operations per second
    pub rates: Vec<f64>,
    /// Fixed number of operations per run; takes precedence over `duration_secs`
    pub operation_count: Option<usize>,
    pub duration_secs: Option<f64>,
    /// Also run paced reads of each variable
    pub include_reads: bool,
    pub bulk_enabled: bool,
    /// Array variable receiving the bulk block
    pub bulk_variable: String,
    pub bulk_repetitions: usize,
    /// Unpaced cycles that write every variable and read each one back
    pub mixed_enabled: bool,
    pub mixed_repetitions: usize,
}

impl Default for ScenarioMatrix {
    fn default() -> Self {
        Self {
            protocols: Protocol::ALL.to_vec(),
            variables: vec![
                VariableSpec::new("\"PerformaceData\".ToServer.bool00", VariableKind::Bool),
                VariableSpec::new("\"PerformaceData\".ToServer.int16_01", VariableKind::Int16),
                VariableSpec::new("\"PerformaceData\".ToServer.int32_01", VariableKind::Int32),
            ],
            rates: vec![1.0, 5.0, 10.0],
            operation_count: None,
            duration_secs: Some(10.0),
            include_reads: false,
            bulk_enabled: true,
            bulk_variable: String::from("\"PerformaceData\".PlcData.BulkData"),
            bulk_repetitions: 10,
            mixed_enabled: false,
            mixed_repetitions: 100,
        }
    }
}

/// Complete benchmark settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchSettings {
    pub webapi: WebApiConfig,
    pub opcua: OpcUaConfig,
    pub s7: S7Config,
    pub scenarios: ScenarioMatrix,
    pub output_dir: PathBuf,
    /// Pause between scenario runs on the same adapter
    pub cooldown_ms: u64,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            webapi: WebApiConfig::default(),
            opcua: OpcUaConfig::default(),
            s7: S7Config::default(),
            scenarios: ScenarioMatrix::default(),
            output_dir: PathBuf::from("./results"),
            cooldown_ms: 1_000,
        }
    }
}

impl BenchSettings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(settings)
    }

    /// Save settings to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn is_enabled(&self, protocol: Protocol) -> bool {
        self.scenarios.protocols.contains(&protocol)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("PLCBENCH_WEBAPI_URL") {
            self.webapi.base_url = url;
        }
        if let Some(user) = lookup("PLCBENCH_WEBAPI_USER") {
            self.webapi.username = user;
        }
        if let Some(password) = lookup("PLCBENCH_WEBAPI_PASSWORD") {
            self.webapi.password = password;
        }
        if let Some(skip) = lookup("PLCBENCH_WEBAPI_INSECURE") {
            self.webapi.skip_certificate_validation = parse_env("PLCBENCH_WEBAPI_INSECURE", &skip)?;
        }
        if let Some(url) = lookup("PLCBENCH_OPCUA_URL") {
            self.opcua.endpoint_url = url;
        }
        if let Some(ip) = lookup("PLCBENCH_S7_ADDRESS").or_else(|| lookup("IP")) {
            self.s7.address = ip;
        }
        if let Some(rack) = lookup("S7_RACK") {
            self.s7.rack = parse_env("S7_RACK", &rack)?;
        }
        if let Some(slot) = lookup("S7_SLOT") {
            self.s7.slot = parse_env("S7_SLOT", &slot)?;
        }
        if let Some(db) = lookup("S7_DB_NUMBER") {
            self.s7.db_number = parse_env("S7_DB_NUMBER", &db)?;
        }
        if let Some(offset) = lookup("S7_BOOL_OFFSET") {
            self.s7.bool_offset = parse_env("S7_BOOL_OFFSET", &offset)?;
        }
        if let Some(offset) = lookup("S7_BULK_OFFSET") {
            self.s7.bulk_offset = parse_env("S7_BULK_OFFSET", &offset)?;
        }
        if let Some(size) = lookup("S7_BULK_ELEMENT_SIZE") {
            self.s7.bulk_element_size = parse_env("S7_BULK_ELEMENT_SIZE", &size)?;
        }
        if let Some(dir) = lookup("PLCBENCH_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Check required fields and scenario parameters before any run starts
    pub fn validate(&self) -> Result<()> {
        let matrix = &self.scenarios;
        if matrix.protocols.is_empty() {
            return Err(BenchError::config("no protocols enabled"));
        }
        if self.is_enabled(Protocol::WebApi) {
            require("webapi.base_url", &self.webapi.base_url)?;
            require("webapi.username", &self.webapi.username)?;
            require("webapi.password", &self.webapi.password)?;
        }
        if self.is_enabled(Protocol::OpcUa) {
            require("opcua.endpoint_url", &self.opcua.endpoint_url)?;
            if !self.opcua.endpoint_url.starts_with("opc.tcp://") {
                return Err(BenchError::config(format!(
                    "opcua.endpoint_url must use opc.tcp://, got '{}'",
                    self.opcua.endpoint_url
                )));
            }
        }
        if self.is_enabled(Protocol::S7) {
            require("s7.address", &self.s7.address)?;
            if self.s7.bool_bit > 7 {
                return Err(BenchError::config("s7.bool_bit must be within 0..=7"));
            }
            if self.s7.bulk_element_size < LTIME_WIDTH_BYTES {
                return Err(BenchError::config(format!(
                    "s7.bulk_element_size must be at least {} bytes",
                    LTIME_WIDTH_BYTES
                )));
            }
        }

        if !matrix.variables.is_empty() {
            if matrix.rates.is_empty() {
                return Err(BenchError::config("scenarios.rates is empty"));
            }
            if let Some(rate) = matrix.rates.iter().find(|r| !(r.is_finite() && **r > 0.0)) {
                return Err(BenchError::config(format!("invalid target rate {}", rate)));
            }
            match (matrix.operation_count, matrix.duration_secs) {
                (None, None) => {
                    return Err(BenchError::config(
                        "either scenarios.operation_count or scenarios.duration_secs is required",
                    ))
                }
                (Some(0), _) => return Err(BenchError::config("scenarios.operation_count must be positive")),
                (None, Some(d)) if Duration::try_from_secs_f64(d).map_or(true, |d| d.is_zero()) => {
                    return Err(BenchError::config(format!("invalid scenario duration {}", d)))
                }
                _ => {}
            }
            for variable in &matrix.variables {
                require("scenarios.variables.name", &variable.name)?;
                if variable.kind.is_bulk() {
                    return Err(BenchError::config(format!(
                        "variable '{}' is a bulk block; use scenarios.bulk_variable",
                        variable.name
                    )));
                }
            }
        }
        if matrix.bulk_enabled {
            require("scenarios.bulk_variable", &matrix.bulk_variable)?;
            if matrix.bulk_repetitions == 0 {
                return Err(BenchError::config("scenarios.bulk_repetitions must be positive"));
            }
        }
        if matrix.mixed_enabled {
            if matrix.variables.is_empty() {
                return Err(BenchError::config("mixed cycles need at least one variable"));
            }
            if matrix.mixed_repetitions == 0 {
                return Err(BenchError::config("scenarios.mixed_repetitions must be positive"));
            }
        }
        if matrix.variables.is_empty() && !matrix.bulk_enabled {
            return Err(BenchError::config("scenario matrix is empty"));
        }
        Ok(())
    }

    /// Declared type of every variable the scenarios touch
    pub fn declared_types(&self) -> BTreeMap<String, VariableKind> {
        let mut types: BTreeMap<String, VariableKind> = self
            .scenarios
            .variables
            .iter()
            .map(|v| (v.name.clone(), v.kind))
            .collect();
        types.insert(self.scenarios.bulk_variable.clone(), VariableKind::BulkBlock);
        types.extend(self.opcua.variable_types.clone());
        types
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(BenchError::config(format!("required field '{}' is missing", field)))
    } else {
        Ok(())
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| BenchError::config(format!("invalid value '{}' for {}: {}", raw, key, e)))
}

/// Configuration source for loading benchmark settings
pub enum ConfigSource {
    File(PathBuf),
    Default,
    Environment,
}

/// Load settings from the given source
pub fn load_config(source: ConfigSource) -> Result<BenchSettings> {
    match source {
        ConfigSource::File(path) => BenchSettings::from_file(&path),
        ConfigSource::Default => Ok(BenchSettings::default()),
        ConfigSource::Environment => {
            let mut settings = BenchSettings::default();
            settings.apply_env_overrides()?;
            Ok(settings)
        }
    }
}

/// Template written by `plcbench config generate`
pub fn generate_default_config() -> BenchSettings {
    let mut settings = BenchSettings::default();
    settings.webapi.username = String::from("user");
    settings.webapi.password = String::from("change-me");
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn valid_settings() -> BenchSettings {
        generate_default_config()
    }

    #[test]
    fn test_default_settings_validate_once_credentials_present() {
        assert!(BenchSettings::default().validate().is_err());
        valid_settings().validate().unwrap();
    }

    #[test]
    fn test_missing_webapi_credentials_only_matter_when_enabled() {
        let mut settings = BenchSettings::default();
        settings.scenarios.protocols = vec![Protocol::S7, Protocol::OpcUa];
        settings.validate().unwrap();
    }

    #[test]
    fn test_invalid_scenarios_rejected() {
        let mut settings = valid_settings();
        settings.scenarios.rates = vec![10.0, 0.0];
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));

        let mut settings = valid_settings();
        settings.scenarios.operation_count = None;
        settings.scenarios.duration_secs = None;
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.scenarios.bulk_repetitions = 0;
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.opcua.endpoint_url = String::from("http://plc:4840");
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.scenarios.mixed_enabled = true;
        settings.scenarios.mixed_repetitions = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unrepresentable_durations_rejected() {
        for secs in [f64::MAX, 1e30, f64::INFINITY, f64::NAN, -1.0, 0.0] {
            let mut settings = valid_settings();
            settings.scenarios.operation_count = None;
            settings.scenarios.duration_secs = Some(secs);
            let err = settings.validate().unwrap_err();
            assert!(matches!(err, BenchError::Config(_)), "duration {} accepted", secs);
        }

        let mut settings = valid_settings();
        settings.scenarios.operation_count = None;
        settings.scenarios.duration_secs = Some(0.25);
        settings.validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("IP", "10.0.0.5"),
            ("S7_RACK", "1"),
            ("S7_SLOT", "2"),
            ("S7_DB_NUMBER", "42"),
            ("PLCBENCH_WEBAPI_USER", "operator"),
        ]
        .into_iter()
        .collect();

        let mut settings = BenchSettings::default();
        settings
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.s7.address, "10.0.0.5");
        assert_eq!(settings.s7.rack, 1);
        assert_eq!(settings.s7.slot, 2);
        assert_eq!(settings.s7.db_number, 42);
        assert_eq!(settings.webapi.username, "operator");
    }

    #[test]
    fn test_invalid_override_is_config_error() {
        let mut settings = BenchSettings::default();
        let err = settings
            .apply_overrides(|key| (key == "S7_SLOT").then(|| String::from("one")))
            .unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plcbench.toml");

        let settings = valid_settings();
        settings.to_file(&path).unwrap();

        let loaded = BenchSettings::from_file(&path).unwrap();
        assert_eq!(loaded.s7.db_number, settings.s7.db_number);
        assert_eq!(loaded.scenarios.variables, settings.scenarios.variables);
        assert_eq!(loaded.scenarios.protocols, settings.scenarios.protocols);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: BenchSettings = toml::from_str(
            r#"
            [s7]
            address = "plc.local"

            [scenarios]
            rates = [20.0]
            operation_count = 200
            "#,
        )
        .unwrap();
        assert_eq!(settings.s7.address, "plc.local");
        assert_eq!(settings.s7.port, 102);
        assert_eq!(settings.scenarios.rates, vec![20.0]);
        assert_eq!(settings.scenarios.operation_count, Some(200));
        assert_eq!(settings.scenarios.variables.len(), 3);
    }

    #[test]
    fn test_declared_types_include_bulk_and_overrides() {
        let mut settings = valid_settings();
        settings
            .opcua
            .variable_types
            .insert(String::from("\"Motor\".speed"), VariableKind::Int32);
        let types = settings.declared_types();
        assert_eq!(types.get("\"PerformaceData\".ToServer.bool00"), Some(&VariableKind::Bool));
        assert_eq!(types.get("\"PerformaceData\".PlcData.BulkData"), Some(&VariableKind::BulkBlock));
        assert_eq!(types.get("\"Motor\".speed"), Some(&VariableKind::Int32));
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!("opcua".parse::<Protocol>().unwrap(), Protocol::OpcUa);
        assert_eq!("web-api".parse::<Protocol>().unwrap(), Protocol::WebApi);
        assert_eq!(Protocol::S7.to_string(), "s7");
        assert!("modbus".parse::<Protocol>().is_err());
    }
}
