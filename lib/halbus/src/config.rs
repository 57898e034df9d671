//! Endpoint configuration: the on-disk config file names the schema and the
//! server port, and the schema's `definitions` block carries the module name
//! and version echoed in every envelope header.

use std::fs;
use std::time::Duration;

use serde_derive::Deserialize;
use serde_json::Value;

use crate::shared::{HalError, HalResult};

/// Idle pause between transport loop iterations.
const REQUEST_TIMEOUT_PERIOD: Duration = Duration::from_micros(2000);

#[derive(Deserialize)]
struct RawConfig {
    hal_schema_path: String,
    server_port: u16,
}

/// Immutable after init; shared by reference between the facade and the
/// transport thread.
#[derive(Clone, Debug)]
pub struct HalConfig {
    pub module_name: String,
    pub module_version: String,
    pub schema_path: String,
    pub port: u16,
    pub request_timeout: Duration,
}

impl HalConfig {
    pub fn load(conf_path: &str) -> HalResult<HalConfig> {
        let file = fs::File::open(conf_path)
            .map_err(|err| HalError::Config(format!("cannot open {}: {}", conf_path, err)))?;
        let raw: RawConfig = serde_json::from_reader(file)
            .map_err(|err| HalError::Config(format!("malformed configuration {}: {}", conf_path, err)))?;

        let (module_name, module_version) = read_schema_header(&raw.hal_schema_path)?;

        Ok(HalConfig {
            module_name,
            module_version,
            schema_path: raw.hal_schema_path,
            port: raw.server_port,
            request_timeout: REQUEST_TIMEOUT_PERIOD,
        })
    }
}

/// Reads `definitions.moduleName.const` and `definitions.schemaVersion.const`
/// from the schema file.
fn read_schema_header(schema_path: &str) -> HalResult<(String, String)> {
    let file = fs::File::open(schema_path)
        .map_err(|err| HalError::Config(format!("cannot open schema {}: {}", schema_path, err)))?;
    let schema: Value = serde_json::from_reader(file)
        .map_err(|err| HalError::Config(format!("malformed schema {}: {}", schema_path, err)))?;

    let definitions = schema
        .get("definitions")
        .ok_or_else(|| HalError::Config(format!("schema {} has no definitions block", schema_path)))?;

    let fetch = |key: &str| -> HalResult<String> {
        definitions
            .get(key)
            .and_then(|definition| definition.get("const"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| HalError::Config(format!("schema missing definitions.{}.const", key)))
    };

    Ok((fetch("moduleName")?, fetch("schemaVersion")?))
}
