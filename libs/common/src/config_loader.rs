//! Configuration loading helper functions
//!
//! Layering order: file (by extension) < environment variables with the
//! service prefix. Nested keys use `__` in the variable name, e.g.
//! `POLLSRV_ENGINE__POOL_CAPACITY=8`.

use std::path::Path;

use errors::{GatewayError, GatewayResult};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

/// Build the figment for `path` without extracting it.
pub fn figment_for(path: &Path, env_prefix: &str) -> GatewayResult<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| GatewayError::InvalidConfig {
            field: "config_path".to_string(),
            reason: format!("{} has no file extension", path.display()),
        })?;

    let figment = match extension {
        "json" => Figment::new().merge(Json::file(path)),
        "toml" => Figment::new().merge(Toml::file(path)),
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        other => {
            return Err(GatewayError::InvalidConfig {
                field: "config_path".to_string(),
                reason: format!("Unsupported config format: {}", other),
            })
        },
    };

    debug!("Config layers: {} + env {}*", path.display(), env_prefix);
    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load and deserialize configuration from `path`, applying env overrides.
///
/// A missing file is not an error as long as the merged providers still
/// satisfy `T` (e.g. every field has a serde default).
pub fn load_config<T>(path: impl AsRef<Path>, env_prefix: &str) -> GatewayResult<T>
where
    T: DeserializeOwned,
{
    let path = path.as_ref();
    if !path.exists() {
        info!(
            "Config file {} not found, using defaults and environment",
            path.display()
        );
    }
    let config = figment_for(path, env_prefix)?.extract()?;
    info!("Configuration loaded from {}", path.display());
    Ok(config)
}
