use super::models::{Config, StorageProvider};
use crate::geometry::proj::{CrsPipeline, WGS84};
use thiserror::Error;

/// Hard ceiling for `server.max_payload_bytes`
const MAX_PAYLOAD_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("max_payload_bytes ({actual}) must be between 1 and {limit}")]
    PayloadLimitOutOfRange { actual: u64, limit: u64 },

    #[error("Storage provider is S3 but missing credentials (access_key or secret_key)")]
    MissingS3Credentials,

    #[error("Storage prefix '{field}' must be a non-empty relative path, got '{value}'")]
    InvalidPrefix { field: &'static str, value: String },

    #[error("Unsupported planner target CRS '{0}'")]
    UnsupportedTargetCrs(String),

    #[error("Invalid planner settings: {0}")]
    InvalidPlanner(String),

    #[error("'{field}' must be an http(s) URL, got '{value}'")]
    InvalidUrl { field: &'static str, value: String },

    #[error("At least one batch output layer is required")]
    NoOutputLayers,

    #[error("batch.time_margin_secs must not be negative: {0}")]
    NegativeTimeMargin(i64),

    #[error("{field} must be positive")]
    NotPositive { field: &'static str },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_server(config)?;
    validate_storage(config)?;
    validate_planner(config)?;
    validate_batch(config)?;
    validate_catalog(config)?;
    validate_notification(config)?;
    Ok(())
}

fn validate_server(config: &Config) -> Result<(), ValidationError> {
    let actual = config.server.max_payload_bytes.as_u64();
    if actual == 0 || actual > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::PayloadLimitOutOfRange {
            actual,
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

fn validate_storage(config: &Config) -> Result<(), ValidationError> {
    let storage = &config.storage;
    if storage.provider == StorageProvider::S3
        && (storage.access_key.is_none() || storage.secret_key.is_none())
    {
        return Err(ValidationError::MissingS3Credentials);
    }

    for (field, value) in [
        ("package_prefix", &storage.package_prefix),
        ("artifact_prefix", &storage.artifact_prefix),
    ] {
        if value.trim().is_empty() || value.starts_with('/') {
            return Err(ValidationError::InvalidPrefix {
                field,
                value: value.clone(),
            });
        }
    }
    Ok(())
}

fn validate_planner(config: &Config) -> Result<(), ValidationError> {
    let planner = &config.planner;
    CrsPipeline::new(WGS84, &planner.target_crs)
        .map_err(|_| ValidationError::UnsupportedTargetCrs(planner.target_crs.clone()))?;

    if planner.max_iterations == 0 {
        return Err(ValidationError::NotPositive {
            field: "planner.max_iterations",
        });
    }
    planner
        .constraints(None)
        .validate()
        .map_err(|e| ValidationError::InvalidPlanner(e.to_string()))
}

fn validate_batch(config: &Config) -> Result<(), ValidationError> {
    let batch = &config.batch;
    if !batch.mock {
        validate_url("batch.endpoint", &batch.endpoint)?;
    }
    if batch.output_layers.is_empty() {
        return Err(ValidationError::NoOutputLayers);
    }
    if batch.time_margin_secs < 0 {
        return Err(ValidationError::NegativeTimeMargin(batch.time_margin_secs));
    }
    if batch.max_attempts == 0 {
        return Err(ValidationError::NotPositive {
            field: "batch.max_attempts",
        });
    }
    Ok(())
}

fn validate_catalog(config: &Config) -> Result<(), ValidationError> {
    let catalog = &config.catalog;
    validate_url("catalog.url", &catalog.url)?;
    if catalog.page_size == 0 {
        return Err(ValidationError::NotPositive {
            field: "catalog.page_size",
        });
    }
    if catalog.max_pages == 0 {
        return Err(ValidationError::NotPositive {
            field: "catalog.max_pages",
        });
    }
    Ok(())
}

fn validate_notification(config: &Config) -> Result<(), ValidationError> {
    match &config.notification.url {
        Some(url) => validate_url("notification.url", url),
        None => Ok(()),
    }
}

fn validate_url(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let ok = ["http://", "https://"]
        .iter()
        .any(|scheme| value.starts_with(scheme) && value.len() > scheme.len());
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidUrl {
            field,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::ByteSize;

    #[test]
    fn test_valid_config() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_payload_limit() {
        let mut config = Config::default();
        config.server.max_payload_bytes = ByteSize(32 * 1024 * 1024);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::PayloadLimitOutOfRange { .. })
        ));

        config.server.max_payload_bytes = ByteSize(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_s3_credentials_missing() {
        let mut config = Config::default();
        config.storage.provider = StorageProvider::S3;
        config.storage.secret_key = Some("secret".into());

        assert!(matches!(
            validate(&config),
            Err(ValidationError::MissingS3Credentials)
        ));

        config.storage.access_key = Some("key".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_absolute_prefix_rejected() {
        let mut config = Config::default();
        config.storage.artifact_prefix = "/artifacts".into();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidPrefix {
                field: "artifact_prefix",
                ..
            })
        ));
    }

    #[test]
    fn test_planner_settings() {
        let mut config = Config::default();
        config.planner.target_crs = "EPSG:2056".into();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::UnsupportedTargetCrs(_))
        ));

        let mut config = Config::default();
        config.planner.resolution_meters = 0.0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidPlanner(_))
        ));

        let mut config = Config::default();
        config.planner.max_iterations = 0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::NotPositive { .. })
        ));
    }

    #[test]
    fn test_batch_settings() {
        let mut config = Config::default();
        config.batch.endpoint = "ftp://batch".into();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidUrl { field: "batch.endpoint", .. })
        ));
        config.batch.mock = true;
        assert!(validate(&config).is_ok());

        config.batch.output_layers.clear();
        assert!(matches!(validate(&config), Err(ValidationError::NoOutputLayers)));

        let mut config = Config::default();
        config.batch.time_margin_secs = -1;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::NegativeTimeMargin(-1))
        ));
    }

    #[test]
    fn test_notification_url() {
        let mut config = Config::default();
        config.notification.url = Some("not a url".into());
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidUrl { field: "notification.url", .. })
        ));
    }
}
