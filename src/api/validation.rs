use thiserror::Error;

use crate::pipeline::DownloadRequest;
use crate::planner::AoiSource;

const MAX_DATASET_ID_LEN: usize = 128;
const MAX_REGION_CODE_LEN: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum RequestValidationError {
    #[error("dataset_id must be between 1 and 128 characters")]
    InvalidDatasetId,
    #[error("region code must be between 1 and 64 characters")]
    InvalidRegionCode,
    #[error("resolution must be a positive number, got {0}")]
    InvalidResolution(f64),
    #[error("target_crs must look like 'EPSG:<code>', got '{0}'")]
    InvalidTargetCrs(String),
}

/// Shape checks that need no collaborators. Semantic checks (time range
/// order, region lookup, CRS support) happen in the pipeline.
pub fn validate_request(request: &DownloadRequest) -> Result<(), RequestValidationError> {
    let dataset = request.dataset_id.trim();
    if dataset.is_empty() || dataset.len() > MAX_DATASET_ID_LEN {
        return Err(RequestValidationError::InvalidDatasetId);
    }

    if let AoiSource::Region(code) = &request.aoi {
        let code = code.trim();
        if code.is_empty() || code.len() > MAX_REGION_CODE_LEN {
            return Err(RequestValidationError::InvalidRegionCode);
        }
    }

    if let Some(resolution) = request.resolution {
        if !resolution.is_finite() || resolution <= 0.0 {
            return Err(RequestValidationError::InvalidResolution(resolution));
        }
    }

    if let Some(crs) = &request.target_crs {
        let valid = crs
            .strip_prefix("EPSG:")
            .is_some_and(|code| !code.is_empty() && code.chars().all(|c| c.is_ascii_digit()));
        if !valid {
            return Err(RequestValidationError::InvalidTargetCrs(crs.clone()));
        }
    }

    Ok(())
}
