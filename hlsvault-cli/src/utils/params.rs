use hlsvault_engine::VariantSelectionPolicy;
use tracing::{debug, error};

use crate::error::AppError;

/// Parses `key=value` strings into key-value pairs, splitting at the first
/// `=`.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` if a parameter has no `=` or an empty key.
pub fn parse_params(params: &[String]) -> Result<Vec<(String, String)>, AppError> {
    debug!("Parsing {} parameters", params.len());

    params
        .iter()
        .map(|param| {
            param
                .split_once('=')
                .filter(|(key, _)| !key.trim().is_empty())
                .map(|(key, value)| {
                    debug!("Added parameter: key='{key}'");
                    (key.trim().to_string(), value.trim().to_string())
                })
                .ok_or_else(|| {
                    error!("Invalid param format: {param}");
                    AppError::InvalidInput(format!("Invalid param format: {param}"))
                })
        })
        .collect()
}

/// Parses `highest`, `lowest`, `bandwidth:<bps>` or `resolution:<W>x<H>`.
pub fn parse_variant(value: &str) -> Result<VariantSelectionPolicy, String> {
    let value = value.trim().to_ascii_lowercase();
    match value.split_once(':') {
        None if value == "highest" => Ok(VariantSelectionPolicy::HighestBandwidth),
        None if value == "lowest" => Ok(VariantSelectionPolicy::LowestBandwidth),
        Some(("bandwidth", bps)) => bps
            .parse()
            .map(VariantSelectionPolicy::ClosestToBandwidth)
            .map_err(|_| format!("invalid bandwidth `{bps}`")),
        Some(("resolution", dims)) => {
            let (width, height) = dims
                .split_once('x')
                .ok_or_else(|| format!("invalid resolution `{dims}`, expected WxH"))?;
            let width = width
                .parse()
                .map_err(|_| format!("invalid width `{width}`"))?;
            let height = height
                .parse()
                .map_err(|_| format!("invalid height `{height}`"))?;
            Ok(VariantSelectionPolicy::MatchingResolution { width, height })
        }
        _ => Err(format!("unknown variant policy `{value}`")),
    }
}
