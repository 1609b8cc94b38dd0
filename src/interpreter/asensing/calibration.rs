//! Asensing calibration files
//!
//! Calibration is a JSON object with up to eight keys:
//!
//! - `module_0` .. `module_3`: arrays of `[x, y, z, z']` rows, one array per laser
//!   pair. Rows come in windows of 200 and only every other window is used. Each
//!   used row yields eight correction vectors, two per module: `(x, y, z)` for the
//!   even laser and `(x, y, z')` for the odd one.
//! - `module_RT0` .. `module_RT3`: optional row-major 4x4 transforms applied to
//!   lasers 0-1, 2-3, 4-5 and 6-7 respectively.
//!
//! A file whose name contains `No-Correction` is not read at all: decoding then
//! relies on the angles reported in each packet.

use super::tables::{CorrectionTable, RtMatrix};
use crate::{CaptureError, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

const NO_CORRECTION_MARKER: &str = "No-Correction";
const ROW_WINDOW: usize = 200;
const MODULES: usize = 4;

#[derive(Debug, Default, Deserialize)]
struct CalibrationFile {
    module_0: Option<Vec<Vec<f64>>>,
    module_1: Option<Vec<Vec<f64>>>,
    module_2: Option<Vec<Vec<f64>>>,
    module_3: Option<Vec<Vec<f64>>>,
    #[serde(rename = "module_RT0")]
    module_rt0: Option<Vec<f64>>,
    #[serde(rename = "module_RT1")]
    module_rt1: Option<Vec<f64>>,
    #[serde(rename = "module_RT2")]
    module_rt2: Option<Vec<f64>>,
    #[serde(rename = "module_RT3")]
    module_rt3: Option<Vec<f64>>,
}

/// Parsed calibration, immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsensingCalibration {
    pub corrections: Option<CorrectionTable>,
    /// One transform per laser pair
    pub transforms: Option<[RtMatrix; MODULES]>,
}

impl AsensingCalibration {
    pub fn load(path: &Path) -> Result<Self> {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        if name.contains(NO_CORRECTION_MARKER) {
            info!(path = %path.display(), "Calibration without correction tables");
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(path).map_err(|e| {
            CaptureError::calibration(format!("cannot read calibration file {}: {}", path.display(), e))
        })?;
        let calibration = Self::from_json_str(&json)?;
        info!(
            path = %path.display(),
            corrections = calibration.corrections.as_ref().map_or(0, CorrectionTable::len),
            transforms = calibration.transforms.is_some(),
            "Loaded calibration"
        );
        Ok(calibration)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: CalibrationFile = serde_json::from_str(json)
            .map_err(|e| CaptureError::calibration(format!("invalid calibration JSON: {}", e)))?;

        let transforms = parse_transforms([&file.module_rt0, &file.module_rt1, &file.module_rt2, &file.module_rt3])?;
        let corrections = match &file.module_0 {
            None => {
                debug!("No module_0 in calibration, using packet angles");
                None
            }
            Some(_) => Some(parse_corrections([&file.module_0, &file.module_1, &file.module_2, &file.module_3])?),
        };
        Ok(Self { corrections, transforms })
    }

    /// Transform for `laser_id`, if transforms are configured.
    pub fn transform_for(&self, laser_id: usize) -> Option<&RtMatrix> {
        self.transforms.as_ref()?.get(laser_id / 2)
    }
}

fn parse_transforms(modules: [&Option<Vec<f64>>; MODULES]) -> Result<Option<[RtMatrix; MODULES]>> {
    let present = modules.iter().filter(|m| m.is_some()).count();
    if present == 0 {
        return Ok(None);
    }
    if present < MODULES {
        warn!(present, "Incomplete RT matrices in calibration, ignoring them");
        return Ok(None);
    }

    let mut transforms = [RtMatrix([[0.0; 4]; 4]); MODULES];
    for (i, values) in modules.iter().enumerate() {
        let values = values.as_deref().unwrap_or_default();
        let values: &[f64; 16] = values.get(..16).and_then(|v| v.try_into().ok()).ok_or_else(|| {
            CaptureError::calibration(format!("module_RT{} needs 16 values, found {}", i, values.len()))
        })?;
        transforms[i] = RtMatrix::from_row_major(values);
    }
    Ok(Some(transforms))
}

fn parse_corrections(modules: [&Option<Vec<Vec<f64>>>; MODULES]) -> Result<CorrectionTable> {
    let mut rows = Vec::with_capacity(MODULES);
    for (i, module) in modules.iter().enumerate() {
        let module = module
            .as_ref()
            .ok_or_else(|| CaptureError::calibration(format!("module_{} missing from calibration", i)))?;
        rows.push(module);
    }

    let len = rows.iter().map(|m| m.len()).min().unwrap_or(0);
    if rows.iter().any(|m| m.len() != len) {
        warn!(len, "Calibration modules differ in length, truncating to the shortest");
    }

    let mut vectors = Vec::with_capacity(len * 4);
    for index in (0..len).filter(|i| (i / ROW_WINDOW) % 2 == 0) {
        for (module, rows) in rows.iter().enumerate() {
            let row = &rows[index];
            let [x, y, z, z_odd] = row.get(..4).and_then(|r| <[f64; 4]>::try_from(r).ok()).ok_or_else(|| {
                CaptureError::calibration(format!(
                    "module_{} row {} needs 4 values, found {}",
                    module,
                    index,
                    row.len()
                ))
            })?;
            vectors.push([x, y, z]);
            vectors.push([x, y, z_odd]);
        }
    }
    Ok(CorrectionTable::new(vectors))
}
