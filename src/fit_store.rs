//! Persistence of fitted models and their per-bin posteriors
//!
//! The artifact is split the usual way: human-readable JSON for the model
//! and the fit information, MessagePack for the compact per-bin arrays.
//! A stored fit is only reused when its identifier and chromosome sizes
//! match the requested configuration exactly.
//!

use camino::Utf8Path;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{OmnipeakError, OmnipeakResult};
use crate::hmm::{FitResult, HmmParameters, StateModel};

pub const MODEL_JSON_FILENAME: &str = "model.json";
pub const FIT_INFORMATION_JSON_FILENAME: &str = "fit.information.json";
pub const LOG_NULL_MESSAGEPACK_FILENAME: &str = "log.null.mpack";
pub const STATE_POSTERIORS_MESSAGEPACK_FILENAME: &str = "posteriors.mpack";

pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Identifiers longer than this are reduced to a hash
const MAX_IDENTIFIER_LENGTH: usize = 100;

/// Serialized model: an explicit schema with a top-level kind tag
///
#[derive(Deserialize, Serialize)]
pub struct ModelJson {
    pub format_version: u32,
    pub kind: String,
    pub parameters: HmmParameters,
    pub log_likelihood: f64,
    pub converged: bool,
}

/// The configuration a fit was produced under
///
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FitInformation {
    pub identifier: String,
    pub bin_size: u32,
    pub fragment: Option<u32>,
    pub unique: bool,
    pub control_regression: bool,
    pub treatment_paths: Vec<String>,
    pub control_paths: Vec<String>,
    pub chrom_sizes: Vec<(String, u64)>,
}

impl FitInformation {
    /// Describe the first field disagreeing with `other`, if any
    ///
    pub fn diff(&self, other: &FitInformation) -> Option<String> {
        if self.identifier != other.identifier {
            return Some(format!(
                "identifier: stored '{}', requested '{}'",
                self.identifier, other.identifier
            ));
        }
        if self.bin_size != other.bin_size {
            return Some(format!(
                "bin_size: stored {}, requested {}",
                self.bin_size, other.bin_size
            ));
        }
        if self.fragment != other.fragment {
            return Some(format!(
                "fragment: stored {:?}, requested {:?}",
                self.fragment, other.fragment
            ));
        }
        if self.unique != other.unique {
            return Some(format!(
                "unique: stored {}, requested {}",
                self.unique, other.unique
            ));
        }
        if self.control_regression != other.control_regression {
            return Some(format!(
                "control_regression: stored {}, requested {}",
                self.control_regression, other.control_regression
            ));
        }
        if self.chrom_sizes != other.chrom_sizes {
            return Some("chrom_sizes: stored sizes disagree with the request".to_string());
        }
        None
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Deterministic identifier reducing the fit configuration
///
/// Joins the input-file stems with the fragment, bin size and flag markers;
/// overlong identifiers collapse to a hash so they stay usable as keys.
///
pub fn fit_identifier(
    treatment_stems: &[&str],
    control_stems: &[&str],
    fragment: Option<u32>,
    bin_size: u32,
    unique: bool,
    control_regression: bool,
) -> String {
    let mut parts = Vec::new();
    parts.extend(treatment_stems.iter().map(|s| s.to_string()));
    parts.extend(control_stems.iter().map(|s| s.to_string()));
    if let Some(fragment) = fragment {
        parts.push(fragment.to_string());
    }
    parts.push(bin_size.to_string());
    if unique {
        parts.push("unique".to_string());
    }
    if !control_regression {
        parts.push("no-regress-control".to_string());
    }
    let id = parts.join("_");
    if id.len() <= MAX_IDENTIFIER_LENGTH {
        id
    } else {
        format!("{:016x}", fnv1a(id.as_bytes()))
    }
}

/// Write a file, cleaning up the partial result and retrying once on error
///
fn write_with_retry(path: &Utf8Path, bytes: &[u8]) -> OmnipeakResult<()> {
    match std::fs::write(path, bytes) {
        Ok(()) => Ok(()),
        Err(first) => {
            let _ = std::fs::remove_file(path);
            warn!("Retrying write of '{path}' after error: {first}");
            match std::fs::write(path, bytes) {
                Ok(()) => Ok(()),
                Err(second) => {
                    let _ = std::fs::remove_file(path);
                    Err(OmnipeakError::io(path.to_owned(), second))
                }
            }
        }
    }
}

/// Persist a fit and its information into `dir`
///
pub fn save_fit(
    dir: &Utf8Path,
    information: &FitInformation,
    result: &FitResult,
) -> OmnipeakResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| OmnipeakError::io(dir.to_owned(), e))?;

    let kind = match result.parameters.model {
        StateModel::Analyze => "analyze",
        StateModel::Compare { .. } => "compare",
    };
    let model = ModelJson {
        format_version: MODEL_FORMAT_VERSION,
        kind: kind.to_string(),
        parameters: result.parameters.clone(),
        log_likelihood: result.log_likelihood,
        converged: result.converged,
    };

    let model_path = dir.join(MODEL_JSON_FILENAME);
    info!("Writing model to file: '{model_path}'");
    let model_json = serde_json::to_vec_pretty(&model)
        .map_err(|e| OmnipeakError::Input(format!("can't serialize model: {e}")))?;
    write_with_retry(&model_path, &model_json)?;

    let info_path = dir.join(FIT_INFORMATION_JSON_FILENAME);
    let info_json = serde_json::to_vec_pretty(information)
        .map_err(|e| OmnipeakError::Input(format!("can't serialize fit information: {e}")))?;
    write_with_retry(&info_path, &info_json)?;

    let log_null_path = dir.join(LOG_NULL_MESSAGEPACK_FILENAME);
    info!("Writing log null posteriors to binary file: '{log_null_path}'");
    let mut buf = Vec::new();
    result
        .log_null
        .serialize(&mut rmp_serde::Serializer::new(&mut buf))
        .map_err(|e| OmnipeakError::Input(format!("can't serialize posteriors: {e}")))?;
    write_with_retry(&log_null_path, &buf)?;

    if let Some(state_posteriors) = result.state_posteriors.as_ref() {
        let posteriors_path = dir.join(STATE_POSTERIORS_MESSAGEPACK_FILENAME);
        let mut buf = Vec::new();
        state_posteriors
            .serialize(&mut rmp_serde::Serializer::new(&mut buf))
            .map_err(|e| {
                OmnipeakError::Input(format!("can't serialize state posteriors: {e}"))
            })?;
        write_with_retry(&posteriors_path, &buf)?;
    }
    Ok(())
}

fn read_file(path: &Utf8Path) -> OmnipeakResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| OmnipeakError::io(path.to_owned(), e))
}

/// Return true when a persisted fit exists in `dir`
///
pub fn fit_exists(dir: &Utf8Path) -> bool {
    dir.join(MODEL_JSON_FILENAME).is_file()
        && dir.join(FIT_INFORMATION_JSON_FILENAME).is_file()
        && dir.join(LOG_NULL_MESSAGEPACK_FILENAME).is_file()
}

/// Load a persisted fit, verifying it matches the requested configuration
///
pub fn load_fit(dir: &Utf8Path, expected: &FitInformation) -> OmnipeakResult<FitResult> {
    let info_path = dir.join(FIT_INFORMATION_JSON_FILENAME);
    let stored: FitInformation = serde_json::from_slice(&read_file(&info_path)?)
        .map_err(|e| {
            OmnipeakError::Input(format!("can't parse fit information '{info_path}': {e}"))
        })?;
    if let Some(diff) = stored.diff(expected) {
        return Err(OmnipeakError::ModelMismatch(diff));
    }

    let model_path = dir.join(MODEL_JSON_FILENAME);
    let model: ModelJson = serde_json::from_slice(&read_file(&model_path)?)
        .map_err(|e| OmnipeakError::Input(format!("can't parse model '{model_path}': {e}")))?;
    if model.format_version != MODEL_FORMAT_VERSION {
        return Err(OmnipeakError::ModelMismatch(format!(
            "format_version: stored {}, supported {}",
            model.format_version, MODEL_FORMAT_VERSION
        )));
    }

    let log_null_path = dir.join(LOG_NULL_MESSAGEPACK_FILENAME);
    let log_null: Vec<Vec<f32>> =
        rmp_serde::from_slice(&read_file(&log_null_path)?).map_err(|e| {
            OmnipeakError::Input(format!("can't parse posteriors '{log_null_path}': {e}"))
        })?;

    let posteriors_path = dir.join(STATE_POSTERIORS_MESSAGEPACK_FILENAME);
    let state_posteriors = if posteriors_path.is_file() {
        Some(rmp_serde::from_slice(&read_file(&posteriors_path)?).map_err(|e| {
            OmnipeakError::Input(format!(
                "can't parse state posteriors '{posteriors_path}': {e}"
            ))
        })?)
    } else {
        None
    };

    info!("Reusing persisted fit '{}' from '{dir}'", stored.identifier);
    Ok(FitResult {
        parameters: model.parameters,
        log_likelihood: model.log_likelihood,
        iterations: 0,
        converged: model.converged,
        log_null,
        state_posteriors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CancelToken;
    use crate::hmm::{fit_hmm, FitConfig};
    use camino::Utf8PathBuf;

    fn test_dir(name: &str) -> Utf8PathBuf {
        let dir = std::env::temp_dir().join("omnipeak_fit_store").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Utf8PathBuf::from_path_buf(dir).unwrap()
    }

    fn test_information() -> FitInformation {
        FitInformation {
            identifier: fit_identifier(&["t1"], &["c1"], Some(150), 100, true, true),
            bin_size: 100,
            fragment: Some(150),
            unique: true,
            control_regression: true,
            treatment_paths: vec!["/data/t1.bam".to_string()],
            control_paths: vec!["/data/c1.bam".to_string()],
            chrom_sizes: vec![("chr1".to_string(), 100_000)],
        }
    }

    fn small_fit() -> FitResult {
        let mut bins = vec![0u32; 100];
        bins.extend([1, 2, 1, 1, 2, 3].iter().cycle().take(200));
        bins.extend(std::iter::repeat(30).take(40));
        fit_hmm(
            StateModel::Analyze,
            &[vec![bins]],
            &FitConfig::default(),
            &CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_fit_identifier_deterministic() {
        let a = fit_identifier(&["t1", "t2"], &["c1"], Some(150), 200, true, false);
        let b = fit_identifier(&["t1", "t2"], &["c1"], Some(150), 200, true, false);
        assert_eq!(a, b);
        assert_eq!(a, "t1_t2_c1_150_200_unique_no-regress-control");

        let c = fit_identifier(&["t1"], &["c1"], None, 200, false, true);
        assert_eq!(c, "t1_c1_200");
        assert_ne!(a, c);
    }

    #[test]
    fn test_fit_identifier_overlong_reduces_to_hash() {
        let long_stem = "x".repeat(300);
        let id = fit_identifier(&[long_stem.as_str()], &[], None, 100, false, true);
        assert_eq!(id.len(), 16);
        let again = fit_identifier(&[long_stem.as_str()], &[], None, 100, false, true);
        assert_eq!(id, again);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = test_dir("round_trip");
        let information = test_information();
        let fit = small_fit();
        save_fit(&dir, &information, &fit).unwrap();
        assert!(fit_exists(&dir));

        let loaded = load_fit(&dir, &information).unwrap();
        assert_eq!(loaded.parameters, fit.parameters);
        assert_eq!(loaded.log_null, fit.log_null);
        assert_eq!(loaded.converged, fit.converged);
        assert_eq!(loaded.log_likelihood, fit.log_likelihood);
    }

    #[test]
    fn test_load_rejects_mismatched_configuration() {
        let dir = test_dir("mismatch");
        let information = test_information();
        save_fit(&dir, &information, &small_fit()).unwrap();

        let mut requested = information.clone();
        requested.bin_size = 200;
        requested.identifier =
            fit_identifier(&["t1"], &["c1"], Some(150), 200, true, true);
        match load_fit(&dir, &requested) {
            Err(OmnipeakError::ModelMismatch(diff)) => {
                assert!(diff.contains("identifier"), "diff: {diff}");
            }
            Err(other) => panic!("expected model mismatch, got {other}"),
            Ok(_) => panic!("expected model mismatch, got a loaded fit"),
        }
    }

    #[test]
    fn test_diff_names_first_field() {
        let information = test_information();
        let mut other = information.clone();
        other.unique = false;
        let diff = information.diff(&other).unwrap();
        assert!(diff.contains("unique"));
        assert!(information.diff(&information.clone()).is_none());
    }
}
