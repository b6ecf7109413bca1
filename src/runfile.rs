use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::block::{CHANNEL_NAMES, NUM_CHANNELS};
use crate::config::ConfigOverrides;
use crate::utils::DynError;

#[derive(Debug, Clone, Default)]
pub struct RunFileData {
    pub overrides: ConfigOverrides,
    pub inputs: [Option<PathBuf>; NUM_CHANNELS],
    pub data_dir: Option<PathBuf>,
}

impl RunFileData {
    pub fn complete_inputs(&self) -> Option<Vec<PathBuf>> {
        self.inputs.iter().cloned().collect()
    }
}

fn parse_optional<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    keys: &[&str],
) -> Result<Option<T>, DynError>
where
    T::Err: std::fmt::Display,
{
    for key in keys {
        if let Some(value) = params.get(*key) {
            return Ok(Some(value.trim().parse::<T>().map_err(|e| {
                DynError::from(format!("run file key '{key}' = '{value}': {e}"))
            })?));
        }
    }
    Ok(None)
}

fn parse_optional_bool(
    params: &HashMap<String, String>,
    keys: &[&str],
) -> Result<Option<bool>, DynError> {
    for key in keys {
        if let Some(value) = params.get(*key) {
            return match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                other => Err(format!("run file key '{key}' expects a boolean, got '{other}'").into()),
            };
        }
    }
    Ok(None)
}

fn parse_kv_lines<R: BufRead>(reader: R) -> Result<HashMap<String, String>, DynError> {
    let mut params = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(index) = line.find('=') {
            let (key, value) = line.split_at(index);
            let key = key.trim().to_ascii_lowercase().replace('_', "");
            let value = value
                .trim_start_matches('=')
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string();
            params.insert(key, value);
        }
    }
    Ok(params)
}

fn build_run_file(params: &HashMap<String, String>, base_dir: &Path) -> Result<RunFileData, DynError> {
    let overrides = ConfigOverrides {
        sync_window_s: parse_optional(params, &["syncwindow", "syncdelta", "syncdeltas"])?,
        sync_max_steps: parse_optional(params, &["syncsteps", "syncmaxsteps"])?,
        sample_interval_s: parse_optional(params, &["sampleinterval", "fadcdelta", "fadcdeltas"])?,
        max_frequency_hz: parse_optional(params, &["fmax", "fmaxhz", "maxfrequency"])?,
        ncoherent: parse_optional(params, &["ncoherent"])?,
        current_threshold: parse_optional(params, &["currentthreshold"])?,
        quiescent_threshold: parse_optional(params, &["quiescentthreshold", "quiescentcurrentthreshold"])?,
        baseline_memory: parse_optional(params, &["baselinememory", "memory"])?,
        window_start_s: parse_optional(params, &["windowstart", "tstart"])?,
        window_end_s: parse_optional(params, &["windowend", "tend"])?,
        apply_sample_offsets: parse_optional_bool(params, &["sampleoffsets", "joffset"])?,
        drift_precision: parse_optional(params, &["driftprecision"])?,
    };

    let resolve = |raw: &str| {
        let p = PathBuf::from(raw);
        if p.is_relative() {
            base_dir.join(p)
        } else {
            p
        }
    };
    let mut inputs: [Option<PathBuf>; NUM_CHANNELS] = Default::default();
    for (slot, name) in inputs.iter_mut().zip(CHANNEL_NAMES.iter()) {
        *slot = params.get(*name).map(|v| resolve(v.as_str()));
    }
    Ok(RunFileData {
        overrides,
        inputs,
        data_dir: params.get("data").or_else(|| params.get("datadir")).map(|v| resolve(v.as_str())),
    })
}

pub fn parse_run_file(path: &Path) -> Result<RunFileData, DynError> {
    let file = File::open(path)
        .map_err(|e| format!("failed to open run file {}: {e}", path.display()))?;
    let params = parse_kv_lines(BufReader::new(file))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    build_run_file(&params, base_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &str = "\
# collimator run
; legacy comment
sync_delta = 0.5
fmax_hz = 250   # trailing comment
NCOHERENT = 4
joffset = yes
ixp = \"wedges/ixp.raw\"
oym = /abs/oym.raw
";

    #[test]
    fn parses_aliases_comments_and_paths() {
        let params = parse_kv_lines(Cursor::new(SAMPLE)).unwrap();
        let data = build_run_file(&params, Path::new("/runs/42")).unwrap();
        assert_eq!(data.overrides.sync_window_s, Some(0.5));
        assert_eq!(data.overrides.max_frequency_hz, Some(250.0));
        assert_eq!(data.overrides.ncoherent, Some(4));
        assert_eq!(data.overrides.apply_sample_offsets, Some(true));
        assert_eq!(data.overrides.current_threshold, None);
        assert_eq!(data.inputs[0], Some(PathBuf::from("/runs/42/wedges/ixp.raw")));
        assert_eq!(data.inputs[7], Some(PathBuf::from("/abs/oym.raw")));
        assert!(data.complete_inputs().is_none());
    }

    #[test]
    fn malformed_values_are_reported() {
        let params = parse_kv_lines(Cursor::new("ncoherent = many\n")).unwrap();
        let err = build_run_file(&params, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("ncoherent"));

        let params = parse_kv_lines(Cursor::new("sampleoffsets = maybe\n")).unwrap();
        assert!(build_run_file(&params, Path::new(".")).is_err());
    }
}
