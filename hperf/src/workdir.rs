use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::Error;

pub const FALLBACK_TMP_DIR: &str = "/tmp/hperf/";
pub const ANALYSIS_DIR: &str = "analysis_results";

/// Returns a usable temporary directory, falling back to
/// [`FALLBACK_TMP_DIR`] when `requested` cannot be created or written.
pub fn resolve_tmp_dir(requested: &Path) -> Result<PathBuf, Error> {
    if requested.exists() {
        if is_writable(requested) {
            debug!(dir = %requested.display(), "using existing temporary directory");
            return Ok(fs::canonicalize(requested)?);
        }
        warn!(dir = %requested.display(), "temporary directory is not writable");
    } else {
        match fs::create_dir_all(requested) {
            Ok(()) => {
                debug!(dir = %requested.display(), "created temporary directory");
                return Ok(fs::canonicalize(requested)?);
            }
            Err(err) => {
                warn!(dir = %requested.display(), %err, "failed to create temporary directory");
            }
        }
    }

    warn!("falling back to {FALLBACK_TMP_DIR}");
    fs::create_dir_all(FALLBACK_TMP_DIR)?;
    Ok(PathBuf::from(FALLBACK_TMP_DIR))
}

fn is_writable(dir: &Path) -> bool {
    let scratch = dir.join(format!(".hperf_scratch_{}", std::process::id()));
    match fs::File::create(&scratch) {
        Ok(_) => fs::remove_file(&scratch).is_ok(),
        Err(_) => false,
    }
}

/// Next free `<YYYYMMDD>_test<NNN>` name for `day` inside `tmp_dir`.
pub fn next_test_id(tmp_dir: &Path, day: NaiveDate) -> Result<String, Error> {
    let today = day.format("%Y%m%d").to_string();
    let pattern = Regex::new(&format!(r"^{today}_test(\d+)$"))
        .map_err(|err| Error::Configuration(err.to_string()))?;

    let mut max_id = 0u32;
    for entry in fs::read_dir(tmp_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(captures) = pattern.captures(&name) else {
            continue;
        };
        if let Ok(id) = captures[1].parse::<u32>() {
            max_id = max_id.max(id);
        }
    }

    Ok(format!("{today}_test{:03}", max_id + 1))
}

/// Creates a fresh test directory and returns its id and path.
pub fn create_test_dir(tmp_dir: &Path) -> Result<(String, PathBuf), Error> {
    let test_id = next_test_id(tmp_dir, chrono::Local::now().date_naive())?;
    let test_dir = tmp_dir.join(&test_id);
    fs::create_dir(&test_dir)?;
    Ok((test_id, test_dir))
}

pub fn analysis_dir(test_dir: &Path) -> Result<PathBuf, Error> {
    let dir = test_dir.join(ANALYSIS_DIR);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
