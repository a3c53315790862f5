use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sofdec_usm::error::UsmError;
use sofdec_usm::is_usm;

/// Collect USM files from a path: a file is checked for the magic, a
/// folder is walked recursively.
pub(crate) fn find_usm_files(path: &Path) -> Result<Vec<PathBuf>, UsmError> {
    if path.is_file() {
        if !has_usm_magic(path)? {
            return Err(UsmError::InvalidMagic(format!(
                "{} is not a usm file",
                path.display()
            )));
        }
        return Ok(vec![path.to_path_buf()]);
    }

    let mut result = Vec::new();
    walk(path, &mut result)?;
    result.sort();
    Ok(result)
}

fn walk(dir: &Path, result: &mut Vec<PathBuf>) -> Result<(), UsmError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| UsmError::Io(format!("Couldn't read folder {}", dir.display()), e))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| UsmError::Io("Couldn't read folder entry".into(), e))?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, result)?;
        } else if has_usm_magic(&path).unwrap_or(false) {
            result.push(path);
        }
    }

    Ok(())
}

fn has_usm_magic(path: &Path) -> Result<bool, UsmError> {
    let mut file = File::open(path)
        .map_err(|e| UsmError::Io(format!("Couldn't open {}", path.display()), e))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(is_usm(&magic)),
        Err(_) => Ok(false),
    }
}
