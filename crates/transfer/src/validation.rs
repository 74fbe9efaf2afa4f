use crate::TransferError;

/// Splits a slash-delimited relative path into its folder segments.
///
/// The last segment (the file name) is excluded. Empty and `.` segments are
/// skipped. Rejects absolute paths and parent directory traversal (`..`).
///
/// `"a/b/c.txt"` yields `["a", "b"]`; `"c.txt"` yields `[]`.
pub fn folder_segments(relative_path: &str) -> Result<Vec<String>, TransferError> {
    let segments = normalized_segments(relative_path)?;
    Ok(match segments.split_last() {
        Some((_, dirs)) => dirs.iter().map(|s| s.to_string()).collect(),
        None => Vec::new(),
    })
}

/// Returns the file name of a slash-delimited relative path.
///
/// A trailing `/` names a folder, not a file, and is rejected.
pub fn leaf_name(relative_path: &str) -> Result<String, TransferError> {
    if relative_path.ends_with('/') {
        return Err(TransferError::InvalidPath(format!(
            "path names a folder, not a file: {relative_path}"
        )));
    }
    normalized_segments(relative_path)?
        .last()
        .map(|s| s.to_string())
        .ok_or_else(|| TransferError::InvalidPath("empty path".into()))
}

/// Rejects file names whose extension is in `blocked_extensions`
/// (case-insensitive, with or without leading dot).
pub fn check_file_name(name: &str, blocked_extensions: &[String]) -> Result<(), TransferError> {
    if name.is_empty() || name.chars().any(char::is_control) {
        return Err(TransferError::InvalidPath(format!("invalid file name: {name:?}")));
    }

    let Some((_, ext)) = name.rsplit_once('.') else {
        return Ok(());
    };
    let ext = ext.to_ascii_lowercase();

    let blocked = blocked_extensions
        .iter()
        .any(|b| b.trim_start_matches('.').eq_ignore_ascii_case(&ext));
    if blocked {
        return Err(TransferError::RestrictedType(format!(".{ext}")));
    }
    Ok(())
}

fn normalized_segments(relative_path: &str) -> Result<Vec<&str>, TransferError> {
    if relative_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }
    if relative_path.starts_with('/') || relative_path.starts_with('\\') {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {relative_path}"
        )));
    }

    let mut out = Vec::new();
    for segment in relative_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {relative_path}"
                )));
            }
            s => out.push(s),
        }
    }
    Ok(out)
}
