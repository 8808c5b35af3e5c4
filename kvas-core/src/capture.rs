//! Naming rules for captured command output.
//!
//! When capture is on, a remote command's stdout and stderr are redirected
//! into two files on the machine, read back, and archived under
//! `task_id/instance/filename`.

use kvas_types::TaskId;

use crate::shell::quote;

/// Longest file stem derived from a command, in bytes.
pub const MAX_STEM_BYTES: usize = 180;

/// Hex digits of the command hash appended to truncated stems.
const HASH_SUFFIX_LEN: usize = 12;

/// Bytes of stderr kept in a command error.
pub const STDERR_EXCERPT_BYTES: usize = 2048;

/// Derive a file stem from a command line.
///
/// Removes `|`, `'`, `"` and `/` and turns spaces into `-`. A stem longer
/// than [`MAX_STEM_BYTES`] is cut on a char boundary and suffixed with a
/// hash of the full command, so long commands sharing a prefix still get
/// distinct files.
pub fn sanitize_command(command: &str) -> String {
    let stem: String = command
        .trim()
        .chars()
        .filter(|c| !matches!(c, '|' | '\'' | '"' | '/'))
        .map(|c| if c == ' ' { '-' } else { c })
        .collect();
    if stem.is_empty() {
        return "command".to_string();
    }
    if stem.len() <= MAX_STEM_BYTES {
        return stem;
    }

    let mut cut = MAX_STEM_BYTES - HASH_SUFFIX_LEN - 1;
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    let hash = blake3::hash(command.as_bytes()).to_hex();
    format!("{}-{}", &stem[..cut], &hash.as_str()[..HASH_SUFFIX_LEN])
}

/// Object key for an archived file.
pub fn blob_key(task_id: TaskId, instance: &str, file: &str) -> String {
    format!("{}/{}/{}", task_id, instance, file)
}

/// Last `max` bytes of `text`, starting on a char boundary.
pub fn stderr_excerpt(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// How one captured command is wrapped and where its output lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePlan {
    /// File receiving stdout, relative to the remote working directory.
    pub stdout_file: String,
    /// File receiving stderr.
    pub stderr_file: String,
    /// Command to execute in place of the original.
    pub wrapped: String,
}

impl CapturePlan {
    /// Plan the capture of `command`.
    pub fn new(command: &str) -> Self {
        let stem = sanitize_command(command);
        let stdout_file = format!("{}.out.txt", stem);
        let stderr_file = format!("{}.err.txt", stem);
        let wrapped = format!(
            "( {} ) > {} 2> {}",
            command,
            quote(&stdout_file),
            quote(&stderr_file)
        );
        Self {
            stdout_file,
            stderr_file,
            wrapped,
        }
    }

    /// Command that prints `file` back over the channel.
    pub fn read_back(file: &str) -> String {
        format!("cat -- {}", quote(file))
    }
}
