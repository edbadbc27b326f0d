//! Moving bytes across a text-only executor
//!
//! Executors carry UTF-8 text, so binary content (etcd snapshots, generated
//! manifests) crosses as single-line standard base64. The alphabet has no
//! quote characters, which makes `'<b64>'` safe to embed in shell commands.

use base64::{engine::general_purpose::STANDARD, Engine};
use nimbus_common::{Error, Result};

/// Snapshot file written by a backup
pub fn snapshot_path(timestamp: i64) -> String {
    format!("/tmp/snapshot-{timestamp}.db")
}

/// Snapshot file a restore reads from
pub const RESTORE_PATH: &str = "/tmp/restore-snapshot.db";

/// Staging file for chunked restores
pub const RESTORE_STAGING_PATH: &str = "/tmp/restore-snapshot.b64";

/// Object-store key of a snapshot: `{cluster_id}/snapshot-{unix_ts}.db`
pub fn object_key(cluster_id: &str, timestamp: i64) -> String {
    format!("{cluster_id}/snapshot-{timestamp}.db")
}

/// Read a file on the node as one base64 line
pub fn read_file_command(path: &str) -> String {
    format!("sudo base64 -w 0 {path}")
}

/// Decode the output of [`read_file_command`]
pub fn decode_output(output: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(output.trim())
        .map_err(|e| Error::serialization_for_kind("base64", e.to_string()))
}

/// Write `content` to `path` on the node in one command
pub fn write_file_command(path: &str, content: &[u8]) -> String {
    format!("echo '{}' | base64 -d > {path}", STANDARD.encode(content))
}

/// Commands that place `content` at `path`.
///
/// Content whose encoding fits in `single_line_limit` goes in one
/// `echo | base64 -d`. Larger content is appended to a staging file in
/// `chunk_size` pieces and decoded once.
pub fn write_file_commands(
    path: &str,
    staging: &str,
    content: &[u8],
    single_line_limit: usize,
    chunk_size: usize,
) -> Vec<String> {
    let encoded = STANDARD.encode(content);
    if encoded.len() <= single_line_limit {
        return vec![format!("echo '{encoded}' | base64 -d > {path}")];
    }

    let chunk_size = chunk_size.max(4);
    let mut commands = vec![format!("rm -f {staging}")];
    // base64 is ASCII, so byte chunks are char boundaries
    commands.extend(
        encoded
            .as_bytes()
            .chunks(chunk_size)
            .map(|chunk| format!("printf '%s' '{}' >> {staging}", String::from_utf8_lossy(chunk))),
    );
    commands.push(format!("base64 -d {staging} > {path} && rm -f {staging}"));
    commands
}
