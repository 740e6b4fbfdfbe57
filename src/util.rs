use std::io::{BufReader, Read};
use std::path::{Component, Path};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Keep the trailing `max` chars of command output. Failure detail tends to
/// live at the end (panic messages, assertion diffs), so tails beat heads.
pub fn output_tail(s: &str, max: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }
    let skipped = char_count - max;
    let tail: String = s.chars().skip(skipped).collect();
    format!("… ({} chars omitted)\n{}", skipped, tail)
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stdout);
        let _ = reader.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    let _ = child.kill();
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(format!("Failed to wait for command: {}", e)),
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
    })
}

/// Validate a workspace-relative path from a plan step.
///
/// Workspace files live in a virtual store keyed by relative path, so this
/// never touches the filesystem: it rejects empty, absolute, and
/// parent-traversing paths, and normalizes `./` components and separators.
pub fn sanitize_rel_path(candidate: &str) -> Result<String, String> {
    if candidate.trim().is_empty() {
        return Err("Path is empty".to_string());
    }

    let normalized = candidate.replace('\\', "/");
    let path = Path::new(&normalized);

    if path.is_absolute() || normalized.starts_with('/') {
        return Err(format!("Absolute paths are not allowed: {}", candidate));
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(s) => parts.push(s),
                None => return Err(format!("Path is not valid UTF-8: {}", candidate)),
            },
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(format!("Parent traversal is not allowed: {}", candidate));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("Absolute paths are not allowed: {}", candidate));
            }
        }
    }

    if parts.is_empty() {
        return Err(format!("Path has no file component: {}", candidate));
    }

    Ok(parts.join("/"))
}

/// Compute a stable hash of file contents (FNV-1a 64-bit).
pub fn hash_bytes(content: &[u8]) -> String {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in content {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    format!("{:016x}", hash)
}

pub fn hash_str(content: &str) -> String {
    hash_bytes(content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::{hash_str, output_tail, sanitize_rel_path, truncate};

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_output_tail_keeps_end() {
        let input = "aaaa\nFAILED: assertion";
        let tail = output_tail(input, 11);
        assert!(tail.ends_with(": assertion"));
        assert!(tail.contains("omitted"));
    }

    #[test]
    fn test_hash_str_is_stable() {
        let a = hash_str("hello");
        let b = hash_str("hello");
        let c = hash_str("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_sanitize_rejects_absolute_and_traversal() {
        assert!(sanitize_rel_path("/etc/passwd").is_err());
        assert!(sanitize_rel_path("../outside.rs").is_err());
        assert!(sanitize_rel_path("src/../../outside.rs").is_err());
        assert!(sanitize_rel_path("").is_err());
        assert!(sanitize_rel_path("  ").is_err());
    }

    #[test]
    fn test_sanitize_normalizes() {
        assert_eq!(sanitize_rel_path("./src/main.rs").unwrap(), "src/main.rs");
        assert_eq!(sanitize_rel_path("src\\lib.rs").unwrap(), "src/lib.rs");
        assert_eq!(sanitize_rel_path("a.ts").unwrap(), "a.ts");
    }
}
