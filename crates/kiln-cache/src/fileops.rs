//! File operations used by the cache: streamed hashing, copying, verification

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Read buffer used when hashing; files are never loaded whole
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Number of leading bytes inspected by [`is_binary_file`]
const BINARY_SNIFF_LEN: usize = 8000;

/// SHA-256 of a file's contents, hex encoded
pub fn hash_file(path: &Path) -> io::Result<String> {
    hash_file_with_size(path).map(|(hash, _)| hash)
}

/// SHA-256 of a file's contents together with the number of bytes read
pub fn hash_file_with_size(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok((format!("{:x}", hasher.finalize()), size))
}

/// SHA-256 of an in-memory buffer, hex encoded
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Whether a string looks like a hex-encoded SHA-256 digest
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Copy a file, creating the destination's parent directories.
///
/// `fs::copy` carries the permission bits over, so executables stay
/// executable after a restore.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)
}

/// Whether a file's contents hash to `expected`
pub fn verify_file(path: &Path, expected: &str) -> io::Result<bool> {
    Ok(hash_file(path)? == expected)
}

/// Classify a file as binary when a NUL byte shows up near the start
pub fn is_binary_file(path: &Path) -> io::Result<bool> {
    let file = File::open(path)?;
    let mut head = Vec::with_capacity(BINARY_SNIFF_LEN);
    file.take(BINARY_SNIFF_LEN as u64).read_to_end(&mut head)?;
    Ok(head.contains(&0))
}

/// Total size in bytes of all regular files below `path`
pub fn directory_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Whether `path` is a relative path that stays inside its base directory
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.contains('\\') {
        return false;
    }
    let path = Path::new(path);
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Render a path relative to `base` with forward slashes
pub fn relative_path_string(path: &Path, base: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.txt");
        fs::write(&path, "hello world").unwrap();

        let (hash, size) = hash_file_with_size(&path).unwrap();
        assert_eq!(hash, hash_bytes(b"hello world"));
        assert_eq!(size, 11);
        assert!(is_sha256_hex(&hash));
    }

    #[test]
    fn test_hash_file_larger_than_buffer() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big.bin");
        let data: Vec<u8> = (0..HASH_BUFFER_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn test_copy_creates_parents_and_verifies() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.txt");
        fs::write(&src, "content").unwrap();
        let dst = temp.path().join("deep/nested/a.txt");

        copy_file(&src, &dst).unwrap();
        let hash = hash_file(&src).unwrap();
        assert!(verify_file(&dst, &hash).unwrap());

        fs::write(&dst, "tampered").unwrap();
        assert!(!verify_file(&dst, &hash).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let src = temp.path().join("run.sh");
        fs::write(&src, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).unwrap();

        let dst = temp.path().join("out/run.sh");
        copy_file(&src, &dst).unwrap();
        let mode = fs::metadata(&dst).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_binary_classification() {
        let temp = TempDir::new().unwrap();
        let text = temp.path().join("a.js");
        let binary = temp.path().join("a.wasm");
        fs::write(&text, "export const a = 1;\n").unwrap();
        fs::write(&binary, [0x00u8, 0x61, 0x73, 0x6d]).unwrap();

        assert!(!is_binary_file(&text).unwrap());
        assert!(is_binary_file(&binary).unwrap());
    }

    #[test]
    fn test_directory_size() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("sub")).unwrap();
        fs::write(temp.path().join("a"), [0u8; 10]).unwrap();
        fs::write(temp.path().join("sub/b"), [0u8; 5]).unwrap();

        assert_eq!(directory_size(temp.path()), 15);
    }

    #[test]
    fn test_safe_relative_paths() {
        assert!(is_safe_relative_path("dist/index.js"));
        assert!(is_safe_relative_path("tsconfig.tsbuildinfo"));
        assert!(!is_safe_relative_path(""));
        assert!(!is_safe_relative_path("/etc/passwd"));
        assert!(!is_safe_relative_path("../outside.js"));
        assert!(!is_safe_relative_path("dist/../../x"));
        assert!(!is_safe_relative_path("./dist/a.js"));
        assert!(!is_safe_relative_path("dist\\a.js"));
    }

    #[test]
    fn test_relative_path_string() {
        let base = Path::new("/repo/pkg");
        assert_eq!(
            relative_path_string(Path::new("/repo/pkg/dist/a.js"), base),
            Some("dist/a.js".to_string())
        );
        assert_eq!(relative_path_string(Path::new("/repo/other"), base), None);
        assert_eq!(relative_path_string(base, base), None);
    }
}
