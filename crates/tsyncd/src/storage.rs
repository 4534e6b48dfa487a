//! On-disk identity and pinned keys.
//!
//! Layout of the storage directory (default `~/.tsync`):
//!
//! ```text
//! id           private key, `k.` form, mode 0600
//! id.pub       public key, `p.` form, must match `id`
//! checked.pub  one pinned peer per line: "<name>" <p.key>
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tsync_core::crypto::{self, CryptoError, Identity};
use tsync_core::wire::{self, WireError};

pub const IDENTITY_FILE: &str = "id";
pub const PUBLIC_IDENTITY_FILE: &str = "id.pub";
pub const PINS_FILE: &str = "checked.pub";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Key {
        path: PathBuf,
        #[source]
        source: CryptoError,
    },
    #[error("{0}: public key file does not match private key")]
    PublicKeyMismatch(PathBuf),
    #[error("{path}:{line}: {source}")]
    MalformedPin {
        path: PathBuf,
        line: usize,
        #[source]
        source: WireError,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pins_path(&self) -> PathBuf {
        self.dir.join(PINS_FILE)
    }

    /// Load the stored identity, or generate and save one on first run.
    pub fn load_or_create_identity(&self) -> Result<Identity, StorageError> {
        if let Some(identity) = self.load_identity()? {
            return Ok(identity);
        }
        let identity = Identity::generate().map_err(|source| StorageError::Key {
            path: self.dir.join(IDENTITY_FILE),
            source,
        })?;
        self.save_identity(&identity)?;
        tracing::info!(
            dir = %self.dir.display(),
            human_id = %identity.human_id(),
            "generated new identity"
        );
        Ok(identity)
    }

    /// `Ok(None)` if no identity has been saved yet.
    pub fn load_identity(&self) -> Result<Option<Identity>, StorageError> {
        let path = self.dir.join(IDENTITY_FILE);
        let private = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        let identity = Identity::from_private_string(private.trim())
            .map_err(|source| StorageError::Key { path, source })?;

        let pub_path = self.dir.join(PUBLIC_IDENTITY_FILE);
        let public = fs::read_to_string(&pub_path).map_err(io_err(&pub_path))?;
        if public.trim() != identity.public_key_to_string() {
            return Err(StorageError::PublicKeyMismatch(pub_path));
        }
        Ok(Some(identity))
    }

    pub fn save_identity(&self, identity: &Identity) -> Result<(), StorageError> {
        let path = self.dir.join(IDENTITY_FILE);
        let private = identity.private_key_to_string();
        write_file(&path, format!("{}\n", private.as_str()).as_bytes(), 0o600)?;

        let pub_path = self.dir.join(PUBLIC_IDENTITY_FILE);
        let public = format!("{}\n", identity.public_key_to_string());
        write_file(&pub_path, public.as_bytes(), 0o644)
    }
}

// ── Pins ──────────────────────────────────────────────────────────────────────

/// Read pinned keys. A missing file is an empty list.
pub fn read_pins(path: &Path) -> Result<Vec<(String, String)>, StorageError> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(path)(e)),
    };
    let malformed = |line: usize, source: WireError| StorageError::MalformedPin {
        path: path.to_path_buf(),
        line,
        source,
    };

    let mut pins = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, rest) = wire::split_quoted(line).map_err(|e| malformed(idx + 1, e))?;
        let key = rest.trim();
        crypto::public_key_from_string(key).map_err(|e| malformed(idx + 1, e.into()))?;
        pins.push((name, key.to_string()));
    }
    Ok(pins)
}

/// Replace the pins file. The new list goes to a sibling temp file that is
/// renamed over `path`, so readers see the old list or the new one in full.
pub fn write_pins(path: &Path, pins: &[(String, String)]) -> Result<(), StorageError> {
    let mut text = String::new();
    for (name, key) in pins {
        wire::push_quoted(&mut text, name);
        text.push(' ');
        text.push_str(key);
        text.push('\n');
    }

    let tmp = temp_sibling(path);
    let written = write_file(&tmp, text.as_bytes(), 0o644)
        .and_then(|()| fs::rename(&tmp, path).map_err(io_err(path)));
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

/// `<path>.<pid>.<n>.tmp`, unique per call within this process.
fn temp_sibling(path: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.{n}.tmp", std::process::id()));
    path.with_file_name(name)
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), StorageError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(mode);
        let mut file = options.open(path).map_err(io_err(path))?;
        // mode() only applies on creation
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(io_err(path))?;
        file.write_all(contents).map_err(io_err(path))
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        let mut file = options.open(path).map_err(io_err(path))?;
        file.write_all(contents).map_err(io_err(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tsync-storage-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn identity_created_once_then_reloaded() {
        let dir = temp_dir("identity");
        let storage = Storage::open(&dir).unwrap();
        assert!(storage.load_identity().unwrap().is_none());

        let first = storage.load_or_create_identity().unwrap();
        let second = storage.load_or_create_identity().unwrap();
        assert_eq!(first.public, second.public);

        let public = fs::read_to_string(dir.join(PUBLIC_IDENTITY_FILE)).unwrap();
        assert_eq!(public.trim(), first.public_key_to_string());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.join(IDENTITY_FILE)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn mismatched_public_key_file_is_rejected() {
        let dir = temp_dir("mismatch");
        let storage = Storage::open(&dir).unwrap();
        storage.load_or_create_identity().unwrap();

        let other = Identity::generate().unwrap();
        fs::write(dir.join(PUBLIC_IDENTITY_FILE), other.public_key_to_string()).unwrap();
        assert!(matches!(
            storage.load_identity(),
            Err(StorageError::PublicKeyMismatch(_))
        ));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn pins_roundtrip_with_awkward_names() {
        let dir = temp_dir("pins");
        let storage = Storage::open(&dir).unwrap();
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();
        let pins = vec![
            ("desk \"main\"".to_string(), a.public_key_to_string()),
            ("lap top".to_string(), b.public_key_to_string()),
        ];
        write_pins(&storage.pins_path(), &pins).unwrap();
        assert_eq!(read_pins(&storage.pins_path()).unwrap(), pins);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn concurrent_pin_writes_leave_one_whole_list() {
        let dir = temp_dir("racepins");
        let storage = Storage::open(&dir).unwrap();
        let path = storage.pins_path();
        let lists: Vec<Vec<(String, String)>> = (0..8)
            .map(|i| {
                (0..=i)
                    .map(|j| {
                        let id = Identity::generate().unwrap();
                        (format!("peer-{i}-{j}"), id.public_key_to_string())
                    })
                    .collect()
            })
            .collect();

        std::thread::scope(|scope| {
            for list in &lists {
                let path = &path;
                scope.spawn(move || {
                    for _ in 0..10 {
                        write_pins(path, list).unwrap();
                    }
                });
            }
        });

        let stored = read_pins(&path).unwrap();
        assert!(lists.contains(&stored), "pins file holds a mix of writes");
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_pins_file_is_empty() {
        let dir = temp_dir("nopins");
        let storage = Storage::open(&dir).unwrap();
        assert!(read_pins(&storage.pins_path()).unwrap().is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_pin_reports_line() {
        let dir = temp_dir("badpins");
        let storage = Storage::open(&dir).unwrap();
        let id = Identity::generate().unwrap();
        let text = format!(
            "# pinned peers\n\"ok\" {}\n\"bad\" p.not-a-key\n",
            id.public_key_to_string()
        );
        fs::write(storage.pins_path(), text).unwrap();
        match read_pins(&storage.pins_path()) {
            Err(StorageError::MalformedPin { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected malformed pin, got {other:?}"),
        }
        let _ = fs::remove_dir_all(&dir);
    }
}
