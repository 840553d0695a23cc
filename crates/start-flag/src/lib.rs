//! Named shared-memory start trigger for deferred replay jobs.
//!
//! A replay job whose autostart is disabled publishes a tiny segment named
//! `replayjob_<job name>` and waits until an external producer flips the
//! start byte. The layout is fixed and shared with non-Rust producers:
//!
//! | offset | size | content                 |
//! |--------|------|-------------------------|
//! | 0      | 6    | magic tag `DSCDRP`      |
//! | 6      | 1    | layout version (`1`)    |
//! | 7      | 1    | start flag (0 = wait)   |
//!
//! On Linux the segments live in `/dev/shm`, which is where POSIX
//! `shm_open("/replayjob_<name>")` places them, so both sides interoperate.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;

/// Magic tag at the start of every segment.
pub const MAGIC: &[u8; 6] = b"DSCDRP";

/// Current layout version.
pub const VERSION: u8 = 1;

/// Total segment size in bytes.
pub const SEGMENT_SIZE: usize = MAGIC.len() + 2;

const VERSION_OFFSET: usize = MAGIC.len();
const FLAG_OFFSET: usize = MAGIC.len() + 1;

/// Errors raised while creating or attaching to a start segment.
#[derive(Debug, Error)]
pub enum StartFlagError {
    #[error("Invalid segment name '{0}'")]
    InvalidName(String),

    #[error("Shared segment '{0}' not found")]
    NotFound(String),

    #[error("Invalid shared segment '{name}': magic tag mismatch")]
    InvalidMagic { name: String },

    #[error("Incompatible shared segment '{name}': version {found}, expected {expected}")]
    IncompatibleVersion {
        name: String,
        found: u8,
        expected: u8,
    },

    #[error("Shared segment '{name}' is too small ({size} bytes)")]
    TooSmall { name: String, size: u64 },

    #[error("IO error on shared segment {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StartFlagError>;

/// Segment name used for a job.
pub fn segment_name(job_name: &str) -> String {
    format!("replayjob_{job_name}")
}

/// Platform default directory backing named segments.
pub fn default_segment_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir()
    }
}

fn validate_job_name(job_name: &str) -> Result<()> {
    if job_name.is_empty()
        || job_name == "."
        || job_name == ".."
        || job_name.contains(['/', '\\', '\0'])
    {
        return Err(StartFlagError::InvalidName(job_name.to_string()));
    }
    Ok(())
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StartFlagError + '_ {
    move |source| StartFlagError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A mapped start segment.
///
/// The creating side owns the backing file and removes it on drop; attached
/// producers leave it in place.
#[derive(Debug)]
pub struct StartFlag {
    mmap: MmapMut,
    _file: File,
    path: PathBuf,
    name: String,
    owner: bool,
}

impl StartFlag {
    /// Create (or re-initialise a stale) segment for `job_name` with the
    /// start byte cleared.
    pub fn create(dir: &Path, job_name: &str) -> Result<Self> {
        validate_job_name(job_name)?;
        std::fs::create_dir_all(dir).map_err(io_err(dir))?;

        let name = segment_name(job_name);
        let path = dir.join(&name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(io_err(&path))?;
        file.set_len(SEGMENT_SIZE as u64).map_err(io_err(&path))?;

        // SAFETY: the file was just sized to SEGMENT_SIZE and stays open for
        // the lifetime of the mapping.
        let mut mmap = unsafe {
            MmapOptions::new()
                .len(SEGMENT_SIZE)
                .map_mut(&file)
                .map_err(io_err(&path))?
        };

        mmap[..MAGIC.len()].copy_from_slice(MAGIC);
        mmap[VERSION_OFFSET] = VERSION;
        mmap[FLAG_OFFSET] = 0;
        mmap.flush().map_err(io_err(&path))?;

        Ok(Self {
            mmap,
            _file: file,
            path,
            name,
            owner: true,
        })
    }

    /// Attach to an existing segment, validating magic tag and version.
    pub fn open(dir: &Path, job_name: &str) -> Result<Self> {
        validate_job_name(job_name)?;

        let name = segment_name(job_name);
        let path = dir.join(&name);

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StartFlagError::NotFound(name));
            }
            Err(e) => return Err(io_err(&path)(e)),
        };

        let size = file.metadata().map_err(io_err(&path))?.len();
        if size < SEGMENT_SIZE as u64 {
            return Err(StartFlagError::TooSmall { name, size });
        }

        // SAFETY: the file is at least SEGMENT_SIZE bytes and stays open for
        // the lifetime of the mapping.
        let mmap = unsafe {
            MmapOptions::new()
                .len(SEGMENT_SIZE)
                .map_mut(&file)
                .map_err(io_err(&path))?
        };

        if &mmap[..MAGIC.len()] != MAGIC {
            return Err(StartFlagError::InvalidMagic { name });
        }
        if mmap[VERSION_OFFSET] != VERSION {
            return Err(StartFlagError::IncompatibleVersion {
                name,
                found: mmap[VERSION_OFFSET],
                expected: VERSION,
            });
        }

        Ok(Self {
            mmap,
            _file: file,
            path,
            name,
            owner: false,
        })
    }

    /// Whether the start byte has been set by a producer.
    pub fn is_set(&self) -> bool {
        // SAFETY: FLAG_OFFSET < SEGMENT_SIZE == mapping length. Volatile because
        // another process writes this byte.
        unsafe { std::ptr::read_volatile(self.mmap.as_ptr().add(FLAG_OFFSET)) != 0 }
    }

    /// Set the start byte.
    pub fn trigger(&mut self) -> Result<()> {
        // SAFETY: FLAG_OFFSET < SEGMENT_SIZE == mapping length.
        unsafe { std::ptr::write_volatile(self.mmap.as_mut_ptr().add(FLAG_OFFSET), 1) };
        self.mmap.flush().map_err(io_err(&self.path))
    }

    /// Segment name (`replayjob_<job name>`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle created the segment.
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for StartFlag {
    fn drop(&mut self) {
        if self.owner {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
