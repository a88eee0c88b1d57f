//! Raw POSIX shared-memory region plumbing.
//!
//! Thin owner of an `shm_open` fd and one `mmap` of it. The table layer
//! decides how large a mapping to ask for; this layer only guarantees the
//! mapping exists for the struct's lifetime and that the backing object is
//! big enough before mapping.

use std::ffi::CString;
use std::io;

use crate::TableError;

pub(crate) struct ShmRegion {
    fd: libc::c_int,
    base: *mut u8,
    len: usize,
    name: String,
    owner: bool,
}

// The mapping is plain memory; all concurrent access goes through the
// in-region lock at a higher layer.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Creates the named region, sizes it to `len`, and maps it. Fails if a
    /// region of that name already exists.
    pub fn create(name: &str, len: usize) -> Result<Self, TableError> {
        let c_name = os_name(name)?;

        // World-readable so consumer runtimes under other UIDs can attach.
        let old_umask = unsafe { libc::umask(0) };
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o666 as libc::mode_t,
            )
        };
        unsafe { libc::umask(old_umask) };

        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EEXIST) => TableError::AlreadyExists {
                    name: name.to_string(),
                },
                _ => TableError::Allocation {
                    name: name.to_string(),
                    source: err,
                },
            });
        }

        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let source = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(TableError::Allocation {
                name: name.to_string(),
                source,
            });
        }

        let base = match map(fd, len) {
            Ok(base) => base,
            Err(source) => {
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(TableError::Allocation {
                    name: name.to_string(),
                    source,
                });
            }
        };

        Ok(Self {
            fd,
            base,
            len,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Opens an existing named region and maps its first `len` bytes. The
    /// backing object must already be at least `len` bytes long; mapping
    /// beyond it would fault on first access instead of failing here.
    pub fn open(name: &str, len: usize) -> Result<Self, TableError> {
        let c_name = os_name(name)?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666 as libc::mode_t) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => TableError::NotFound {
                    name: name.to_string(),
                },
                _ => TableError::Allocation {
                    name: name.to_string(),
                    source: err,
                },
            });
        }

        let backing = match object_len(fd) {
            Ok(backing) => backing,
            Err(source) => {
                unsafe { libc::close(fd) };
                return Err(TableError::Allocation {
                    name: name.to_string(),
                    source,
                });
            }
        };
        if backing < len as u64 {
            unsafe { libc::close(fd) };
            return Err(TableError::Layout {
                name: name.to_string(),
                reason: format!("backing object is {backing} bytes, need {len}"),
            });
        }

        let base = match map(fd, len) {
            Ok(base) => base,
            Err(source) => {
                unsafe { libc::close(fd) };
                return Err(TableError::Layout {
                    name: name.to_string(),
                    reason: source.to_string(),
                });
            }
        };

        Ok(Self {
            fd,
            base,
            len,
            name: name.to_string(),
            owner: false,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Removes the name so no future open can find the region. Existing
    /// mappings (ours and other processes') stay valid until unmapped.
    pub fn unlink(&self) -> io::Result<()> {
        let c_name = os_name(&self.name).expect("name validated at construction");
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.base as *mut libc::c_void, self.len) != 0 {
                tracing::warn!(
                    name = %self.name,
                    "munmap failed: {}",
                    io::Error::last_os_error()
                );
            }
            libc::close(self.fd);
        }
    }
}

fn map(fd: libc::c_int, len: usize) -> io::Result<*mut u8> {
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(base as *mut u8)
}

fn object_len(fd: libc::c_int) -> io::Result<u64> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { stat.assume_init() }.st_size as u64)
}

/// shm object names must be a single path component with a leading slash.
fn os_name(name: &str) -> Result<CString, TableError> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.contains('/') {
        return Err(TableError::Allocation {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "invalid shm name"),
        });
    }
    CString::new(format!("/{bare}")).map_err(|_| TableError::Allocation {
        name: name.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "shm name contains NUL"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("region_{tag}_{}", std::process::id())
    }

    #[test]
    fn create_open_drop_cycle() {
        let name = unique("cycle");
        let region = ShmRegion::create(&name, 64).unwrap();
        assert!(region.is_owner());
        assert_eq!(region.len(), 64);

        let attached = ShmRegion::open(&name, 64).unwrap();
        assert!(!attached.is_owner());
        drop(attached);

        region.unlink().unwrap();
        drop(region);

        assert!(matches!(
            ShmRegion::open(&name, 64),
            Err(TableError::NotFound { .. })
        ));
    }

    #[test]
    fn create_refuses_existing_name() {
        let name = unique("exists");
        let region = ShmRegion::create(&name, 32).unwrap();
        assert!(matches!(
            ShmRegion::create(&name, 32),
            Err(TableError::AlreadyExists { .. })
        ));
        region.unlink().unwrap();
    }

    #[test]
    fn open_rejects_short_backing_object() {
        let name = unique("short");
        let region = ShmRegion::create(&name, 16).unwrap();
        assert!(matches!(
            ShmRegion::open(&name, 4096),
            Err(TableError::Layout { .. })
        ));
        region.unlink().unwrap();
    }

    #[test]
    fn writes_are_visible_through_second_mapping() {
        let name = unique("visible");
        let region = ShmRegion::create(&name, 8).unwrap();
        unsafe { (region.as_ptr() as *mut u32).write_volatile(0xdead_beef) };

        let attached = ShmRegion::open(&name, 8).unwrap();
        let value = unsafe { (attached.as_ptr() as *const u32).read_volatile() };
        assert_eq!(value, 0xdead_beef);

        region.unlink().unwrap();
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(ShmRegion::create("", 8).is_err());
        assert!(ShmRegion::create("a/b", 8).is_err());
    }
}
