use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

use procpool_api::{PoolError, Result};
use tracing::{debug, warn};

/// A `MAP_SHARED` memory mapping, either anonymous or backed by a POSIX shm object.
///
/// Anonymous mappings are shared with children created by `fork`. Named
/// mappings can additionally be attached by name from an unrelated process.
/// The creator of a named mapping owns the name and unlinks it on drop.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    fd: Option<OwnedFd>,
    name: Option<CString>,
    owner: bool,
}

// The mapping is plain shared memory; synchronisation is the job of whatever
// lives inside it.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Maps `len` zeroed bytes not backed by any name.
    pub fn anonymous(len: usize) -> Result<Self> {
        let ptr = map(len, -1, libc::MAP_SHARED | libc::MAP_ANONYMOUS)?;
        Ok(Self { ptr, len, fd: None, name: None, owner: false })
    }

    /// Creates the shm object `name` exclusively, sized to `len` bytes.
    ///
    /// Fails with an `AlreadyExists` system-call error when the name is taken.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let c_name = shm_name(name)?;
        let raw = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if raw < 0 {
            return Err(PoolError::last_os_error(format!("shm_open({})", name)));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            let err = PoolError::last_os_error(format!("ftruncate({})", name));
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(err);
        }

        match map(len, fd.as_raw_fd(), libc::MAP_SHARED) {
            Ok(ptr) => {
                debug!("Created shared memory {} ({} bytes)", name, len);
                Ok(Self { ptr, len, fd: Some(fd), name: Some(c_name), owner: true })
            }
            Err(err) => {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                Err(err)
            }
        }
    }

    /// Maps an existing shm object at its current size. The name is not owned.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = shm_name(name)?;
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if raw < 0 {
            return Err(PoolError::last_os_error(format!("shm_open({})", name)));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let stat = fstat(&fd).map_err(|e| PoolError::syscall(format!("fstat({})", name), e))?;
        let len = stat.st_size as usize;
        if len == 0 {
            return Err(PoolError::syscall(
                format!("open({})", name),
                io::Error::new(io::ErrorKind::InvalidData, "shared memory object is empty"),
            ));
        }

        let ptr = map(len, fd.as_raw_fd(), libc::MAP_SHARED)?;
        Ok(Self { ptr, len, fd: Some(fd), name: Some(c_name), owner: false })
    }

    /// Removes the name `name`; existing mappings stay valid.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = shm_name(name)?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(PoolError::syscall(format!("shm_unlink({})", name), err));
            }
        }
        Ok(())
    }

    /// Takes over the name so it is unlinked when this mapping drops.
    pub fn claim_name(&mut self) {
        self.owner = self.name.is_some();
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().and_then(|n| n.to_str().ok())
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    // Only unlink when the name still refers to our object; a newer segment
    // may have been created under the same name.
    fn unlink_if_ours(&self) {
        let (Some(name), Some(fd)) = (&self.name, &self.fd) else {
            return;
        };
        let Ok(ours) = fstat(fd) else {
            return;
        };

        let raw = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDONLY, 0) };
        if raw < 0 {
            return;
        }
        let current = unsafe { OwnedFd::from_raw_fd(raw) };
        match fstat(&current) {
            Ok(theirs) if theirs.st_dev == ours.st_dev && theirs.st_ino == ours.st_ino => {
                if unsafe { libc::shm_unlink(name.as_ptr()) } != 0 {
                    warn!("Failed to unlink {:?}: {}", name, io::Error::last_os_error());
                }
            }
            _ => debug!("{:?} was replaced, leaving it in place", name),
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owner {
            self.unlink_if_ours();
        }
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name())
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}

fn shm_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name[1..].contains('/') {
        return Err(PoolError::InvalidParameter(format!(
            "shared memory name {:?} must be a single '/'-prefixed component",
            name
        )));
    }
    CString::new(name)
        .map_err(|_| PoolError::InvalidParameter(format!("shared memory name {:?} contains NUL", name)))
}

fn map(len: usize, fd: libc::c_int, flags: libc::c_int) -> Result<NonNull<u8>> {
    if len == 0 {
        return Err(PoolError::InvalidParameter("cannot map an empty region".to_string()));
    }
    let addr = unsafe {
        libc::mmap(ptr::null_mut(), len, libc::PROT_READ | libc::PROT_WRITE, flags, fd, 0)
    };
    if addr == libc::MAP_FAILED {
        return Err(PoolError::last_os_error(format!("mmap({} bytes)", len)));
    }
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| PoolError::OutOfMemory("mmap returned null".to_string()))
}

fn fstat(fd: &OwnedFd) -> io::Result<libc::stat> {
    let mut stat = unsafe { std::mem::zeroed::<libc::stat>() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat)
}

/// `true` for the error [`SharedRegion::create`] returns when the name exists.
pub fn is_already_exists(err: &PoolError) -> bool {
    matches!(err, PoolError::SystemCall { source, .. } if source.kind() == io::ErrorKind::AlreadyExists)
}
