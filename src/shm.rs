//! POSIX shared memory regions and address-independent placement
//!
//! A region is mapped at an arbitrary address in every process that opens it, so
//! objects inside it never store pointers. They refer to each other by offset from
//! the start of the region ([`RelativeRef`]), and only types marked
//! [`AddressIndependent`] may be placed.

use std::ffi::CString;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize};

use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use tracing::{debug, warn};

use crate::error::{Result, VenomError};

const SHM_PREFIX: &str = "/venom_";
const MAX_NAME_LEN: usize = 255 - SHM_PREFIX.len();

/// Types whose bytes mean the same thing at any mapping address
///
/// # Safety
/// The type must contain no pointers or references (absolute addresses), no
/// process-local handles, and must stay valid when its bytes are shared between
/// processes that only synchronize through its own atomics.
pub unsafe trait AddressIndependent {}

macro_rules! address_independent {
    ($($ty:ty),* $(,)?) => {
        $(unsafe impl AddressIndependent for $ty {})*
    };
}

address_independent!(
    u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, bool,
    AtomicU8, AtomicU32, AtomicU64, AtomicUsize, AtomicBool,
);

unsafe impl<T: AddressIndependent, const N: usize> AddressIndependent for [T; N] {}

/// Offset of a `T` from the start of a region
#[repr(transparent)]
pub struct RelativeRef<T> {
    offset: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RelativeRef<T> {
    pub const fn new(offset: u64) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl<T> Clone for RelativeRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RelativeRef<T> {}

impl<T> PartialEq for RelativeRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for RelativeRef<T> {}

impl<T> fmt::Debug for RelativeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelativeRef(+{})", self.offset)
    }
}

unsafe impl<T> AddressIndependent for RelativeRef<T> {}

/// Round `offset` up to a multiple of `align` (a power of two)
#[inline]
pub const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

fn shm_path(name: &str) -> Result<CString> {
    if name.len() > MAX_NAME_LEN {
        return Err(VenomError::NamespaceTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    if name.is_empty() || name.contains('/') {
        return Err(VenomError::InvalidName(name.to_string()));
    }
    CString::new(format!("{SHM_PREFIX}{name}")).map_err(|_| VenomError::InvalidName(name.to_string()))
}

fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    // SAFETY: a fresh shared mapping of an open descriptor; nothing else refers
    // to the returned range yet.
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| VenomError::Mmap(e.into()))?
    };
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| {
            VenomError::Mmap(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned null",
            ))
        })
}

/// Handle to a mapped shared memory region
pub struct ShmRegion {
    _fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: the region is plain bytes; everything placed in it is AddressIndependent
// and synchronizes through its own atomics.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create (or take over) a region of `size` zeroed bytes
    ///
    /// The creator owns the name and unlinks it on drop.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let path = shm_path(name)?;

        let fd = match shm_open(
            path.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        ) {
            Ok(fd) => fd,
            Err(_) => {
                warn!(name, "Shared memory already exists, taking it over");
                shm_open(path.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
                    VenomError::ShmCreate {
                        name: name.to_string(),
                        source: e.into(),
                    }
                })?
            }
        };

        ftruncate(&fd, size as u64).map_err(|e| VenomError::Truncate(e.into()))?;
        let addr = map(&fd, size)?;

        // SAFETY: the mapping is `size` bytes long and not yet shared with readers
        // that expect content.
        unsafe { std::ptr::write_bytes(addr.as_ptr(), 0, size) };

        debug!(name, size, "Created shared memory region");
        Ok(Self {
            _fd: fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: true,
        })
    }

    /// Map an existing region at a fresh address
    pub fn open(name: &str) -> Result<Self> {
        let path = shm_path(name)?;
        let open_error = |e: rustix::io::Errno| VenomError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        };

        let fd = shm_open(path.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(open_error)?;
        let size = fstat(&fd).map_err(open_error)?.st_size as usize;
        let addr = map(&fd, size)?;

        debug!(name, size, "Opened shared memory region");
        Ok(Self {
            _fd: fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
        })
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Pointer to a `T` at `offset`, checked against the region bounds and `T`'s
    /// alignment
    fn checked<T>(&self, offset: u64) -> Result<*mut T> {
        let invalid = || VenomError::InvalidPlacement {
            offset,
            size: size_of::<T>(),
            region: self.size,
        };
        let start = usize::try_from(offset).map_err(|_| invalid())?;
        let end = start.checked_add(size_of::<T>()).ok_or_else(invalid)?;
        if end > self.size {
            return Err(invalid());
        }
        // SAFETY: `start + size_of::<T>() <= self.size`, inside the mapping.
        let ptr = unsafe { self.as_ptr().add(start) };
        if ptr.align_offset(align_of::<T>()) != 0 {
            return Err(invalid());
        }
        Ok(ptr.cast::<T>())
    }

    /// Offset of `value` from the region start, if it lies entirely inside
    /// this mapping
    pub fn offset_of<T>(&self, value: &T) -> Option<u64> {
        let start = (value as *const T as usize).checked_sub(self.as_ptr() as usize)?;
        let end = start.checked_add(size_of::<T>())?;
        (end <= self.size).then_some(start as u64)
    }

    /// Move `value` into the region at `offset`
    ///
    /// # Safety
    /// No other mapping may be using the bytes at `offset` while they are
    /// written, and whatever was there before is overwritten without being dropped.
    pub unsafe fn place<T: AddressIndependent>(&self, offset: u64, value: T) -> Result<RelativeRef<T>> {
        let ptr = self.checked::<T>(offset)?;
        std::ptr::write(ptr, value);
        Ok(RelativeRef::new(offset))
    }

    /// Borrow the `T` at `reference`
    ///
    /// # Safety
    /// A `T` must have been placed at that offset, through this or any other
    /// mapping of the region.
    pub unsafe fn get<T: AddressIndependent>(&self, reference: RelativeRef<T>) -> Result<&T> {
        let ptr = self.checked::<T>(reference.offset())?;
        Ok(&*ptr)
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: exactly the range returned by mmap; every borrow of it is tied
        // to `&self`.
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.is_owner {
            if let Ok(path) = shm_path(&self.name) {
                let _ = shm_unlink(path.as_c_str());
            }
            debug!(name = %self.name, "Unlinked shared memory region");
        }
    }
}

impl fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("is_owner", &self.is_owner)
            .finish()
    }
}
