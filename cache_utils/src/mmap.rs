use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::slice::{from_raw_parts, from_raw_parts_mut};
use nix::errno::Errno;
use nix::sys::mman;

/// Anonymous private mapping holding `size` values of `T`.
///
/// The mapping always starts on a page boundary, which is what makes the
/// in-page offsets of everything inside it predictable.
#[derive(Debug)]
pub struct MMappedMemory<T> {
    pointer: NonNull<T>,
    size: usize,
}

impl<T> MMappedMemory<T> {
    pub fn try_new(
        size: usize,
        huge: bool,
        initializer: impl Fn(usize) -> T,
    ) -> Result<MMappedMemory<T>, nix::Error> {
        let bytes = size
            .checked_mul(core::mem::size_of::<T>())
            .and_then(NonZeroUsize::new)
            .ok_or(Errno::EINVAL)?;
        let mut flags = mman::MapFlags::MAP_PRIVATE;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if huge {
            flags |= mman::MapFlags::MAP_HUGETLB;
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = huge;

        let p: NonNull<c_void> = unsafe {
            mman::mmap_anonymous(
                None,
                bytes,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                flags,
            )
        }?;
        let pointer = p.cast::<T>();
        for i in 0..size {
            // Safety: i < size, the mapping holds size values of T.
            unsafe { pointer.as_ptr().add(i).write(initializer(i)) };
        }
        Ok(MMappedMemory { pointer, size })
    }

    /// Same as `try_new`, falling back to normal pages when huge pages are
    /// not available.
    pub fn new_with_fallback(
        size: usize,
        huge: bool,
        initializer: impl Fn(usize) -> T,
    ) -> Result<MMappedMemory<T>, nix::Error> {
        if huge {
            match Self::try_new(size, true, &initializer) {
                Ok(m) => return Ok(m),
                Err(e) => log::warn!("huge page mapping failed ({}), using normal pages", e),
            }
        }
        Self::try_new(size, false, initializer)
    }

    pub fn as_ptr(&self) -> *const T {
        self.pointer.as_ptr()
    }

    pub fn slice(&self) -> &[T] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn slice_mut(&mut self) -> &mut [T] {
        unsafe { from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }
}

impl<T> Drop for MMappedMemory<T> {
    fn drop(&mut self) {
        unsafe {
            core::ptr::drop_in_place(self.slice_mut());
            let _ = mman::munmap(
                self.pointer.cast::<c_void>(),
                self.size * core::mem::size_of::<T>(),
            );
        }
    }
}
