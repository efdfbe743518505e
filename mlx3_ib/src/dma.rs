//! Physically contiguous, page-aligned DMA buffers.
//!
//! The card reads and writes these buffers directly, so they come from the
//! global allocator page-aligned and zeroed and are handed to the hardware
//! by physical address. The platforms this driver targets identity-map DMA
//! memory, so the physical address equals the virtual one.

use core::alloc::Layout;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use alloc::alloc::{alloc_zeroed, dealloc};
use zerocopy::FromBytes;

pub(super) const PAGE_SIZE: usize = 4096;

/// A physical address usable as a DMA target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct PhysicalAddress(usize);

impl PhysicalAddress {
    pub(super) fn value(&self) -> usize {
        self.0
    }
}

impl core::ops::AddAssign<usize> for PhysicalAddress {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

/// An owned run of DMA pages. Freed on drop.
#[derive(Debug)]
pub(super) struct DmaPages {
    ptr: NonNull<u8>,
    layout: Layout,
}

// the allocation is exclusively owned
unsafe impl Send for DmaPages {}

impl DmaPages {
    pub(super) fn size(&self) -> usize {
        self.layout.size()
    }

    pub(super) fn physical(&self) -> PhysicalAddress {
        PhysicalAddress(self.ptr.as_ptr() as usize)
    }

    pub(super) fn as_slice(
        &self, byte_offset: usize, length: usize,
    ) -> Result<&[u8], &'static str> {
        if byte_offset + length > self.layout.size() {
            return Err("offset out of DMA buffer bounds");
        }
        Ok(unsafe {
            core::slice::from_raw_parts(self.ptr.as_ptr().add(byte_offset), length)
        })
    }

    pub(super) fn as_slice_mut(
        &mut self, byte_offset: usize, length: usize,
    ) -> Result<&mut [u8], &'static str> {
        if byte_offset + length > self.layout.size() {
            return Err("offset out of DMA buffer bounds");
        }
        Ok(unsafe {
            core::slice::from_raw_parts_mut(self.ptr.as_ptr().add(byte_offset), length)
        })
    }

    /// Reinterpret the buffer contents at the given offset as a `T`.
    pub(super) fn as_type<T: FromBytes>(
        &self, byte_offset: usize,
    ) -> Result<&T, &'static str> {
        if byte_offset + size_of::<T>() > self.layout.size() {
            return Err("offset out of DMA buffer bounds");
        }
        let ptr = unsafe { self.ptr.as_ptr().add(byte_offset) };
        if ptr as usize % align_of::<T>() != 0 {
            return Err("misaligned access into DMA buffer");
        }
        Ok(unsafe { &*(ptr as *const T) })
    }

    pub(super) fn as_type_mut<T: FromBytes>(
        &mut self, byte_offset: usize,
    ) -> Result<&mut T, &'static str> {
        if byte_offset + size_of::<T>() > self.layout.size() {
            return Err("offset out of DMA buffer bounds");
        }
        let ptr = unsafe { self.ptr.as_ptr().add(byte_offset) };
        if ptr as usize % align_of::<T>() != 0 {
            return Err("misaligned access into DMA buffer");
        }
        Ok(unsafe { &mut *(ptr as *mut T) })
    }
}

impl Drop for DmaPages {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Allocate a zeroed, physically contiguous DMA buffer of at least
/// `size` bytes, rounded up to whole pages.
pub(super) fn create_contiguous_mapping(
    size: usize,
) -> Result<(DmaPages, PhysicalAddress), &'static str> {
    let size = size.max(1).next_multiple_of(PAGE_SIZE);
    let layout = Layout::from_size_align(size, PAGE_SIZE)
        .map_err(|_| "invalid DMA buffer size")?;
    let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
        .ok_or("out of memory")?;
    let pages = DmaPages { ptr, layout };
    let physical = pages.physical();
    Ok((pages, physical))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_page_aligned_and_zeroed() {
        let (pages, physical) = create_contiguous_mapping(100).unwrap();
        assert_eq!(physical.value() % PAGE_SIZE, 0);
        assert_eq!(pages.size(), PAGE_SIZE);
        assert!(pages.as_slice(0, PAGE_SIZE).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn typed_access_checks_bounds() {
        let (pages, _) = create_contiguous_mapping(PAGE_SIZE).unwrap();
        assert!(pages.as_type::<u64>(PAGE_SIZE - 4).is_err());
        assert!(pages.as_type::<u64>(0).is_ok());
    }
}
