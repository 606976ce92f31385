//! Shared regions behind the channel.
//!
//! On the host a region is a `shared_memory` mapping that also backs a QEMU ivshmem
//! device, inside the guest it is the mapped PCI BAR of that device. Tests and
//! shm-less sessions use plain heap buffers.

use shared_memory::Shmem;

pub trait SharedRegion: Send {
    fn as_slice(&self) -> &[u8];
    fn as_slice_mut(&mut self) -> &mut [u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host side mapping.
pub struct ShmRegion(Shmem);

// The mapping stays valid wherever its owner lives, and the channel only
// touches it from one thread at a time.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    pub fn new(shm: Shmem) -> Self {
        Self(shm)
    }

    pub fn os_id(&self) -> &str {
        self.0.get_os_id()
    }

    pub fn into_inner(self) -> Shmem {
        self.0
    }
}

impl SharedRegion for ShmRegion {
    fn as_slice(&self) -> &[u8] {
        unsafe { self.0.as_slice() }
    }

    fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { self.0.as_slice_mut() }
    }
}

/// Heap buffer standing in for a shared mapping.
#[derive(Debug, Clone)]
pub struct HeapRegion(Box<[u8]>);

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        Self(vec![0; len].into_boxed_slice())
    }
}

impl SharedRegion for HeapRegion {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn as_slice_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl<T: SharedRegion + ?Sized> SharedRegion for Box<T> {
    fn as_slice(&self) -> &[u8] {
        (**self).as_slice()
    }

    fn as_slice_mut(&mut self) -> &mut [u8] {
        (**self).as_slice_mut()
    }
}
