//! Per-slot buffers kept in a device copy and a host copy.

/// A slot-indexed buffer held twice.
///
/// `device` is what batch kernels read. `host` is what control code reads to
/// decide whether a stage needs launching at all, without waiting on the
/// device copy. Setup writes both.
#[derive(Debug, Clone, PartialEq)]
pub struct HostMirrored<T> {
    device: Vec<T>,
    host: Vec<T>,
}

impl<T: Copy> HostMirrored<T> {
    pub fn new(len: usize, value: T) -> Self {
        Self {
            device: vec![value; len],
            host: vec![value; len],
        }
    }

    pub fn device(&self) -> &[T] {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut [T] {
        &mut self.device
    }

    pub fn host(&self) -> &[T] {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut [T] {
        &mut self.host
    }
}
