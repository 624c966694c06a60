/// An owned send buffer, allocated through [`BufferAllocator::alloc`] and
/// handed to [`crate::tcp::TcpConnectionManager::send_with_connection`].
/// Ownership transfers to the Connection Manager for the duration of the
/// send call; the CM always releases the memory by the time the call
/// returns, whether or not the full payload was written synchronously.
#[derive(Debug, Clone)]
pub struct SendBuffer {
    data: Vec<u8>,
}

impl SendBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Splits off everything before `at`, returning the consumed prefix and
    /// keeping `self` as the unsent tail — used when a write is partial and
    /// the remainder must be retained for the next Write-ready cycle.
    pub fn split_sent(&mut self, at: usize) {
        self.data.drain(..at);
    }
}

/// A borrowed view into a receive buffer, valid only for the duration of the
/// receive callback. The application may not retain this slice past the
/// callback's return; unlike [`SendBuffer`] it is never owned by the
/// callback.
#[derive(Debug)]
pub struct RecvSlice<'a> {
    data: &'a [u8],
}

impl<'a> RecvSlice<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        RecvSlice { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-connection recv/send buffer allocation and release.
///
/// Buffers are plain heap allocations here — there is no shared arena to
/// manage. `BufferAllocator` exists as the single, explicit seam through
/// which every send buffer passed to `send_with_connection` must have
/// originated, so a future pooled/arena implementation can replace it
/// without touching `tcp`.
#[derive(Debug, Default)]
pub struct BufferAllocator;

impl BufferAllocator {
    pub fn new() -> Self {
        BufferAllocator
    }

    /// Allocates a send buffer by copying `data`. The caller owns the result
    /// until it is passed to `sendWithConnection`.
    pub fn alloc(&self, data: &[u8]) -> SendBuffer {
        SendBuffer {
            data: data.to_vec(),
        }
    }

    /// Allocates a zeroed receive scratch buffer of `size` bytes.
    pub fn alloc_recv_scratch(&self, size: usize) -> Vec<u8> {
        vec![0u8; size]
    }
}
