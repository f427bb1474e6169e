//! Buffers handed to [`Endpoint::send`](crate::Endpoint::send) and [`Endpoint::recv`](crate::Endpoint::recv).
//!
//! A [`Buffer`] borrows caller memory for the duration of an operation. Before anything reaches the transport
//! engine it is validated and reduced to a [`BufferDesc`]: an address and a length, which is all the engine sees.

use crate::error::UcpError;
use std::ptr::NonNull;

/// Caller memory taking part in a transfer.
#[derive(Debug)]
pub enum Buffer<'a> {
    /// Read-only memory. Valid as a send source only.
    Shared(&'a [u8]),
    /// Writable memory. Valid as a send source or a receive destination.
    Exclusive(&'a mut [u8]),
}

impl<'a> Buffer<'a> {
    pub fn len(&self) -> usize {
        match self {
            Buffer::Shared(b) => b.len(),
            Buffer::Exclusive(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Buffer::Exclusive(_))
    }

    /// Describes the first `nbytes` (default: all) of this buffer as a send source.
    pub(crate) fn send_desc(&self, nbytes: Option<usize>) -> Result<BufferDesc, UcpError> {
        let nbytes = nbytes.unwrap_or(self.len());
        if self.len() < nbytes {
            return Err(UcpError::invalid_argument(format!(
                "Send buffer holds {} bytes but {nbytes} bytes were requested",
                self.len()
            )));
        }
        let ptr = match self {
            Buffer::Shared(b) => NonNull::from(&b[..]).cast::<u8>(),
            Buffer::Exclusive(b) => NonNull::from(&b[..]).cast::<u8>(),
        };
        Ok(BufferDesc { ptr, len: nbytes })
    }

    /// Describes the first `nbytes` (default: all) of this buffer as a receive destination.
    pub(crate) fn recv_desc(&mut self, nbytes: Option<usize>) -> Result<BufferDesc, UcpError> {
        let len = self.len();
        let nbytes = nbytes.unwrap_or(len);
        match self {
            Buffer::Shared(_) => Err(UcpError::invalid_argument("Receive buffer is read-only")),
            Buffer::Exclusive(_) if len < nbytes => Err(UcpError::invalid_argument(format!(
                "Receive buffer holds {len} bytes but {nbytes} bytes were requested"
            ))),
            Buffer::Exclusive(b) => Ok(BufferDesc { ptr: NonNull::from(&mut b[..]).cast::<u8>(), len: nbytes }),
        }
    }
}

impl<'a> From<&'a [u8]> for Buffer<'a> {
    fn from(b: &'a [u8]) -> Self {
        Buffer::Shared(b)
    }
}

impl<'a> From<&'a mut [u8]> for Buffer<'a> {
    fn from(b: &'a mut [u8]) -> Self {
        Buffer::Exclusive(b)
    }
}

impl<'a> From<&'a Vec<u8>> for Buffer<'a> {
    fn from(b: &'a Vec<u8>) -> Self {
        Buffer::Shared(b.as_slice())
    }
}

impl<'a> From<&'a mut Vec<u8>> for Buffer<'a> {
    fn from(b: &'a mut Vec<u8>) -> Self {
        Buffer::Exclusive(b.as_mut_slice())
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Buffer<'a> {
    fn from(b: &'a [u8; N]) -> Self {
        Buffer::Shared(b.as_slice())
    }
}

impl<'a, const N: usize> From<&'a mut [u8; N]> for Buffer<'a> {
    fn from(b: &'a mut [u8; N]) -> Self {
        Buffer::Exclusive(b.as_mut_slice())
    }
}

/// An addressable memory region, as seen by a transport engine.
///
/// The region is owned by the caller of the operation it was created for. It stays valid until that operation's
/// completion callback runs or the operation is cancelled with
/// [`TransportEngine::cancel`](crate::engine::TransportEngine::cancel).
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc {
    ptr: NonNull<u8>,
    len: usize,
}

impl BufferDesc {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Views the region as a byte slice.
    ///
    /// # Safety
    /// The operation this descriptor was submitted with must still be in flight.
    pub unsafe fn as_slice<'b>(&self) -> &'b [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Views the region as a writable byte slice.
    ///
    /// # Safety
    /// The descriptor must come from a receive submission whose operation is still in flight, and no other view of
    /// the region may be alive.
    pub unsafe fn as_mut_slice<'b>(&self) -> &'b mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}
