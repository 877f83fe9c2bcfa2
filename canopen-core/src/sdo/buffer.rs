//! SDO request buffer: accumulates segmented/block transfer bytes before
//! they are handed to the dictionary or the peer.

use crate::abort::AbortCode;

/// Accumulates bytes across a segmented or block SDO transfer.
#[derive(Debug, Default)]
pub struct TransferBuffer {
    data: Vec<u8>,
    announced_size: Option<u32>,
}

impl TransferBuffer {
    pub fn new() -> Self {
        TransferBuffer::default()
    }

    /// Start a new transfer, optionally announcing the total size up
    /// front (segmented/block-mode `s` bit).
    pub fn begin(&mut self, announced_size: Option<u32>) {
        self.data.clear();
        self.announced_size = announced_size;
    }

    /// Append one segment's worth of bytes.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), AbortCode> {
        if let Some(size) = self.announced_size {
            if self.data.len() + bytes.len() > size as usize {
                return Err(AbortCode::NoMem);
            }
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Finalize the transfer, returning the assembled bytes. Fails if an
    /// announced size was given and the accumulated length doesn't match.
    pub fn finalize(&mut self) -> Result<Vec<u8>, AbortCode> {
        if let Some(size) = self.announced_size {
            if self.data.len() != size as usize {
                return Err(AbortCode::TypeLen);
            }
        }
        Ok(std::mem::take(&mut self.data))
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.announced_size = None;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_returns_accumulated_bytes() {
        let mut buf = TransferBuffer::new();
        buf.begin(None);
        buf.append(&[1, 2, 3]).unwrap();
        buf.append(&[4, 5]).unwrap();
        assert_eq!(buf.finalize().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn finalize_rejects_size_mismatch() {
        let mut buf = TransferBuffer::new();
        buf.begin(Some(10));
        buf.append(&[1, 2, 3]).unwrap();
        assert_eq!(buf.finalize().unwrap_err(), AbortCode::TypeLen);
    }

    #[test]
    fn append_rejects_overrunning_announced_size() {
        let mut buf = TransferBuffer::new();
        buf.begin(Some(2));
        assert_eq!(buf.append(&[1, 2, 3]).unwrap_err(), AbortCode::NoMem);
    }

    #[test]
    fn reset_clears_state() {
        let mut buf = TransferBuffer::new();
        buf.begin(Some(3));
        buf.append(&[1, 2, 3]).unwrap();
        buf.reset();
        buf.begin(None);
        assert_eq!(buf.finalize().unwrap(), Vec::<u8>::new());
    }
}
