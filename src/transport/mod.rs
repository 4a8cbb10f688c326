//! Byte-stream transport abstraction for the serial connector

use crate::error::Result;

mod memory;
mod serial;

pub use memory::{MemoryTransport, MemoryTransportHandle};
pub use serial::SerialTransport;

/// Transport trait for raw byte-stream links
pub trait Transport: Send {
    /// Read data into buffer, returns number of bytes read (0 on timeout)
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write data from buffer, returns number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Flush any pending writes (blocking until complete)
    fn flush(&mut self) -> Result<()>;

    /// Check if data is available to read
    fn available(&mut self) -> Result<usize> {
        Ok(0) // Default implementation
    }

    /// Write the whole buffer, retrying partial writes
    fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(data)?;
            if n == 0 {
                return Err(crate::error::Error::WriteFailed(
                    "transport accepted zero bytes".to_string(),
                ));
            }
            data = &data[n..];
        }
        Ok(())
    }
}
