//! Small helpers shared by the rest of the crate.

use crate::error::{IocpError, Result};

/// `write-file`/`send-socket` buffers are handed to the OS as a 32-bit
/// length; reject anything that would truncate silently before any syscall
/// is issued.
pub(crate) fn checked_len(buf: &[u8]) -> Result<u32> {
    u32::try_from(buf.len()).map_err(|_| IocpError::BufferTooLarge(buf.len()))
}
