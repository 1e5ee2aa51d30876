//! The completion port: the process-wide-unique queue the OS deposits
//! finished overlapped I/O onto.

use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus, OVERLAPPED,
};

use crate::error::{IocpError, Result};

/// An OS-level I/O completion queue.
///
/// A process may hold many of these, but the usual shape is one per event
/// loop: handles (sockets, pipes, files) are registered with it, and the
/// loop drains it on a timed wait.
#[derive(Debug)]
pub struct CompletionPort {
    handle: HANDLE,
}

// The underlying handle is not thread-affine; `dequeue`/`post` take `&self`
// so independent threads may each block in their own call without a
// crate-level mutex serializing them.
unsafe impl Send for CompletionPort {}
unsafe impl Sync for CompletionPort {}

/// What `dequeue` observed: either a genuine completion, or a clean timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dequeued {
    /// A notification was dequeued. `error` is the OS error the operation
    /// completed with (`0` on success); it is *not* promoted into `Err`
    /// here, because a non-zero `error` is still a completion, not a
    /// dequeue failure.
    Complete {
        /// The OS error the originating operation completed with, or `0`.
        error: u32,
        /// Bytes transferred, as reported by the completion packet.
        bytes: u32,
        /// The application-chosen key supplied at registration (or `post`).
        key: usize,
        /// The stable address of the originating [`crate::Overlapped`],
        /// i.e. the same value its `address` accessor returns.
        overlapped: *mut OVERLAPPED,
    },
    /// No completion arrived within the requested timeout.
    Timeout,
}

impl CompletionPort {
    /// Creates a brand new completion port with the given concurrency hint.
    pub fn create(concurrency: u32) -> Result<Self> {
        Self::create_or_associate(INVALID_HANDLE_VALUE, None, 0, concurrency)
    }

    /// Associates `file_handle` with `existing` under `key`; if `existing`
    /// is `None`, creates a new port instead (`file_handle` and `key` are
    /// then ignored by the OS, matching `CreateIoCompletionPort`'s own
    /// overload).
    ///
    /// Re-associating a handle with the port it is already registered on
    /// (by calling this again with the same `existing`) is a documented
    /// no-op: it returns the same port handle.
    pub fn create_or_associate(
        file_handle: HANDLE,
        existing: Option<&CompletionPort>,
        key: usize,
        concurrency: u32,
    ) -> Result<Self> {
        let existing_handle = existing.map_or(ptr::null_mut(), |p| p.handle);
        let port = unsafe {
            CreateIoCompletionPort(file_handle, existing_handle, key, concurrency)
        };
        if port.is_null() {
            let err = io::Error::last_os_error();
            log::debug!("CreateIoCompletionPort failed: {err}");
            return Err(IocpError::from_os(err));
        }
        log::trace!("completion port ready, handle={port:?}, key={key}");
        Ok(CompletionPort { handle: port })
    }

    /// Blocks up to `timeout_ms` milliseconds for a completion.
    ///
    /// The distinguishing rule for timeout vs. error: the OS returns a null
    /// overlapped pointer together with `WAIT_TIMEOUT`. Any other null
    /// pointer result is an error; any non-null pointer is a completion,
    /// even one whose `error` field is non-zero.
    pub fn dequeue(&self, timeout_ms: u32) -> Result<Dequeued> {
        let mut bytes: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(self.handle, &mut bytes, &mut key, &mut overlapped, timeout_ms)
        };
        if overlapped.is_null() {
            let err = unsafe { windows_sys::Win32::Foundation::GetLastError() };
            if ok == 0 && err == WAIT_TIMEOUT {
                return Ok(Dequeued::Timeout);
            }
            let io_err = io::Error::from_raw_os_error(err as i32);
            log::debug!("GetQueuedCompletionStatus failed: {io_err}");
            return Err(IocpError::from_os(io_err));
        }
        let error = if ok == 0 {
            unsafe { windows_sys::Win32::Foundation::GetLastError() }
        } else {
            0
        };
        Ok(Dequeued::Complete { error, bytes, key, overlapped })
    }

    /// Enqueues a synthetic completion, e.g. to wake a loop blocked in
    /// `dequeue` from another thread.
    pub fn post(&self, bytes: u32, key: usize, overlapped: *mut OVERLAPPED) -> Result<()> {
        let ok = unsafe { PostQueuedCompletionStatus(self.handle, bytes, key, overlapped) };
        if ok == 0 {
            let err = io::Error::last_os_error();
            log::debug!("PostQueuedCompletionStatus failed: {err}");
            return Err(IocpError::from_os(err));
        }
        Ok(())
    }

    /// The raw port handle, for registering handles created outside this
    /// crate (`CreateIoCompletionPort(handle, self.as_raw_handle(), ...)`).
    pub fn as_raw_handle(&self) -> HANDLE {
        self.handle
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
        }
    }
}
