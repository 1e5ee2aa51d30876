//! The overlapped operation: a heap-pinned object pairing a kernel
//! `OVERLAPPED` control block with the metadata needed to interpret its
//! completion.
//!
//! This is the load-bearing type of the crate. Its invariants are strict
//! because the kernel holds raw pointers into it (and into its buffers) for
//! as long as an operation is pending — see the module-level safety notes
//! in [`crate`] for why the destructor blocks.

use std::cell::UnsafeCell;
use std::fmt;
use std::io;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr;
use std::sync::Mutex;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, BOOL, ERROR_BROKEN_PIPE, ERROR_IO_INCOMPLETE, ERROR_IO_PENDING,
    ERROR_MORE_DATA, ERROR_NOT_FOUND, ERROR_OPERATION_ABORTED, ERROR_PIPE_NOT_CONNECTED, HANDLE,
};
use windows_sys::Win32::Networking::WinSock::{
    WSARecv, WSASend, SOCKADDR_STORAGE, SOCKET, WSABUF,
};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows_sys::Win32::System::Threading::CreateEventW;

use crate::bind::ConnectAddr;
use crate::error::{IocpError, Result};
use crate::ext;
use crate::raw::checked_len;

/// Size of the per-address buffer `AcceptEx` wants: a `sockaddr_in6` plus 16
/// bytes of slack, doubled for local + remote.
const ACCEPT_ADDR_LEN: usize = std::mem::size_of::<SOCKADDR_STORAGE>() + 16;
const ACCEPT_BUF_LEN: usize = ACCEPT_ADDR_LEN * 2;

/// What kind of request an [`Overlapped`] was last submitted as, and thus
/// how to interpret its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Nothing has been submitted yet.
    None,
    /// A submission verb's start call failed synchronously; the object may
    /// not be resubmitted.
    NotStarted,
    /// `read_file` or `recv_socket`.
    Read,
    /// `write_file` or `send_socket`.
    Write,
    /// `accept`.
    Accept,
    /// `connect`.
    Connect,
    /// `disconnect`.
    Disconnect,
}

/// The value a successful [`Overlapped::getresult`] yields, shaped by
/// [`Kind`].
#[derive(Debug)]
pub enum Value {
    /// Read-style result: the owned read buffer, truncated to exactly the
    /// bytes transferred (for `accept`, the raw two-address buffer
    /// `AcceptEx` filled in).
    Bytes(Vec<u8>),
    /// Write-style result: the number of bytes transferred.
    Transferred(u32),
    /// `connect` / `disconnect`: nothing to report beyond success.
    Unit,
}

struct State<'buf> {
    kind: Kind,
    handle: HANDLE,
    last_error: u32,
    read_buf: Option<Vec<u8>>,
    write_buf: Option<&'buf [u8]>,
    accept_socket: Option<SOCKET>,
}

struct Inner<'buf> {
    raw: UnsafeCell<OVERLAPPED>,
    event: HANDLE,
    owns_event: bool,
    state: Mutex<State<'buf>>,
    _pin: PhantomPinned,
}

// `Inner` is reached only through `state`'s mutex (or, for `raw`, only
// while the mutex-guarded kind says no one else is touching it), so it's
// sound to move the whole `Overlapped` between threads and to call its
// methods from more than one.
unsafe impl Send for Inner<'_> {}
unsafe impl Sync for Inner<'_> {}

/// A single in-flight (or just-finished) asynchronous I/O request.
///
/// Heap-allocated and pinned: the kernel is handed this object's address at
/// submission time and that address must never change for as long as the
/// request can still be pending. `'buf` ties a `write_file`/`send_socket`
/// borrow to the lifetime of the `Overlapped` itself, so the borrow checker
/// — not a runtime check — enforces that the caller's buffer outlives the
/// operation.
pub struct Overlapped<'buf> {
    inner: Pin<Box<Inner<'buf>>>,
}

impl fmt::Debug for Overlapped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Overlapped")
            .field("kind", &state.kind)
            .field("address", &self.address())
            .finish()
    }
}

impl<'buf> Overlapped<'buf> {
    /// Creates a new operation in `Kind::None`, allocating its own
    /// auto-created manual-reset event.
    pub fn new() -> Result<Self> {
        Self::with_event(None)
    }

    /// Creates a new operation using a caller-supplied event handle rather
    /// than allocating one; the caller remains responsible for closing it.
    pub fn with_event(event: Option<HANDLE>) -> Result<Self> {
        let (event, owns_event) = match event {
            Some(h) => (h, false),
            None => {
                let h = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
                if h.is_null() {
                    return Err(IocpError::from_os(io::Error::last_os_error()));
                }
                (h, true)
            }
        };
        let mut raw: OVERLAPPED = unsafe { std::mem::zeroed() };
        raw.hEvent = event;
        let inner = Box::pin(Inner {
            raw: UnsafeCell::new(raw),
            event,
            owns_event,
            state: Mutex::new(State {
                kind: Kind::None,
                handle: ptr::null_mut(),
                last_error: 0,
                read_buf: None,
                write_buf: None,
                accept_socket: None,
            }),
            _pin: PhantomPinned,
        });
        Ok(Overlapped { inner })
    }

    fn raw_ptr(&self) -> *mut OVERLAPPED {
        self.inner.raw.get()
    }

    /// The stable address of the native control block — the same value the
    /// completion port hands back in [`crate::Dequeued::Complete::overlapped`].
    pub fn address(&self) -> usize {
        self.raw_ptr() as usize
    }

    /// The last OS error code observed at start or completion (`0` on
    /// success-equivalent codes).
    pub fn error(&self) -> u32 {
        self.inner.state.lock().unwrap().last_error
    }

    /// True iff the operation is live (`kind` is not `none`/`not-started`)
    /// and the OS has not yet reported completion.
    pub fn pending(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        if matches!(state.kind, Kind::None | Kind::NotStarted) {
            return false;
        }
        let mut transferred: u32 = 0;
        let ok = unsafe {
            GetOverlappedResult(state.handle, self.raw_ptr(), &mut transferred, 0)
        };
        if ok != 0 {
            return false;
        }
        unsafe { GetLastError() == ERROR_IO_INCOMPLETE }
    }

    /// Begins a submission: checks the one-shot invariant and records
    /// `handle`/`kind` under the lock.
    fn begin(&self, handle: HANDLE, kind: Kind) -> Result<std::sync::MutexGuard<'_, State<'buf>>> {
        let mut state = self.inner.state.lock().unwrap();
        if !matches!(state.kind, Kind::None) {
            return Err(IocpError::AlreadyAttempted);
        }
        state.handle = handle;
        state.kind = kind;
        Ok(state)
    }

    /// Interprets a start call's win32-style `BOOL` return (`ok`) per the
    /// submission-verb table: success/pending retain `kind`; "more data" on
    /// a read verb is a success; broken pipe on a read verb downgrades to
    /// `not-started` without surfacing an error (end-of-stream); anything
    /// else downgrades to `not-started` and surfaces.
    fn finish_start(&self, state: &mut State<'buf>, ok: bool, is_read: bool) -> Result<()> {
        if ok {
            state.last_error = 0;
            return Ok(());
        }
        let err = unsafe { GetLastError() };
        match err {
            ERROR_IO_PENDING => {
                state.last_error = err;
                Ok(())
            }
            ERROR_MORE_DATA if is_read => {
                state.last_error = err;
                Ok(())
            }
            ERROR_BROKEN_PIPE | ERROR_PIPE_NOT_CONNECTED if is_read => {
                state.kind = Kind::NotStarted;
                state.last_error = err;
                log::debug!("read saw broken pipe at start, treating as end-of-stream");
                Ok(())
            }
            _ => {
                state.kind = Kind::NotStarted;
                state.last_error = err;
                let io_err = io::Error::from_raw_os_error(err as i32);
                log::debug!("overlapped start failed: {io_err}");
                Err(IocpError::from_os(io_err))
            }
        }
    }

    /// Reads up to `max_size` bytes from `handle`, allocating an owned
    /// buffer (at least one byte, so a zero-size read still has a valid OS
    /// receive address).
    pub fn read_file(&self, handle: HANDLE, max_size: usize) -> Result<()> {
        let mut state = self.begin(handle, Kind::Read)?;
        let len = max_size.max(1);
        let mut buf = vec![0u8; len];
        let mut transferred: u32 = 0;
        log::trace!("ReadFile handle={handle:?} len={len}");
        let ok = unsafe {
            ReadFile(handle, buf.as_mut_ptr(), max_size as u32, &mut transferred, self.raw_ptr())
        } != 0;
        state.read_buf = Some(buf);
        self.finish_start(&mut state, ok, true)
    }

    /// Receives up to `max_size` bytes from `socket`, same buffer treatment
    /// as [`Overlapped::read_file`].
    pub fn recv_socket(&self, socket: SOCKET, max_size: usize, flags: u32) -> Result<()> {
        let mut state = self.begin(socket as HANDLE, Kind::Read)?;
        let len = max_size.max(1);
        let mut buf = vec![0u8; len];
        let mut wsabuf = WSABUF { len: max_size as u32, buf: buf.as_mut_ptr() };
        let mut received: u32 = 0;
        let mut out_flags = flags;
        log::trace!("WSARecv socket={socket} len={len}");
        let ok = unsafe {
            WSARecv(socket, &wsabuf, 1, &mut received, &mut out_flags, self.raw_ptr(), None)
        } == 0;
        state.read_buf = Some(buf);
        self.finish_start(&mut state, ok, true)
    }

    /// Writes `bytes` to `handle`. The borrow must outlive this operation;
    /// the borrow checker enforces that via `'buf`.
    pub fn write_file(&self, handle: HANDLE, bytes: &'buf [u8]) -> Result<()> {
        let len = checked_len(bytes)?;
        let mut state = self.begin(handle, Kind::Write)?;
        state.write_buf = Some(bytes);
        let mut transferred: u32 = 0;
        log::trace!("WriteFile handle={handle:?} len={len}");
        let ok = unsafe {
            WriteFile(handle, bytes.as_ptr(), len, &mut transferred, self.raw_ptr())
        } != 0;
        self.finish_start(&mut state, ok, false)
    }

    /// Sends `bytes` over `socket`, same borrow treatment as
    /// [`Overlapped::write_file`].
    pub fn send_socket(&self, socket: SOCKET, bytes: &'buf [u8], flags: u32) -> Result<()> {
        let len = checked_len(bytes)?;
        let mut state = self.begin(socket as HANDLE, Kind::Write)?;
        state.write_buf = Some(bytes);
        let wsabuf = WSABUF { len, buf: bytes.as_ptr() as *mut u8 };
        let mut sent: u32 = 0;
        log::trace!("WSASend socket={socket} len={len}");
        let ok = unsafe {
            WSASend(socket, &wsabuf, 1, &mut sent, flags, self.raw_ptr(), None)
        } == 0;
        self.finish_start(&mut state, ok, false)
    }

    /// Accepts a connection on `listen_socket` into the pre-created
    /// `accept_socket`, via `AcceptEx`. The completion buffer holds both
    /// endpoint addresses in the format `GetAcceptExSockaddrs` expects.
    pub fn accept(&self, listen_socket: SOCKET, accept_socket: SOCKET) -> Result<()> {
        let mut state = self.begin(listen_socket as HANDLE, Kind::Accept)?;
        let accept_ex = match ext::accept_ex(listen_socket).and_then(|f| {
            f.ok_or_else(|| IocpError::Os(io::Error::new(io::ErrorKind::Unsupported, "AcceptEx unavailable")))
        }) {
            Ok(f) => f,
            Err(e) => {
                state.kind = Kind::NotStarted;
                return Err(e);
            }
        };
        let mut buf = vec![0u8; ACCEPT_BUF_LEN];
        let mut received: u32 = 0;
        log::trace!("AcceptEx listen={listen_socket} accept={accept_socket}");
        let ok = unsafe {
            accept_ex(
                listen_socket,
                accept_socket,
                buf.as_mut_ptr().cast(),
                0,
                ACCEPT_ADDR_LEN as u32,
                ACCEPT_ADDR_LEN as u32,
                &mut received,
                self.raw_ptr(),
            )
        } != 0;
        state.read_buf = Some(buf);
        state.accept_socket = Some(accept_socket);
        self.finish_start(&mut state, ok, false)
    }

    /// Connects `socket` (already bound via [`crate::bind_local`]) to
    /// `addr`, via `ConnectEx`. `addr`'s host must be numeric: no name
    /// resolution is performed.
    pub fn connect(&self, socket: SOCKET, addr: &ConnectAddr) -> Result<()> {
        let mut state = self.begin(socket as HANDLE, Kind::Connect)?;
        let connect_ex = match ext::connect_ex(socket).and_then(|f| {
            f.ok_or_else(|| IocpError::Os(io::Error::new(io::ErrorKind::Unsupported, "ConnectEx unavailable")))
        }) {
            Ok(f) => f,
            Err(e) => {
                state.kind = Kind::NotStarted;
                return Err(e);
            }
        };
        let sockaddr = match addr.to_sockaddr() {
            Ok(s) => s,
            Err(e) => {
                state.kind = Kind::NotStarted;
                return Err(e);
            }
        };
        let mut sent: u32 = 0;
        log::trace!("ConnectEx socket={socket}");
        let ok = unsafe {
            connect_ex(
                socket,
                sockaddr.as_ptr(),
                sockaddr.len(),
                ptr::null(),
                0,
                &mut sent,
                self.raw_ptr(),
            )
        } != 0;
        self.finish_start(&mut state, ok, false)
    }

    /// Disconnects `socket` via `DisconnectEx`; pass
    /// [`crate::consts::TF_REUSE_SOCKET`] in `flags` to make the socket
    /// reusable for a subsequent `AcceptEx`/`ConnectEx`.
    pub fn disconnect(&self, socket: SOCKET, flags: u32) -> Result<()> {
        let mut state = self.begin(socket as HANDLE, Kind::Disconnect)?;
        let disconnect_ex = match ext::disconnect_ex(socket).and_then(|f| {
            f.ok_or_else(|| IocpError::Os(io::Error::new(io::ErrorKind::Unsupported, "DisconnectEx unavailable")))
        }) {
            Ok(f) => f,
            Err(e) => {
                state.kind = Kind::NotStarted;
                return Err(e);
            }
        };
        log::trace!("DisconnectEx socket={socket}");
        let ok = unsafe { disconnect_ex(socket, self.raw_ptr(), flags, 0) } != 0;
        self.finish_start(&mut state, ok, false)
    }

    /// Returns the operation's result, blocking until completion if `wait`
    /// is true and the operation is still pending.
    pub fn getresult(&self, wait: bool) -> Result<Value> {
        let mut state = self.inner.state.lock().unwrap();
        match state.kind {
            Kind::None => return Err(IocpError::NotAttempted),
            Kind::NotStarted => return Err(IocpError::NotStarted),
            _ => {}
        }

        let mut transferred: u32 = 0;
        let ok = unsafe {
            GetOverlappedResult(state.handle, self.raw_ptr(), &mut transferred, wait as BOOL)
        } != 0;
        let err = if ok { 0 } else { unsafe { GetLastError() } };
        state.last_error = err;

        let is_read = matches!(state.kind, Kind::Read);
        match err {
            0 | ERROR_MORE_DATA => {}
            ERROR_BROKEN_PIPE | ERROR_PIPE_NOT_CONNECTED if is_read => {
                transferred = 0;
            }
            _ => {
                let io_err = io::Error::from_raw_os_error(err as i32);
                log::debug!("getresult observed error: {io_err}");
                return Err(IocpError::from_os(io_err));
            }
        }

        let value = match state.kind {
            Kind::Read => {
                let mut buf = state.read_buf.take().expect("read op without a read buffer");
                buf.truncate(transferred as usize);
                Value::Bytes(buf)
            }
            Kind::Accept => {
                let buf = state.read_buf.take().expect("accept op without an address buffer");
                if let Some(accept_socket) = state.accept_socket {
                    ext::update_accept_context(state.handle as SOCKET, accept_socket)?;
                }
                Value::Bytes(buf)
            }
            Kind::Write => Value::Transferred(transferred),
            Kind::Connect => {
                ext::update_connect_context(state.handle as SOCKET)?;
                Value::Unit
            }
            Kind::Disconnect => Value::Unit,
            Kind::None | Kind::NotStarted => unreachable!("checked above"),
        };
        Ok(value)
    }

    /// Requests OS-level cancellation. Never blocks; a no-op if the
    /// operation never started or the OS reports it already completed.
    /// Completion — success, abort, or not-found — still arrives through
    /// the completion port.
    pub fn cancel(&self) -> Result<()> {
        let handle = {
            let state = self.inner.state.lock().unwrap();
            if matches!(state.kind, Kind::NotStarted) {
                return Ok(());
            }
            state.handle
        };
        let ok = unsafe { CancelIoEx(handle, self.raw_ptr()) } != 0;
        if !ok {
            let err = unsafe { GetLastError() };
            if err == ERROR_NOT_FOUND {
                return Ok(());
            }
            return Err(IocpError::from_raw_os_error(err as i32));
        }
        Ok(())
    }
}

impl Drop for Overlapped<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        if !matches!(state.kind, Kind::None | Kind::NotStarted) {
            let _ = unsafe { CancelIoEx(state.handle, self.raw_ptr()) };
            let mut transferred: u32 = 0;
            let ok = unsafe {
                GetOverlappedResult(state.handle, self.raw_ptr(), &mut transferred, true as BOOL)
            } != 0;
            let err = if ok { 0 } else { unsafe { GetLastError() } };
            match err {
                0 | ERROR_OPERATION_ABORTED | ERROR_NOT_FOUND => {
                    log::trace!("overlapped dropped with pending op settled, err={err}");
                }
                other => {
                    // The kernel's view of this operation did not end in an
                    // acceptable terminal state. Freeing the buffers below
                    // would be a use-after-free if the kernel is still
                    // writing into them, so leak them instead of dropping:
                    // a leaked allocation is recoverable, a crashed process
                    // is not.
                    log::warn!(
                        "overlapped dropped in unexpected terminal state {other}; \
                         leaking its buffers rather than risk a use-after-free"
                    );
                    if let Some(buf) = state.read_buf.take() {
                        std::mem::forget(buf);
                    }
                    state.write_buf = None;
                }
            }
        }
        if self.inner.owns_event && !self.inner.event.is_null() {
            unsafe { CloseHandle(self.inner.event) };
        }
    }
}
