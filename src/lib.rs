//! Windows I/O completion ports, without a runtime wrapped around them.
//!
//! An overlapped I/O call (`ReadFile`, `WSASend`, `AcceptEx`, ...) hands the
//! kernel a pointer into user memory — an `OVERLAPPED` control block, and
//! for read-style calls, a buffer — and returns immediately. The kernel
//! keeps both pointers live until the operation finishes, at which point it
//! deposits a completion packet on an I/O completion port, identified by
//! the very same `OVERLAPPED` address. Nothing about this model is
//! readiness-based: there is no "this handle is now readable" notification
//! to re-arm, only "this specific request finished".
//!
//! This crate is the two halves of that model and nothing else:
//!
//! - [`CompletionPort`] wraps the OS queue — create it, associate handles
//!   with it, block on it for a timeout, or post a synthetic wakeup.
//! - [`Overlapped`] wraps one request — a heap-pinned object holding the
//!   `OVERLAPPED` block, submitted via one of its verbs (`read_file`,
//!   `write_file`, `recv_socket`, `send_socket`, `accept`, `connect`,
//!   `disconnect`), then resolved with [`Overlapped::getresult`].
//!
//! [`bind_local`] rounds things out with the one piece of socket setup
//! `ConnectEx` requires ahead of time: the socket must already be bound.
//!
//! # Safety discipline
//!
//! Because the kernel holds raw pointers into an [`Overlapped`] and its
//! buffers for as long as a request is outstanding, the object's address
//! must never move (it is always `Pin<Box<_>>`-backed) and its buffers must
//! never be freed early. [`Overlapped::write_file`]/[`Overlapped::send_socket`]
//! borrow their buffer for the `Overlapped`'s own lifetime, so the borrow
//! checker rejects a buffer that doesn't outlive the operation. Read-style
//! buffers are owned by the `Overlapped` itself. The one case the type
//! system can't express is "the kernel is still mid-write when this object
//! is dropped" — [`Overlapped`]'s destructor handles that by cancelling and
//! then blocking on completion before it frees anything; see its
//! documentation for the (rare) case where it leaks instead of freeing.
//!
//! This crate does not run an event loop, schedule tasks, or resolve host
//! names — it is the primitive a runtime is built on top of, not the
//! runtime.

#![cfg(windows)]
#![warn(missing_docs)]

mod bind;
mod error;
mod ext;
mod overlapped;
mod port;
mod raw;

pub use bind::{bind_local, ConnectAddr};
pub use error::{IocpError, Result};
pub use overlapped::{Kind, Overlapped, Value};
pub use port::{CompletionPort, Dequeued};

/// Constants callers commonly need alongside this crate's API, re-exported
/// so they don't have to add `windows-sys` themselves just to pass
/// `INFINITE` to [`CompletionPort::dequeue`] or check an error code.
pub mod consts {
    pub use windows_sys::Win32::Foundation::{ERROR_IO_PENDING, INVALID_HANDLE_VALUE};
    pub use windows_sys::Win32::Networking::WinSock::{
        SO_UPDATE_ACCEPT_CONTEXT, SO_UPDATE_CONNECT_CONTEXT, TF_REUSE_SOCKET,
    };
    pub use windows_sys::Win32::Storage::FileSystem::FILE_SKIP_COMPLETION_PORT_ON_SUCCESS;
    pub use windows_sys::Win32::System::Threading::INFINITE;
}
