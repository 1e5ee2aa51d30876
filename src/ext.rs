//! Lazily-resolved Winsock extension function pointers (`AcceptEx`,
//! `ConnectEx`, `DisconnectEx`).
//!
//! These routines have no fixed entry point; a process obtains them per
//! socket via `WSAIoctl(SIO_GET_EXTENSION_FUNCTION_POINTER, ...)`. The
//! resolved pointer is the same for every socket of a given address family
//! for the life of the process, so each is resolved once, on first use, and
//! cached — there is no fixed "subsystem startup" moment in a library crate.

use std::io;
use std::mem::MaybeUninit;
use std::ptr::null_mut;
use std::sync::OnceLock;

use windows_sys::core::GUID;
use windows_sys::Win32::Networking::WinSock::{
    WSAIoctl, LPFN_ACCEPTEX, LPFN_CONNECTEX, LPFN_DISCONNECTEX, SIO_GET_EXTENSION_FUNCTION_POINTER,
    SOCKET, WSAID_ACCEPTEX, WSAID_CONNECTEX, WSAID_DISCONNECTEX,
};

use crate::error::{IocpError, Result};

static ACCEPT_EX: OnceLock<LPFN_ACCEPTEX> = OnceLock::new();
static CONNECT_EX: OnceLock<LPFN_CONNECTEX> = OnceLock::new();
static DISCONNECT_EX: OnceLock<LPFN_DISCONNECTEX> = OnceLock::new();

fn resolve<F: Copy>(socket: SOCKET, guid: GUID) -> Result<F> {
    let mut fptr: MaybeUninit<F> = MaybeUninit::uninit();
    let mut returned: u32 = 0;
    let ret = unsafe {
        WSAIoctl(
            socket,
            SIO_GET_EXTENSION_FUNCTION_POINTER,
            (&guid as *const GUID).cast(),
            std::mem::size_of::<GUID>() as u32,
            fptr.as_mut_ptr().cast(),
            std::mem::size_of::<F>() as u32,
            &mut returned,
            null_mut(),
            None,
        )
    };
    if ret == windows_sys::Win32::Networking::WinSock::SOCKET_ERROR {
        let err = unsafe { windows_sys::Win32::Networking::WinSock::WSAGetLastError() };
        log::debug!("WSAIoctl(SIO_GET_EXTENSION_FUNCTION_POINTER) failed: {err}");
        return Err(IocpError::from_raw_os_error(err));
    }
    Ok(unsafe { fptr.assume_init() })
}

/// Returns the process-wide `AcceptEx` pointer, resolving it against
/// `socket` the first time it is needed.
pub(crate) fn accept_ex(socket: SOCKET) -> Result<LPFN_ACCEPTEX> {
    if let Some(f) = ACCEPT_EX.get() {
        return Ok(*f);
    }
    let f = resolve::<LPFN_ACCEPTEX>(socket, WSAID_ACCEPTEX)?;
    Ok(*ACCEPT_EX.get_or_init(|| f))
}

/// Returns the process-wide `ConnectEx` pointer, resolving it against
/// `socket` the first time it is needed.
pub(crate) fn connect_ex(socket: SOCKET) -> Result<LPFN_CONNECTEX> {
    if let Some(f) = CONNECT_EX.get() {
        return Ok(*f);
    }
    let f = resolve::<LPFN_CONNECTEX>(socket, WSAID_CONNECTEX)?;
    Ok(*CONNECT_EX.get_or_init(|| f))
}

/// Returns the process-wide `DisconnectEx` pointer, resolving it against
/// `socket` the first time it is needed.
pub(crate) fn disconnect_ex(socket: SOCKET) -> Result<LPFN_DISCONNECTEX> {
    if let Some(f) = DISCONNECT_EX.get() {
        return Ok(*f);
    }
    let f = resolve::<LPFN_DISCONNECTEX>(socket, WSAID_DISCONNECTEX)?;
    Ok(*DISCONNECT_EX.get_or_init(|| f))
}

/// Calls `setsockopt(SO_UPDATE_ACCEPT_CONTEXT)` on a socket handed to
/// `AcceptEx`, without which the accepted socket can't use `getsockname`,
/// `getpeername`, or most other socket options.
pub(crate) fn update_accept_context(listen_socket: SOCKET, accepted: SOCKET) -> Result<()> {
    use windows_sys::Win32::Networking::WinSock::{setsockopt, SOL_SOCKET, SO_UPDATE_ACCEPT_CONTEXT};
    let ret = unsafe {
        setsockopt(
            accepted,
            SOL_SOCKET,
            SO_UPDATE_ACCEPT_CONTEXT,
            (&listen_socket as *const SOCKET).cast(),
            std::mem::size_of::<SOCKET>() as i32,
        )
    };
    if ret == windows_sys::Win32::Networking::WinSock::SOCKET_ERROR {
        return Err(IocpError::from_os(io::Error::last_os_error()));
    }
    Ok(())
}

/// Calls `setsockopt(SO_UPDATE_CONNECT_CONTEXT)` on a socket handed to
/// `ConnectEx`, without which the socket can't be used with `send`/`recv`.
pub(crate) fn update_connect_context(socket: SOCKET) -> Result<()> {
    use windows_sys::Win32::Networking::WinSock::{setsockopt, SOL_SOCKET, SO_UPDATE_CONNECT_CONTEXT};
    let ret = unsafe {
        setsockopt(socket, SOL_SOCKET, SO_UPDATE_CONNECT_CONTEXT, null_mut(), 0)
    };
    if ret == windows_sys::Win32::Networking::WinSock::SOCKET_ERROR {
        return Err(IocpError::from_os(io::Error::last_os_error()));
    }
    Ok(())
}
