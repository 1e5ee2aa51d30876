//! The address-binding helper, and the connect-address-tuple parsing it
//! shares its no-name-resolution stance with.
//!
//! Both binding a fresh socket to `("any", 0)` and parsing a `connect`
//! target go through raw `sockaddr` construction and the OS's
//! string-to-address routine rather than a resolver — that's the entire
//! point of both.

use std::io;
use std::mem::size_of;
use std::ptr::null_mut;

use windows_sys::Win32::Networking::WinSock::{
    bind, sockaddr_in, sockaddr_in6, WSAStringToAddressW, AF_INET, AF_INET6, SOCKADDR,
    SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR,
};

use crate::error::{IocpError, Result};

/// Binds a freshly created socket to the wildcard address with port zero,
/// deciding the address family from the shape of the tuple the caller would
/// have passed: 2 fields selects IPv4, 4 selects IPv6. Any other length is
/// rejected before any syscall is issued.
pub fn bind_local(socket: SOCKET, tuple_len: usize) -> Result<()> {
    match tuple_len {
        2 => bind_v4(socket),
        4 => bind_v6(socket),
        other => Err(IocpError::BadAddressTuple(other)),
    }
}

fn bind_v4(socket: SOCKET) -> Result<()> {
    // Zeroed is exactly `INADDR_ANY` + port 0.
    let mut addr: sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = AF_INET as u16;
    let ret = unsafe { bind(socket, (&addr as *const sockaddr_in).cast(), size_of::<sockaddr_in>() as i32) };
    if ret == SOCKET_ERROR {
        return Err(IocpError::from_os(io::Error::last_os_error()));
    }
    Ok(())
}

fn bind_v6(socket: SOCKET) -> Result<()> {
    // Zeroed is exactly `in6addr_any` + port 0 + flowinfo 0 + scope 0.
    let mut addr: sockaddr_in6 = unsafe { std::mem::zeroed() };
    addr.sin6_family = AF_INET6 as u16;
    let ret = unsafe { bind(socket, (&addr as *const sockaddr_in6).cast(), size_of::<sockaddr_in6>() as i32) };
    if ret == SOCKET_ERROR {
        return Err(IocpError::from_os(io::Error::last_os_error()));
    }
    Ok(())
}

/// A `connect` target, shaped after the two address forms this crate accepts.
/// The host is always a numeric literal — the OS's string-to-address
/// routine performs no name resolution, and neither do we.
#[derive(Debug, Clone)]
pub enum ConnectAddr {
    /// `(host, port)`.
    V4 { host: String, port: u16 },
    /// `(host, port, flow_info, scope_id)`.
    V6 {
        host: String,
        port: u16,
        flow_info: u32,
        scope_id: u32,
    },
}

/// A parsed `sockaddr` ready to hand to `ConnectEx`, owning the storage the
/// pointer points into.
pub(crate) struct SockAddrBuf {
    storage: SOCKADDR_STORAGE,
    len: i32,
}

impl SockAddrBuf {
    pub(crate) fn as_ptr(&self) -> *const SOCKADDR {
        (&self.storage as *const SOCKADDR_STORAGE).cast()
    }

    pub(crate) fn len(&self) -> i32 {
        self.len
    }
}

impl ConnectAddr {
    pub(crate) fn to_sockaddr(&self) -> Result<SockAddrBuf> {
        match self {
            ConnectAddr::V4 { host, port } => parse(host, AF_INET as i32, |storage| {
                let sin: &mut sockaddr_in = unsafe { &mut *(storage as *mut SOCKADDR_STORAGE).cast() };
                sin.sin_port = port.to_be();
            }),
            ConnectAddr::V6 {
                host,
                port,
                flow_info,
                scope_id,
            } => parse(host, AF_INET6 as i32, |storage| {
                let sin6: &mut sockaddr_in6 = unsafe { &mut *(storage as *mut SOCKADDR_STORAGE).cast() };
                sin6.sin6_port = port.to_be();
                sin6.sin6_flowinfo = *flow_info;
                sin6.sin6_scope_id = *scope_id;
            }),
        }
    }
}

fn parse(host: &str, family: i32, fixup: impl FnOnce(&mut SOCKADDR_STORAGE)) -> Result<SockAddrBuf> {
    let mut wide: Vec<u16> = host.encode_utf16().chain(std::iter::once(0)).collect();
    let mut storage: SOCKADDR_STORAGE = unsafe { std::mem::zeroed() };
    let mut len: i32 = size_of::<SOCKADDR_STORAGE>() as i32;
    let ret = unsafe {
        WSAStringToAddressW(
            wide.as_mut_ptr(),
            family,
            null_mut(),
            (&mut storage as *mut SOCKADDR_STORAGE).cast(),
            &mut len,
        )
    };
    if ret == SOCKET_ERROR {
        let err = unsafe { windows_sys::Win32::Networking::WinSock::WSAGetLastError() };
        log::debug!("WSAStringToAddressW({host:?}) failed: {err}");
        return Err(IocpError::from_raw_os_error(err));
    }
    fixup(&mut storage);
    Ok(SockAddrBuf { storage, len })
}
