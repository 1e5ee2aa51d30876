//! Shared helpers for the integration tests: a named-pipe pair for the
//! read/write/cancel scenarios, and overlapped-capable sockets for the
//! accept/connect scenarios.

use std::io::Write;
use std::os::windows::io::AsRawSocket;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, OPEN_EXISTING,
};
use windows_sys::Win32::System::Pipes::{CreateNamedPipeW, PIPE_ACCESS_DUPLEX, PIPE_TYPE_BYTE, PIPE_WAIT};
use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_OVERLAPPED;

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Creates a duplex named pipe: the server end is overlapped (suitable for
/// registering on a completion port), the client end is a plain synchronous
/// handle a test can `write`/`read` through directly.
pub fn create_pipe_pair(name: &str) -> (HANDLE, std::fs::File) {
    let path = format!(r"\\.\pipe\wincp-test-{name}-{:?}", std::thread::current().id());
    let wide_path = wide(&path);
    let server = unsafe {
        CreateNamedPipeW(
            wide_path.as_ptr(),
            PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED,
            PIPE_TYPE_BYTE | PIPE_WAIT,
            1,
            4096,
            4096,
            0,
            ptr::null(),
        )
    };
    assert!(!server.is_null(), "CreateNamedPipeW failed: {}", std::io::Error::last_os_error());

    let client_handle = unsafe {
        CreateFileW(
            wide_path.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            0,
            ptr::null(),
            OPEN_EXISTING,
            0,
            ptr::null_mut(),
        )
    };
    assert!(
        client_handle != windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE,
        "CreateFileW failed: {}",
        std::io::Error::last_os_error()
    );
    let client = unsafe { <std::fs::File as std::os::windows::io::FromRawHandle>::from_raw_handle(client_handle as _) };
    (server, client)
}

/// Closes a raw handle opened with the Win32 API directly (our pipe server
/// ends aren't wrapped in an owning Rust type).
pub fn close_handle(handle: HANDLE) {
    unsafe {
        CloseHandle(handle);
    }
}

/// Writes `bytes` synchronously through a plain `std::fs::File` handle.
pub fn write_all(file: &mut std::fs::File, bytes: &[u8]) {
    file.write_all(bytes).expect("write to pipe client end");
}

/// Creates an overlapped-capable TCP socket of the given family, unbound
/// and unconnected.
pub fn new_tcp_socket(domain: socket2::Domain) -> socket2::Socket {
    socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .expect("create overlapped tcp socket")
}

pub fn raw_socket(socket: &socket2::Socket) -> windows_sys::Win32::Networking::WinSock::SOCKET {
    socket.as_raw_socket() as windows_sys::Win32::Networking::WinSock::SOCKET
}
