//! Platform-specific socket and AWDL plumbing.
//!
//! Everything non-portable lives here so the rest of the responder compiles
//! unchanged on Linux and macOS.

use socket2::Socket;
use tracing::debug;

/// Opt a socket into receiving on restricted interfaces such as `awdl0`.
///
/// On macOS this sets the private `SO_RECV_ANYIF` option; without it the
/// kernel never delivers AWDL traffic to the socket. Must be applied before
/// `bind`. On other platforms this is a no-op.
#[cfg(target_os = "macos")]
pub fn allow_any_interface(socket: &Socket) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    const SO_RECV_ANYIF: libc::c_int = 0x1104;

    let value: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            SO_RECV_ANYIF,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
pub fn allow_any_interface(_socket: &Socket) -> std::io::Result<()> {
    Ok(())
}

/// Ask the platform to bring the AWDL interface up.
///
/// macOS only instantiates AWDL while something on the system expresses
/// interest in it; the native hook that does so is out-of-process, so this
/// marks the boundary and logs what the operator must ensure.
pub fn start_awdl() {
    if cfg!(target_os = "macos") {
        debug!("awdl activation hook invoked; native browse keeps the interface awake");
    }
}

/// Release the platform's AWDL interest taken by [`start_awdl`].
pub fn stop_awdl() {
    if cfg!(target_os = "macos") {
        debug!("awdl activation hook released");
    }
}
