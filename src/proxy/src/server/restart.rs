use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

use tokio::net::TcpListener;

/// Fixed descriptor slots a restarted child inherits its listeners at (§4.6 step 2/5).
pub const DATA_FD: RawFd = 3;
pub const API_FD: RawFd = 4;

/// Whether this process was exec'd by a parent performing a graceful restart.
pub fn is_graceful_restart() -> bool {
    std::env::var("GRACEFUL_RESTART")
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Reconstructs a listener from a fixed descriptor slot when restarting, or binds fresh
/// otherwise (§4.6 step 5).
pub async fn inherit_or_bind(fd: RawFd, addr: SocketAddr, restarting: bool) -> io::Result<TcpListener> {
    if restarting {
        // Safety: the parent placed a bound, listening socket at this descriptor before
        // exec, per the fixed-slot restart contract; the child never creates it itself.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        std_listener.set_nonblocking(true)?;
        TcpListener::from_std(std_listener)
    } else {
        TcpListener::bind(addr).await
    }
}

/// Duplicates both listener descriptors into a freshly exec'd copy of this binary at the
/// fixed slots it expects to find them at, with `GRACEFUL_RESTART=true` set so its startup
/// path takes the inherit-don't-bind branch (§4.6 steps 2-3). Uses `Command::pre_exec` to
/// `dup2` the descriptors into place between fork and exec rather than calling `fork`
/// directly, since `std::process::Command` already handles the multi-threaded-process
/// fork/exec safely.
pub fn spawn_replacement(data: &TcpListener, api: Option<&TcpListener>) -> io::Result<u32> {
    let data_fd = data.as_raw_fd();
    let api_fd = api.map(|l| l.as_raw_fd());

    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut cmd = Command::new(exe);
    cmd.args(&args).env("GRACEFUL_RESTART", "true");

    unsafe {
        cmd.pre_exec(move || {
            dup2_fixed(data_fd, DATA_FD)?;
            if let Some(api_fd) = api_fd {
                dup2_fixed(api_fd, API_FD)?;
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    Ok(child.id())
}

fn dup2_fixed(src: RawFd, dst: RawFd) -> io::Result<()> {
    if src == dst {
        return Ok(());
    }
    let res = unsafe { libc::dup2(src, dst) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
