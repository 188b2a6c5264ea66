use std::io;
use std::time::Duration;

#[cfg(unix)]
pub type Descriptor = std::os::fd::RawFd;
#[cfg(not(unix))]
pub type Descriptor = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub fd: Descriptor,
    pub write: bool,
}

#[cfg(unix)]
pub fn descriptor<S: std::os::fd::AsRawFd>(source: &S) -> Option<Descriptor> {
    Some(source.as_raw_fd())
}

#[cfg(windows)]
pub fn descriptor<S: std::os::windows::io::AsRawSocket>(source: &S) -> Option<Descriptor> {
    Some(source.as_raw_socket())
}

#[cfg(not(any(unix, windows)))]
pub fn descriptor<S>(_source: &S) -> Option<Descriptor> {
    None
}

/// Blocks until one of the descriptors is ready or the timeout passes.
/// Returns the ready descriptors; an interrupted wait reports none.
#[cfg(unix)]
pub fn wait(interest: &[Interest], timeout: Duration) -> io::Result<Vec<Descriptor>> {
    let mut fds: Vec<libc::pollfd> = interest
        .iter()
        .map(|i| libc::pollfd {
            fd: i.fd,
            events: if i.write {
                libc::POLLIN | libc::POLLOUT
            } else {
                libc::POLLIN
            },
            revents: 0,
        })
        .collect();

    let millis = timeout.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `fds` is a live, correctly sized array of pollfd for the whole call.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }

    let ready_mask = libc::POLLIN | libc::POLLOUT | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
    Ok(fds
        .iter()
        .filter(|p| p.revents & ready_mask != 0)
        .map(|p| p.fd)
        .collect())
}

/// Without a native readiness call every socket is reported ready after a
/// short pause; the sockets are non-blocking so spurious wakeups are harmless.
#[cfg(not(unix))]
pub fn wait(interest: &[Interest], timeout: Duration) -> io::Result<Vec<Descriptor>> {
    std::thread::sleep(timeout.min(Duration::from_millis(5)));
    Ok(interest.iter().map(|i| i.fd).collect())
}
