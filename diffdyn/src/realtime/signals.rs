/// Block `SIGINT` and `SIGTERM` on the calling thread and the threads it spawns,
/// so they are delivered to some other thread of the process.
#[cfg(unix)]
pub fn block_termination_signals() -> std::io::Result<()> {
    // SAFETY: the signal set is initialized by sigemptyset before use and the
    // old mask is not requested.
    let rc = unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut())
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::from_raw_os_error(rc))
    }
}

#[cfg(not(unix))]
pub fn block_termination_signals() -> std::io::Result<()> {
    Ok(())
}
