use std::fs;
use std::io;
use std::os::fd::AsRawFd as _;
use std::path::Path;
use std::process;

/// Forks into the background.
///
/// The parent writes the daemon's PID to `pid_file` (if given) and exits 0;
/// the child becomes a session leader with its working directory at `/` and
/// its standard descriptors pointed at `/dev/null`. Must be called before
/// any threads are spawned.
pub fn detach(pid_file: Option<&Path>) -> io::Result<()> {
    // SAFETY: no threads exist yet, so the child resumes with a coherent
    // address space and only this call frame on its stack.
    let pid = unsafe { libc::fork() };

    match pid {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            // SAFETY: plain syscall, no pointers involved.
            unsafe { libc::setsid() };

            let _ = std::env::set_current_dir("/");

            redirect_stdio_to_dev_null()
        }
        child => {
            if let Some(path) = pid_file
                && let Err(e) = fs::write(path, format!("{child}\n"))
            {
                // The daemon is already running; a missing PID file is not
                // worth killing it over.
                tracing::error!(path = %path.display(), error = %e, "Failed to write PID file");
            }

            process::exit(0);
        }
    }
}

fn redirect_stdio_to_dev_null() -> io::Result<()> {
    let dev_null = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let fd = dev_null.as_raw_fd();

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open; dup2 borrows rather than
        // consumes its source.
        if unsafe { libc::dup2(fd, target) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}
