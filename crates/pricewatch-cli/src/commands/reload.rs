use std::path::Path;

use anyhow::{Context, Result};

fn read_pid(pid_file: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(pid_file)
        .with_context(|| format!("Failed to read PID file {:?}", pid_file))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("PID file {:?} does not hold a PID", pid_file))
}

/// Send `SIGHUP` to the service whose PID is recorded in `pid_file`.
pub fn run(pid_file: &Path) -> Result<()> {
    let pid = read_pid(pid_file)?;

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid), Signal::SIGHUP)
            .with_context(|| format!("Failed to signal process {}", pid))?;
        println!("Asked service (PID: {}) to reload its rules", pid);
        Ok(())
    }

    #[cfg(not(unix))]
    {
        anyhow::bail!("Reload by signal is not supported on this platform (PID {})", pid)
    }
}
