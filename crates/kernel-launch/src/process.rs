//! Process liveness and termination helpers.

#[cfg(unix)]
use std::path::PathBuf;

use log::warn;

/// Returns `true` when a process with `pid` appears alive on this platform.
pub fn pid_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        if PathBuf::from("/proc").join(pid.to_string()).exists() {
            return true;
        }
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        // Signal 0 only checks for existence and permission.
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        let filter = format!("PID eq {pid}");
        match std::process::Command::new("tasklist")
            .args(["/FI", &filter, "/FO", "CSV", "/NH"])
            .output()
        {
            Ok(output) if output.status.success() => {
                tasklist_has_pid(&String::from_utf8_lossy(&output.stdout), pid)
            }
            _ => false,
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        pid == std::process::id()
    }
}

/// Terminate a process (and its process group on Unix) by pid.
///
/// Missing processes are not an error.
pub fn terminate_pid(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid;
        let target = Pid::from_raw(pid as i32);
        // Servers we launch lead their own group; recovered ones may not.
        let result = match killpg(target, Signal::SIGTERM) {
            Err(nix::errno::Errno::ESRCH) => kill(target, Signal::SIGTERM),
            other => other,
        };
        match result {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => {
                warn!("[process] Failed to signal {}: {}", pid, e);
                Err(std::io::Error::from_raw_os_error(e as i32))
            }
        }
    }

    #[cfg(windows)]
    {
        let status = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .status()?;
        if !status.success() {
            warn!("[process] taskkill exited with {} for {}", status, pid);
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("[process] Cannot terminate {} on this platform", pid);
        Ok(())
    }
}

/// Whether `tasklist /FO CSV /NH` output lists `pid`. Rows look like
/// `"marimo.exe","4242","Console","1","88,120 K"`; anything else, such as the
/// `INFO:` line printed when the filter matches nothing, is skipped.
#[cfg(any(test, windows))]
fn tasklist_has_pid(output: &str, pid: u32) -> bool {
    output
        .lines()
        .filter_map(|row| row.trim().strip_prefix('"'))
        .filter_map(|row| row.split_once("\",\"").map(|(_, rest)| rest))
        .filter_map(|rest| rest.split('"').next())
        .any(|field| field.trim().parse::<u32>() == Ok(pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasklist_lookup() {
        let rows = concat!(
            "\"marimo.exe\",\"4242\",\"Console\",\"1\",\"88,120 K\"\r\n",
            "\"python.exe\",\"5150\",\"Services\",\"0\",\"1,204 K\"\r\n",
        );
        assert!(tasklist_has_pid(rows, 4242));
        assert!(tasklist_has_pid(rows, 5150));
        // Session numbers and partial matches are not pids.
        assert!(!tasklist_has_pid(rows, 1));
        assert!(!tasklist_has_pid(rows, 424));

        let nothing = "INFO: No tasks are running which match the specified criteria.\r\n";
        assert!(!tasklist_has_pid(nothing, 4242));
        assert!(!tasklist_has_pid("", 4242));
    }

    #[cfg(unix)]
    #[test]
    fn test_current_process_is_alive() {
        assert!(pid_is_alive(std::process::id()));
    }

    #[test]
    fn test_pid_zero_is_never_alive() {
        assert!(!pid_is_alive(0));
    }
}
