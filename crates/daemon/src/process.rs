//! OS process lookups for recorded pids.
//!
//! A pid in the store may outlive the daemon that wrote it and may have been
//! reused by an unrelated program, so every kill is guarded by checking that
//! the live process runs the expected tool.

use std::path::Path;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System, UpdateKind};
use tracing::{debug, warn};

fn snapshot() -> System {
    System::new_with_specifics(
        RefreshKind::new()
            .with_processes(ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet)),
    )
}

/// Executable of a live process, if it exists and is visible to us.
#[cfg(test)]
pub(crate) fn process_exe(pid: u32) -> Option<std::path::PathBuf> {
    snapshot()
        .process(Pid::from_u32(pid))
        .and_then(|p| p.exe())
        .map(Path::to_path_buf)
}

fn same_tool(exe: &Path, tool: &Path) -> bool {
    match (exe.file_stem(), tool.file_stem()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Kill `pid` if it is still running `tool`.
///
/// Returns true when a kill signal was delivered.
pub fn kill_tool_process(pid: u32, tool: &Path) -> bool {
    let sys = snapshot();
    let Some(process) = sys.process(Pid::from_u32(pid)) else {
        debug!(pid, "Process already gone");
        return false;
    };

    match process.exe() {
        Some(exe) if same_tool(exe, tool) => {
            let killed = process.kill();
            if !killed {
                warn!(pid, tool = %tool.display(), "Failed to deliver kill signal");
            }
            killed
        }
        exe => {
            debug!(
                pid,
                exe = ?exe,
                tool = %tool.display(),
                "Pid belongs to a different program; leaving it alone"
            );
            false
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_same_tool_compares_stems() {
        assert!(same_tool(Path::new("/usr/bin/ffmpeg"), Path::new("ffmpeg")));
        assert!(same_tool(
            Path::new("C:/tools/ffmpeg.exe"),
            Path::new("/opt/ffmpeg")
        ));
        assert!(!same_tool(Path::new("/usr/bin/ffplay"), Path::new("ffmpeg")));
    }

    #[test]
    fn test_kill_is_guarded_by_tool() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        let exe = process_exe(pid).expect("sleep should be visible");

        assert!(!kill_tool_process(pid, Path::new("definitely-not-a-tool")));
        assert!(kill_tool_process(pid, &exe));

        let status = child.wait().unwrap();
        assert!(status.signal().is_some());
    }

    #[test]
    fn test_exited_pid_is_never_killed() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(process_exe(pid).is_none());
        assert!(!kill_tool_process(pid, Path::new("true")));
    }
}
