//! Zombie reaping (spec.md §4.2): as PID 1, the agent is responsible for
//! harvesting any exited descendant whose parent never calls `wait` on it —
//! otherwise those processes linger as zombies until the container dies.

use std::time::Duration;

const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Non-blocking `waitpid(-1, WNOHANG)` sweep: reap every exited child that
/// doesn't already have a waiter, without blocking on children still running.
fn reap_available() {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: waitpid with WNOHANG never blocks and operates purely on
        // process-table state; -1 means "any child of this process".
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
    }
}

/// Spawn the periodic reaper task. Runs for the lifetime of the process;
/// there's no shutdown handle because there's no harm in reaping during
/// shutdown too.
pub fn spawn_reaper() {
    tokio::spawn(async {
        loop {
            tokio::time::sleep(REAP_INTERVAL).await;
            reap_available();
        }
    });
}
