//! Optional self-imposed memory ceiling (spec.md §4.2): installed on the
//! agent's own process before it starts serving, so every descendant it
//! forks inherits the same address-space cap.

/// Set `RLIMIT_AS` (virtual address space) to `bytes`, soft and hard limit
/// both. A failure here is logged and otherwise ignored — a container
/// whose runtime already caps memory via cgroups still benefits from this
/// as defense in depth, but its absence shouldn't prevent the agent from
/// serving.
pub fn apply_memory_limit(bytes: u64) {
    let limit = libc::rlimit {
        rlim_cur: bytes as libc::rlim_t,
        rlim_max: bytes as libc::rlim_t,
    };

    // SAFETY: setrlimit with a valid `rlimit` value for the current
    // process; failure is recoverable (we just log it).
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        tracing::warn!(error = %err, bytes, "could not set memory limit");
    } else {
        tracing::info!(bytes, "memory limit set");
    }
}
