//! Process lifecycle management for child processes
//!
//! Destructive tools (`sgdisk --zap-all`, `cryptsetup luksFormat`, `pacstrap`)
//! must not outlive archstage. Children are spawned in their own process
//! group with a parent-death signal, tracked in a global registry, and
//! signalled as a group on exit: SIGTERM first, SIGKILL after a grace period.
//!
//! Signals do not trigger phase rollback. After an interrupted install the
//! machine is left as-is and `archstage cleanup` restores a clean live state.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry tracking all spawned child process groups
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    /// Set once termination started, so concurrent exit paths do not race
    terminating: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Registered child process group {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Unregistered child process group {}", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate every tracked process group.
    /// Sends SIGTERM, waits up to `grace`, then SIGKILLs whatever is left.
    pub fn terminate_all(&mut self, grace: Duration) {
        if self.terminating {
            debug!("Child termination already in progress");
            return;
        }
        self.terminating = true;

        if self.pids.is_empty() {
            return;
        }
        info!("Terminating {} child process group(s)", self.pids.len());

        let pids: Vec<u32> = self.pids.drain().collect();
        for pid in &pids {
            signal_group_or_pid(*pid, Signal::SIGTERM);
        }
        if wait_until_dead(&pids, grace) {
            info!("All child processes exited after SIGTERM");
            return;
        }
        for pid in pids.iter().copied().filter(|p| is_process_alive(*p)) {
            warn!("Process group {} ignored SIGTERM, sending SIGKILL", pid);
            signal_group_or_pid(pid, Signal::SIGKILL);
        }
    }
}

/// Terminate a single (not necessarily child) process: SIGTERM, then
/// SIGKILL if it is still alive after `grace`.
///
/// Returns `true` if the process is gone afterwards.
pub fn terminate_pid(pid: u32, grace: Duration) -> bool {
    if !is_process_alive(pid) {
        return true;
    }
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed: {}", pid, e);
    }
    if wait_until_dead(&[pid], grace) {
        return true;
    }
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        error!("SIGKILL to {} failed: {}", pid, e);
    }
    wait_until_dead(&[pid], Duration::from_millis(500))
}

/// Signal the whole group (negative PID); fall back to the leader alone.
fn signal_group_or_pid(pid: u32, sig: Signal) {
    if signal::kill(Pid::from_raw(-(pid as i32)), sig).is_ok() {
        return;
    }
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
        debug!("Failed to send {} to {}: {}", sig, pid, e);
    }
}

fn wait_until_dead(pids: &[u32], timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if pids.iter().all(|p| !is_process_alive(*p)) {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Whether a process exists and is not a zombie
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // Field 3 of /proc/<pid>/stat is the state; Z and X are dead for us.
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => match stat.split_whitespace().nth(2) {
            Some(state) => !matches!(state, "Z" | "X"),
            None => true,
        },
        Err(_) => true,
    }
}

/// RAII guard that terminates all registered children when dropped
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(5));
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handlers that kill all children and exit
/// with `128 + signal`. Call once at program start.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "signal",
            };
            warn!(
                "Received {}, terminating children. Run `archstage cleanup` before retrying.",
                name
            );
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for `std::process::Command` to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group that receives
    /// SIGTERM if archstage dies.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}
