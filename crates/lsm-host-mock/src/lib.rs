//! Mock host implementation for testing the MAC engine
//!
//! This provides a mock implementation of the `Host` trait that can be used
//! for testing the engine without a kernel. Tasks, credential sets and the
//! host's own execve bookkeeping are simulated in memory.
//!
//! The "current task" is tracked per thread, so tests can run several
//! simulated tasks on real threads against one shared host.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::string::String;
use std::sync::atomic::{AtomicU64, Ordering};
use std::vec::Vec;

use lsm_host::{CredKey, Host, HostError, TaskKey};
use spin::Mutex;

/// Credential set every host boots with; the initial task acts with it.
pub const INIT_CRED: CredKey = CredKey(0x1000);
/// The initial task, current on every thread that has not called `enter`.
pub const INIT_TASK: TaskKey = TaskKey(1);

static NEXT_HOST_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Current task per (thread, host instance)
    static CURRENT: RefCell<BTreeMap<u64, TaskKey>> = const { RefCell::new(BTreeMap::new()) };
}

/// Simulated task state
struct MockTask {
    cred: CredKey,
    alive: bool,
    in_execve: bool,
}

/// Mock host for unit testing
///
/// Provides simulated tasks, credential reference counts, time, and a log of
/// forced terminations.
pub struct MockHost {
    id: u64,
    /// Simulated time in nanoseconds
    time: AtomicU64,
    next_task: AtomicU64,
    next_cred: AtomicU64,
    tasks: Mutex<BTreeMap<TaskKey, MockTask>>,
    /// Credential set -> reference count
    creds: Mutex<BTreeMap<CredKey, usize>>,
    unkillable: Mutex<BTreeSet<TaskKey>>,
    /// Tasks terminated through `kill_current`
    killed: Mutex<Vec<TaskKey>>,
    /// Captured debug messages
    debug_log: Mutex<Vec<String>>,
}

impl MockHost {
    /// Create a new mock host with the initial task alive
    pub fn new() -> Self {
        Self::with_time(0)
    }

    /// Create a mock host with a specific starting time
    pub fn with_time(nanos: u64) -> Self {
        let mut tasks = BTreeMap::new();
        tasks.insert(
            INIT_TASK,
            MockTask {
                cred: INIT_CRED,
                alive: true,
                in_execve: false,
            },
        );
        let mut creds = BTreeMap::new();
        creds.insert(INIT_CRED, 1);

        Self {
            id: NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed),
            time: AtomicU64::new(nanos),
            next_task: AtomicU64::new(INIT_TASK.0 + 1),
            next_cred: AtomicU64::new(INIT_CRED.0 + 1),
            tasks: Mutex::new(tasks),
            creds: Mutex::new(creds),
            unkillable: Mutex::new(BTreeSet::new()),
            killed: Mutex::new(Vec::new()),
            debug_log: Mutex::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------------

    /// Advance the simulated time by the given duration
    pub fn advance_time(&self, nanos: u64) {
        self.time.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Set the simulated time to a specific value
    pub fn set_time(&self, nanos: u64) {
        self.time.store(nanos, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Credential sets
    // ------------------------------------------------------------------------

    /// Mint a new credential set with one reference
    pub fn new_cred(&self) -> CredKey {
        let cred = CredKey(self.next_cred.fetch_add(1, Ordering::SeqCst));
        self.creds.lock().insert(cred, 1);
        self.log(format!("[mock-host] new {:?}", cred));
        cred
    }

    /// Take an extra reference on a credential set
    pub fn get_cred(&self, cred: CredKey) {
        *self.creds.lock().entry(cred).or_insert(0) += 1;
    }

    /// Drop a reference; returns the remaining count
    pub fn put_cred(&self, cred: CredKey) -> usize {
        let mut creds = self.creds.lock();
        match creds.get_mut(&cred) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        }
    }

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    /// Create a live task acting with `cred`
    pub fn spawn_task(&self, cred: CredKey) -> TaskKey {
        let task = TaskKey(self.next_task.fetch_add(1, Ordering::SeqCst));
        self.tasks.lock().insert(
            task,
            MockTask {
                cred,
                alive: true,
                in_execve: false,
            },
        );
        self.get_cred(cred);
        self.log(format!("[mock-host] spawned {:?} with {:?}", task, cred));
        task
    }

    /// Make `task` the current task of the calling thread
    pub fn enter(&self, task: TaskKey) {
        CURRENT.with(|current| {
            current.borrow_mut().insert(self.id, task);
        });
    }

    /// Run `f` with `task` current on this thread, then restore the previous task
    pub fn run_as<R>(&self, task: TaskKey, f: impl FnOnce() -> R) -> R {
        let previous = self.current_task();
        self.enter(task);
        let result = f();
        self.enter(previous);
        result
    }

    /// Mark a task as exited without any lifecycle notification
    pub fn exit_task(&self, task: TaskKey) {
        if let Some(t) = self.tasks.lock().get_mut(&task) {
            t.alive = false;
        }
        self.log(format!("[mock-host] exited {:?}", task));
    }

    /// Install a new effective credential set on a task
    pub fn set_task_cred(&self, task: TaskKey, cred: CredKey) {
        if let Some(t) = self.tasks.lock().get_mut(&task) {
            t.cred = cred;
        }
    }

    /// Set the host's own execve indicator for a task
    pub fn set_in_execve(&self, task: TaskKey, in_execve: bool) {
        if let Some(t) = self.tasks.lock().get_mut(&task) {
            t.in_execve = in_execve;
        }
    }

    /// Refuse termination requests for a task
    pub fn set_unkillable(&self, task: TaskKey) {
        self.unkillable.lock().insert(task);
    }

    /// Tasks terminated through `kill_current`, in order
    pub fn killed_tasks(&self) -> Vec<TaskKey> {
        self.killed.lock().clone()
    }

    /// Number of tasks still alive
    pub fn alive_task_count(&self) -> usize {
        self.tasks.lock().values().filter(|t| t.alive).count()
    }

    // ------------------------------------------------------------------------
    // Debug log
    // ------------------------------------------------------------------------

    fn log(&self, msg: String) {
        self.debug_log.lock().push(msg);
    }

    /// Get all captured debug messages
    pub fn get_debug_log(&self) -> Vec<String> {
        self.debug_log.lock().clone()
    }

    /// Check if a specific message was logged
    pub fn has_log_containing(&self, substr: &str) -> bool {
        self.debug_log.lock().iter().any(|msg| msg.contains(substr))
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for MockHost {
    fn current_task(&self) -> TaskKey {
        CURRENT.with(|current| current.borrow().get(&self.id).copied().unwrap_or(INIT_TASK))
    }

    fn current_cred(&self) -> CredKey {
        let task = self.current_task();
        self.task_cred(task).unwrap_or(INIT_CRED)
    }

    fn task_cred(&self, task: TaskKey) -> Option<CredKey> {
        self.tasks
            .lock()
            .get(&task)
            .filter(|t| t.alive)
            .map(|t| t.cred)
    }

    fn task_alive(&self, task: TaskKey) -> bool {
        self.tasks.lock().get(&task).is_some_and(|t| t.alive)
    }

    fn cred_usage(&self, cred: CredKey) -> usize {
        self.creds.lock().get(&cred).copied().unwrap_or(0)
    }

    fn in_transition(&self, task: TaskKey) -> bool {
        self.tasks.lock().get(&task).is_some_and(|t| t.in_execve)
    }

    fn kill_current(&self) -> Result<(), HostError> {
        let task = self.current_task();
        if self.unkillable.lock().contains(&task) {
            return Err(HostError::Unkillable);
        }
        match self.tasks.lock().get_mut(&task) {
            Some(t) if t.alive => t.alive = false,
            _ => return Err(HostError::TaskNotFound),
        }
        self.killed.lock().push(task);
        self.log(format!("[mock-host] killed {:?}", task));
        Ok(())
    }

    fn now_nanos(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_task_is_current_by_default() {
        let host = MockHost::new();
        assert_eq!(host.current_task(), INIT_TASK);
        assert_eq!(host.current_cred(), INIT_CRED);
        assert!(host.task_alive(INIT_TASK));
    }

    #[test]
    fn test_current_task_is_per_thread() {
        let host = std::sync::Arc::new(MockHost::new());
        let task = host.spawn_task(INIT_CRED);
        host.enter(task);

        let other = host.clone();
        let seen = std::thread::spawn(move || other.current_task())
            .join()
            .unwrap();
        assert_eq!(seen, INIT_TASK);
        assert_eq!(host.current_task(), task);
    }

    #[test]
    fn test_current_task_is_per_host() {
        let a = MockHost::new();
        let b = MockHost::new();
        let task = a.spawn_task(INIT_CRED);
        a.enter(task);
        assert_eq!(a.current_task(), task);
        assert_eq!(b.current_task(), INIT_TASK);
    }

    #[test]
    fn test_cred_reference_counting() {
        let host = MockHost::new();
        let cred = host.new_cred();
        assert_eq!(host.cred_usage(cred), 1);
        let task = host.spawn_task(cred);
        assert_eq!(host.cred_usage(cred), 2);
        assert_eq!(host.put_cred(cred), 1);
        assert_eq!(host.task_cred(task), Some(cred));
    }

    #[test]
    fn test_kill_current() {
        let host = MockHost::new();
        let task = host.spawn_task(INIT_CRED);
        host.run_as(task, || assert_eq!(host.kill_current(), Ok(())));
        assert!(!host.task_alive(task));
        assert_eq!(host.killed_tasks(), vec![task]);
        assert!(host.has_log_containing("killed"));
    }

    #[test]
    fn test_kill_unkillable() {
        let host = MockHost::new();
        host.set_unkillable(INIT_TASK);
        assert_eq!(host.kill_current(), Err(HostError::Unkillable));
        assert!(host.task_alive(INIT_TASK));
    }

    #[test]
    fn test_exit_and_execve_indicator() {
        let host = MockHost::new();
        let task = host.spawn_task(INIT_CRED);
        host.set_in_execve(task, true);
        assert!(host.in_transition(task));
        host.exit_task(task);
        assert!(!host.task_alive(task));
        assert_eq!(host.task_cred(task), None);
    }

    #[test]
    fn test_time() {
        let host = MockHost::with_time(1000);
        host.advance_time(500);
        assert_eq!(host.now_nanos(), 1500);
        host.set_time(10);
        assert_eq!(host.now_nanos(), 10);
    }
}
