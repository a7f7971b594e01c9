//! Background driver for a test run. The foreground only starts a run,
//! raises a stop flag and reads the status channel; one worker thread owns
//! the task and everything it touches. Cancellation is cooperative and
//! observed at exactly one place: between steps in [`drive`]. An in-flight
//! serial read finishes first, bounded by the port's own timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

/// Target duration of one polling cycle.
pub const CYCLE_PERIOD: Duration = Duration::from_secs(1);

/// Cloneable stop flag shared between the foreground and the worker.
/// Raising it never blocks; the worker acts on it at its next checkpoint.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What a task's single step amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A setup phase completed; more work follows immediately.
    Pending,
    /// One full polling cycle completed; the driver paces the next one.
    CycleDone,
    /// The task is done (ran to completion or aborted).
    Finished,
}

/// A long-running job split into resumable steps. Composing the three
/// behaviors here keeps the driving loop generic over what it runs.
pub trait PhasedTask {
    fn setup(&mut self);
    fn step(&mut self) -> Step;
    fn teardown(&mut self);
}

/// Run `task` to completion or cancellation. After a completed polling
/// cycle the loop sleeps out the remainder of [`CYCLE_PERIOD`]; a cycle
/// that overran its budget is followed back-to-back by the next one, never
/// compensated for. Teardown always runs.
pub fn drive<T: PhasedTask>(mut task: T, token: &CancelToken) {
    task.setup();
    while !token.is_cancelled() {
        let target = Instant::now() + CYCLE_PERIOD;
        match task.step() {
            Step::Pending => {}
            Step::CycleDone => {
                let now = Instant::now();
                if target > now {
                    thread::sleep(target - now);
                }
            }
            Step::Finished => break,
        }
    }
    task.teardown();
}

/// Owns the worker thread for the active run, if any.
#[derive(Default)]
pub struct TestRunner {
    worker: Option<(CancelToken, JoinHandle<()>)>,
}

impl TestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |(_, handle)| !handle.is_finished())
    }

    /// Hand `task` to a fresh worker thread. Rejected with a warning while
    /// a run is still active; exactly one worker may drive a board.
    pub fn start<T>(&mut self, task: T)
    where
        T: PhasedTask + Send + 'static,
    {
        if self.is_running() {
            warn!("A test run is already active; start request ignored");
            return;
        }
        if let Some((_, handle)) = self.worker.take() {
            let _ = handle.join();
        }
        let token = CancelToken::new();
        let worker_token = token.clone();
        let handle = thread::spawn(move || drive(task, &worker_token));
        self.worker = Some((token, handle));
    }

    /// Raise the stop flag for the active run. Never blocks; with no run
    /// active this only logs.
    pub fn request_stop(&self) {
        match &self.worker {
            Some((token, _)) => {
                info!("Halting test");
                token.cancel();
            }
            None => info!("No test running to stop"),
        }
    }

    /// Cancel and wait for the worker to wind down. Used when the console
    /// exits; safe to call with no run active.
    pub fn join(&mut self) {
        if let Some((token, handle)) = self.worker.take() {
            token.cancel();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Trace(Arc<Mutex<Vec<&'static str>>>);

    impl Trace {
        fn push(&self, event: &'static str) {
            self.0.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    struct ScriptedTask {
        trace: Trace,
        steps: Vec<Step>,
        cancel_after_first: Option<CancelToken>,
    }

    impl PhasedTask for ScriptedTask {
        fn setup(&mut self) {
            self.trace.push("setup");
        }

        fn step(&mut self) -> Step {
            self.trace.push("step");
            if let Some(token) = self.cancel_after_first.take() {
                token.cancel();
            }
            if self.steps.is_empty() {
                Step::Finished
            } else {
                self.steps.remove(0)
            }
        }

        fn teardown(&mut self) {
            self.trace.push("teardown");
        }
    }

    #[test]
    fn drive_runs_setup_steps_teardown_in_order() {
        let trace = Trace::default();
        let task = ScriptedTask {
            trace: trace.clone(),
            steps: vec![Step::Pending, Step::Pending],
            cancel_after_first: None,
        };
        drive(task, &CancelToken::new());
        assert_eq!(
            trace.events(),
            ["setup", "step", "step", "step", "teardown"]
        );
    }

    #[test]
    fn cancellation_is_observed_between_steps() {
        let trace = Trace::default();
        let token = CancelToken::new();
        let task = ScriptedTask {
            trace: trace.clone(),
            steps: vec![Step::Pending, Step::Pending, Step::Pending],
            cancel_after_first: Some(token.clone()),
        };
        drive(task, &token);
        // The flag raised during the first step stops the loop before a
        // second step; teardown still runs.
        assert_eq!(trace.events(), ["setup", "step", "teardown"]);
    }

    #[test]
    fn teardown_runs_after_finished() {
        let trace = Trace::default();
        let task = ScriptedTask {
            trace: trace.clone(),
            steps: vec![],
            cancel_after_first: None,
        };
        drive(task, &CancelToken::new());
        assert_eq!(trace.events(), ["setup", "step", "teardown"]);
    }

    struct BlockingTask {
        token: CancelToken,
        setups: Arc<AtomicU32>,
    }

    impl PhasedTask for BlockingTask {
        fn setup(&mut self) {
            self.setups.fetch_add(1, Ordering::SeqCst);
        }

        fn step(&mut self) -> Step {
            thread::sleep(Duration::from_millis(5));
            if self.token.is_cancelled() {
                Step::Finished
            } else {
                Step::Pending
            }
        }

        fn teardown(&mut self) {}
    }

    #[test]
    fn start_while_running_is_rejected() {
        let setups = Arc::new(AtomicU32::new(0));
        let token = CancelToken::new();
        let mut runner = TestRunner::new();
        runner.start(BlockingTask {
            token: token.clone(),
            setups: Arc::clone(&setups),
        });
        assert!(runner.is_running());

        // Second start while the first worker lives: ignored, its setup
        // never runs.
        runner.start(BlockingTask {
            token: token.clone(),
            setups: Arc::clone(&setups),
        });
        runner.join();
        assert_eq!(setups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_without_a_run_is_a_no_op() {
        let runner = TestRunner::new();
        runner.request_stop();
    }

    #[test]
    fn runner_can_start_again_after_a_run_ends() {
        let setups = Arc::new(AtomicU32::new(0));
        let mut runner = TestRunner::new();

        let first = CancelToken::new();
        runner.start(BlockingTask {
            token: first.clone(),
            setups: Arc::clone(&setups),
        });
        first.cancel();
        runner.join();

        let second = CancelToken::new();
        runner.start(BlockingTask {
            token: second.clone(),
            setups: Arc::clone(&setups),
        });
        second.cancel();
        runner.join();
        assert_eq!(setups.load(Ordering::SeqCst), 2);
    }
}
