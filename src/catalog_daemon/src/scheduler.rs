use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Target of a pass that is not bound to one site.
pub const ALL_RSES: &str = "*";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassKind {
    Necromancer,
    CapacityReport,
}

impl PassKind {
    pub const ALL: [PassKind; 2] = [PassKind::Necromancer, PassKind::CapacityReport];
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassTask {
    pub kind: PassKind,
    /// Site name, or [`ALL_RSES`].
    pub target: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassPolicy {
    /// Time between two starts of the pass.
    pub interval: Duration,
    /// Once a pass has run this long, its remaining targets wait for the next start.
    pub max_run_time: Duration,
}

impl PassPolicy {
    pub fn new(interval: Duration, max_run_time: Duration) -> Self {
        Self {
            interval,
            max_run_time,
        }
    }
}

impl Default for PassPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(30))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub executed: usize,
    pub failed: usize,
    pub skipped_due_to_budget: usize,
}

#[async_trait]
pub trait PassExecutor: Send + Sync {
    async fn execute(&self, task: PassTask) -> Result<(), String>;
}

#[derive(Default)]
struct Pass {
    policy: PassPolicy,
    targets: Vec<String>,
    /// None until the first start, which makes a fresh pass due.
    last_started: Option<Instant>,
    /// Index of the target the next start begins with.
    cursor: usize,
}

impl Pass {
    fn is_due(&self, now: Instant) -> bool {
        match self.last_started {
            Some(at) => now.duration_since(at) >= self.policy.interval,
            None => true,
        }
    }

    /// Targets in run order, starting at the cursor.
    fn rotated_targets(&self) -> Vec<String> {
        let len = self.targets.len();
        (0..len)
            .map(|i| self.targets[(self.cursor + i) % len].clone())
            .collect()
    }
}

struct DuePass {
    kind: PassKind,
    policy: PassPolicy,
    targets: Vec<String>,
}

/// Runs each pass kind over its targets every `interval`. All targets of a
/// pass run in one sweep unless the pass exhausts its `max_run_time`.
pub struct PassScheduler {
    passes: HashMap<PassKind, Pass>,
}

impl PassScheduler {
    pub fn new() -> Self {
        let passes = PassKind::ALL
            .into_iter()
            .map(|kind| (kind, Pass::default()))
            .collect();
        Self { passes }
    }

    fn pass_mut(&mut self, kind: PassKind) -> &mut Pass {
        self.passes.entry(kind).or_default()
    }

    pub fn set_policy(&mut self, kind: PassKind, policy: PassPolicy) {
        self.pass_mut(kind).policy = policy;
    }

    pub fn policy(&self, kind: PassKind) -> Option<PassPolicy> {
        self.passes.get(&kind).map(|p| p.policy)
    }

    pub fn add_target(&mut self, kind: PassKind, target: impl Into<String>) {
        let target = target.into();
        let pass = self.pass_mut(kind);
        if !pass.targets.contains(&target) {
            pass.targets.push(target);
        }
    }

    pub fn targets(&self, kind: PassKind) -> &[String] {
        self.passes
            .get(&kind)
            .map(|p| p.targets.as_slice())
            .unwrap_or(&[])
    }

    /// Makes every pass due on the next sweep.
    pub fn mark_all_due(&mut self) {
        for pass in self.passes.values_mut() {
            pass.last_started = None;
        }
    }

    fn start_due_passes(&mut self, now: Instant) -> Vec<DuePass> {
        let mut due = Vec::new();
        for kind in PassKind::ALL {
            let Some(pass) = self.passes.get_mut(&kind) else {
                continue;
            };
            if !pass.is_due(now) {
                continue;
            }
            pass.last_started = Some(now);
            due.push(DuePass {
                kind,
                policy: pass.policy,
                targets: pass.rotated_targets(),
            });
        }
        due
    }

    fn advance_cursor(&mut self, kind: PassKind, done: usize) {
        let pass = self.pass_mut(kind);
        if !pass.targets.is_empty() {
            pass.cursor = (pass.cursor + done) % pass.targets.len();
        }
    }

    pub async fn run_once(
        scheduler: &Arc<Mutex<PassScheduler>>,
        executor: &(dyn PassExecutor + Send + Sync),
    ) -> SweepStats {
        let due = match scheduler.lock() {
            Ok(mut guard) => guard.start_due_passes(Instant::now()),
            Err(e) => {
                error!("PassScheduler: lock poisoned while starting passes: {}", e);
                return SweepStats::default();
            }
        };

        let mut stats = SweepStats::default();
        for pass in due {
            let pass_started = Instant::now();
            let mut done = 0usize;
            for target in pass.targets.iter() {
                if pass_started.elapsed() >= pass.policy.max_run_time {
                    break;
                }
                let task = PassTask {
                    kind: pass.kind,
                    target: target.clone(),
                };
                let started = Instant::now();
                match executor.execute(task).await {
                    Ok(()) => {
                        stats.executed += 1;
                        debug!(
                            "PassScheduler: {:?} on {} done in {:?}",
                            pass.kind,
                            target,
                            started.elapsed()
                        );
                    }
                    Err(e) => {
                        stats.failed += 1;
                        warn!(
                            "PassScheduler: {:?} on {} failed after {:?}! {}",
                            pass.kind,
                            target,
                            started.elapsed(),
                            e
                        );
                    }
                }
                done += 1;
            }

            let skipped = pass.targets.len() - done;
            if skipped > 0 {
                info!(
                    "PassScheduler: {:?} ran out of budget, {} targets wait for the next start",
                    pass.kind, skipped
                );
                stats.skipped_due_to_budget += skipped;
            }
            match scheduler.lock() {
                Ok(mut guard) => guard.advance_cursor(pass.kind, done),
                Err(e) => error!("PassScheduler: lock poisoned while advancing cursor: {}", e),
            }
        }
        stats
    }

    pub fn spawn_worker(
        scheduler: Arc<Mutex<PassScheduler>>,
        executor: Arc<dyn PassExecutor + Send + Sync>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let _ = Self::run_once(&scheduler, executor.as_ref()).await;
            }
        })
    }
}

impl Default for PassScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    struct RecordingExecutor {
        calls: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    #[async_trait]
    impl PassExecutor for RecordingExecutor {
        async fn execute(&self, task: PassTask) -> Result<(), String> {
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if task.target == "BROKEN" {
                return Err("site is broken".to_string());
            }
            let mut calls = self
                .calls
                .lock()
                .map_err(|e| format!("calls lock poisoned: {}", e))?;
            calls.push(format!("{:?}:{}", task.kind, task.target));
            Ok(())
        }
    }

    fn recording(delay: Duration) -> (RecordingExecutor, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::<String>::new()));
        (
            RecordingExecutor {
                calls: calls.clone(),
                delay,
            },
            calls,
        )
    }

    fn scheduler_with(kind: PassKind, policy: PassPolicy, targets: &[&str]) -> Arc<Mutex<PassScheduler>> {
        let mut scheduler = PassScheduler::new();
        scheduler.set_policy(kind, policy);
        for target in targets {
            scheduler.add_target(kind, *target);
        }
        Arc::new(Mutex::new(scheduler))
    }

    #[test]
    fn test_targets_are_deduplicated_per_kind() {
        let mut scheduler = PassScheduler::new();
        scheduler.add_target(PassKind::CapacityReport, "SITE_A");
        scheduler.add_target(PassKind::CapacityReport, "SITE_B");
        scheduler.add_target(PassKind::CapacityReport, "SITE_A");
        assert_eq!(scheduler.targets(PassKind::CapacityReport), ["SITE_A", "SITE_B"]);
        assert!(scheduler.targets(PassKind::Necromancer).is_empty());
        assert_eq!(scheduler.policy(PassKind::Necromancer), Some(PassPolicy::default()));
    }

    #[tokio::test]
    async fn test_pass_waits_for_its_interval() {
        let scheduler = scheduler_with(
            PassKind::Necromancer,
            PassPolicy::new(Duration::from_millis(80), Duration::from_secs(1)),
            &[ALL_RSES],
        );
        let (executor, calls) = recording(Duration::ZERO);

        // a fresh pass starts right away
        let stats = PassScheduler::run_once(&scheduler, &executor).await;
        assert_eq!(stats.executed, 1);

        let stats = PassScheduler::run_once(&scheduler, &executor).await;
        assert_eq!(stats, SweepStats::default());

        sleep(Duration::from_millis(90)).await;
        let stats = PassScheduler::run_once(&scheduler, &executor).await;
        assert_eq!(stats.executed, 1);
        assert_eq!(*calls.lock().unwrap(), vec!["Necromancer:*", "Necromancer:*"]);

        scheduler.lock().unwrap().mark_all_due();
        let stats = PassScheduler::run_once(&scheduler, &executor).await;
        assert_eq!(stats.executed, 1);
    }

    #[tokio::test]
    async fn test_failed_target_does_not_stop_the_pass() {
        let scheduler = scheduler_with(
            PassKind::CapacityReport,
            PassPolicy::new(Duration::from_secs(3600), Duration::from_secs(1)),
            &["SITE_A", "BROKEN", "SITE_B"],
        );
        let (executor, calls) = recording(Duration::ZERO);
        let stats = PassScheduler::run_once(&scheduler, &executor).await;
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["CapacityReport:SITE_A", "CapacityReport:SITE_B"]
        );
    }

    #[tokio::test]
    async fn test_budget_defers_remaining_targets_to_next_start() {
        let scheduler = scheduler_with(
            PassKind::CapacityReport,
            PassPolicy::new(Duration::from_secs(3600), Duration::from_millis(5)),
            &["SITE_A", "SITE_B", "SITE_C"],
        );
        let (executor, calls) = recording(Duration::from_millis(6));

        // the first target overruns the budget, the others are not started
        let stats = PassScheduler::run_once(&scheduler, &executor).await;
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.skipped_due_to_budget, 2);

        // the next start picks up where the budget cut the pass short
        scheduler.lock().unwrap().mark_all_due();
        let stats = PassScheduler::run_once(&scheduler, &executor).await;
        assert_eq!(stats.executed, 1);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["CapacityReport:SITE_A", "CapacityReport:SITE_B"]
        );
    }
}
