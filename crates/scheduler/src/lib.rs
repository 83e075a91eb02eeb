//! Main-thread task scheduler for the compositing worker.
//!
//! The scheduler never blocks and never sleeps. Callers feed it the current
//! `Instant` through [`TaskScheduler::poll`], which promotes tasks whose
//! backoff elapsed, expires in-flight tasks past their deadline, and drains
//! the priority queue into the free execution lanes.

mod retry;
mod task;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use rand::prelude::*;
use renderconfig::SchedulerConfig;

pub use retry::RetryPolicy;
pub use task::{
    ErrorCode, Lane, Priority, RenderTask, TaskFailure, TaskId, TaskKind, TaskRequest,
};

/// A task leaving the queue for the transport layer.
#[derive(Debug, Clone)]
pub struct Dispatch<P> {
    pub id: TaskId,
    pub kind: TaskKind,
    pub priority: Priority,
    pub attempt: u32,
    pub deadline: Instant,
    pub generation: Option<u64>,
    pub payload: P,
}

#[derive(Debug, Clone)]
pub enum SchedulerEvent<P> {
    Dispatch(Dispatch<P>),
    /// The in-flight attempt missed its deadline; its slot has been freed.
    TimedOut { id: TaskId, attempt: u32 },
    Retrying {
        id: TaskId,
        next_attempt: u32,
        delay: Duration,
        failure: TaskFailure,
    },
    Failed { id: TaskId, failure: TaskFailure },
    /// A newer render generation superseded this task.
    Preempted { id: TaskId },
}

/// How a reported result was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Accepted,
    /// The task was cancelled or preempted while in flight; result dropped.
    Discarded,
    /// Unknown id or an attempt that is no longer current.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureResolution {
    Retrying { next_attempt: u32, delay: Duration },
    Failed(TaskFailure),
    Discarded,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unresponsive { consecutive_timeouts: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Queued tasks in dispatch order.
    pub queued: Vec<(TaskId, Priority, TaskKind)>,
    pub backing_off: usize,
    pub in_flight_render: usize,
    pub in_flight_filter: usize,
    pub abandoned: usize,
    pub dispatched: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub consecutive_timeouts: u32,
}

struct InFlight<P> {
    task: RenderTask<P>,
    deadline: Instant,
}

struct BackingOff<P> {
    ready_at: Instant,
    task: RenderTask<P>,
}

struct Abandoned {
    attempt: u32,
    deadline: Instant,
}

#[derive(Default)]
struct Totals {
    dispatched: u64,
    completed: u64,
    retried: u64,
    failed: u64,
}

pub struct TaskScheduler<P> {
    config: SchedulerConfig,
    policy: RetryPolicy,
    rng: StdRng,
    next_id: u64,
    next_seq: u64,
    queue: BTreeMap<(Priority, u64), RenderTask<P>>,
    backing_off: Vec<BackingOff<P>>,
    in_flight: HashMap<TaskId, InFlight<P>>,
    abandoned: HashMap<TaskId, Abandoned>,
    latest_generation: Option<u64>,
    consecutive_timeouts: u32,
    pending_events: Vec<SchedulerEvent<P>>,
    totals: Totals,
}

impl<P: Clone> TaskScheduler<P> {
    pub fn new(config: &SchedulerConfig, seed: u64) -> Self {
        Self {
            config: config.clone(),
            policy: RetryPolicy::from_config(config),
            rng: StdRng::seed_from_u64(seed),
            next_id: 1,
            next_seq: 0,
            queue: BTreeMap::new(),
            backing_off: Vec::new(),
            in_flight: HashMap::new(),
            abandoned: HashMap::new(),
            latest_generation: None,
            consecutive_timeouts: 0,
            pending_events: Vec::new(),
            totals: Totals::default(),
        }
    }

    /// Queues a task and returns its id immediately.
    pub fn submit(&mut self, request: TaskRequest<P>, now: Instant) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let task = RenderTask {
            id,
            priority: request.priority,
            kind: request.kind,
            payload: request.payload,
            created_at: now,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(self.config.max_retries),
            generation: request.generation,
        };

        if task.kind == TaskKind::Render {
            if let Some(generation) = task.generation {
                if self.latest_generation.is_some_and(|latest| generation < latest) {
                    tracing::debug!(%id, generation, "render task superseded on arrival");
                    self.pending_events.push(SchedulerEvent::Preempted { id });
                    return id;
                }
                self.latest_generation = Some(generation);
                self.preempt_older_renders(generation);
            }
        }

        tracing::debug!(%id, kind = ?task.kind, priority = ?task.priority, "task queued");
        self.enqueue(task);
        id
    }

    /// Removes a queued task or abandons an in-flight one.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        if let Some(key) = self
            .queue
            .iter()
            .find_map(|(key, task)| (task.id == id).then_some(*key))
        {
            self.queue.remove(&key);
            tracing::debug!(%id, "cancelled queued task");
            return true;
        }

        if let Some(index) = self.backing_off.iter().position(|entry| entry.task.id == id) {
            self.backing_off.remove(index);
            tracing::debug!(%id, "cancelled task awaiting retry");
            return true;
        }

        if let Some(entry) = self.in_flight.remove(&id) {
            self.abandoned.insert(
                id,
                Abandoned {
                    attempt: entry.task.attempt(),
                    deadline: entry.deadline,
                },
            );
            tracing::debug!(%id, "cancelled in-flight task; result will be discarded");
            return true;
        }

        false
    }

    /// Advances timers and dispatches as many queued tasks as lanes allow.
    pub fn poll(&mut self, now: Instant) -> Vec<SchedulerEvent<P>> {
        let mut events = std::mem::take(&mut self.pending_events);
        self.expire_in_flight(now, &mut events);
        self.abandoned.retain(|_, entry| entry.deadline > now);
        self.promote_backoffs(now);
        self.drain(now, &mut events);
        events
    }

    /// Records a terminal success for the given attempt.
    pub fn complete(&mut self, id: TaskId, attempt: u32) -> Resolution {
        if self.take_abandoned(id, attempt) {
            self.consecutive_timeouts = 0;
            return Resolution::Discarded;
        }
        match self.in_flight.get(&id) {
            Some(entry) if entry.task.attempt() == attempt => {
                self.in_flight.remove(&id);
                self.consecutive_timeouts = 0;
                self.totals.completed += 1;
                Resolution::Accepted
            }
            _ => Resolution::Stale,
        }
    }

    /// Records a terminal error for the given attempt and applies the retry policy.
    pub fn fail(
        &mut self,
        id: TaskId,
        attempt: u32,
        failure: TaskFailure,
        now: Instant,
    ) -> FailureResolution {
        if self.take_abandoned(id, attempt) {
            self.consecutive_timeouts = 0;
            return FailureResolution::Discarded;
        }
        let current = self
            .in_flight
            .get(&id)
            .is_some_and(|entry| entry.task.attempt() == attempt);
        if !current {
            return FailureResolution::Stale;
        }
        let Some(entry) = self.in_flight.remove(&id) else {
            return FailureResolution::Stale;
        };
        self.consecutive_timeouts = 0;
        self.retry_or_fail(entry.task, failure, now)
    }

    /// Whether progress for this attempt should still reach the caller.
    pub fn accepts_progress(&self, id: TaskId, attempt: u32) -> bool {
        self.in_flight
            .get(&id)
            .is_some_and(|entry| entry.task.attempt() == attempt)
    }

    pub fn health(&self) -> Health {
        if self.consecutive_timeouts >= self.config.unresponsive_after {
            Health::Unresponsive {
                consecutive_timeouts: self.consecutive_timeouts,
            }
        } else {
            Health::Healthy
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.backing_off.is_empty()
            && self.in_flight.is_empty()
            && self.pending_events.is_empty()
    }

    /// Earliest instant at which `poll` has timer work to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let backoff = self.backing_off.iter().map(|entry| entry.ready_at);
        let deadlines = self.in_flight.values().map(|entry| entry.deadline);
        backoff.chain(deadlines).min()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queued: self
                .queue
                .values()
                .map(|task| (task.id, task.priority, task.kind))
                .collect(),
            backing_off: self.backing_off.len(),
            in_flight_render: self.in_flight_on(Lane::Render),
            in_flight_filter: self.in_flight_on(Lane::Filter),
            abandoned: self.abandoned.len(),
            dispatched: self.totals.dispatched,
            completed: self.totals.completed,
            retried: self.totals.retried,
            failed: self.totals.failed,
            consecutive_timeouts: self.consecutive_timeouts,
        }
    }

    fn enqueue(&mut self, task: RenderTask<P>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((task.priority, seq), task);
    }

    fn take_abandoned(&mut self, id: TaskId, attempt: u32) -> bool {
        match self.abandoned.get(&id) {
            Some(entry) if entry.attempt == attempt => {
                self.abandoned.remove(&id);
                true
            }
            _ => false,
        }
    }

    fn preempt_older_renders(&mut self, generation: u64) {
        let is_older = |task: &RenderTask<P>| {
            task.kind == TaskKind::Render && task.generation.is_some_and(|g| g < generation)
        };

        let stale_keys: Vec<_> = self
            .queue
            .iter()
            .filter(|(_, task)| is_older(task))
            .map(|(key, _)| *key)
            .collect();
        for key in stale_keys {
            if let Some(task) = self.queue.remove(&key) {
                self.pending_events
                    .push(SchedulerEvent::Preempted { id: task.id });
            }
        }

        let mut kept = Vec::with_capacity(self.backing_off.len());
        for entry in self.backing_off.drain(..) {
            if is_older(&entry.task) {
                self.pending_events
                    .push(SchedulerEvent::Preempted { id: entry.task.id });
            } else {
                kept.push(entry);
            }
        }
        self.backing_off = kept;

        let stale_in_flight: Vec<_> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| is_older(&entry.task))
            .map(|(id, _)| *id)
            .collect();
        for id in stale_in_flight {
            if let Some(entry) = self.in_flight.remove(&id) {
                tracing::debug!(%id, "preempting in-flight render");
                self.abandoned.insert(
                    id,
                    Abandoned {
                        attempt: entry.task.attempt(),
                        deadline: entry.deadline,
                    },
                );
                self.pending_events.push(SchedulerEvent::Preempted { id });
            }
        }
    }

    fn expire_in_flight(&mut self, now: Instant, events: &mut Vec<SchedulerEvent<P>>) {
        let expired: Vec<_> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let Some(entry) = self.in_flight.remove(&id) else {
                continue;
            };
            let attempt = entry.task.attempt();
            self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
            tracing::warn!(
                %id,
                attempt,
                consecutive = self.consecutive_timeouts,
                "task exceeded its deadline"
            );
            events.push(SchedulerEvent::TimedOut { id, attempt });
            let failure = TaskFailure::new(
                ErrorCode::Timeout,
                format!("no response within {:?}", self.config.task_timeout),
            );
            match self.retry_or_fail(entry.task, failure.clone(), now) {
                FailureResolution::Retrying {
                    next_attempt,
                    delay,
                } => events.push(SchedulerEvent::Retrying {
                    id,
                    next_attempt,
                    delay,
                    failure,
                }),
                FailureResolution::Failed(failure) => {
                    events.push(SchedulerEvent::Failed { id, failure })
                }
                FailureResolution::Discarded | FailureResolution::Stale => {}
            }
        }
    }

    fn retry_or_fail(
        &mut self,
        mut task: RenderTask<P>,
        failure: TaskFailure,
        now: Instant,
    ) -> FailureResolution {
        if failure.code.is_retryable() && task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.priority = task.priority.boosted();
            let delay = self.policy.delay(task.retry_count, &mut self.rng);
            let next_attempt = task.attempt();
            tracing::debug!(
                id = %task.id,
                next_attempt,
                ?delay,
                code = %failure.code,
                "scheduling retry"
            );
            self.totals.retried += 1;
            self.backing_off.push(BackingOff {
                ready_at: now + delay,
                task,
            });
            FailureResolution::Retrying {
                next_attempt,
                delay,
            }
        } else {
            tracing::warn!(
                id = %task.id,
                attempts = task.attempt(),
                code = %failure.code,
                message = %failure.message,
                "task failed terminally"
            );
            self.totals.failed += 1;
            FailureResolution::Failed(failure)
        }
    }

    fn promote_backoffs(&mut self, now: Instant) {
        let mut waiting = Vec::with_capacity(self.backing_off.len());
        let mut ready = Vec::new();
        for entry in self.backing_off.drain(..) {
            if entry.ready_at <= now {
                ready.push(entry.task);
            } else {
                waiting.push(entry);
            }
        }
        self.backing_off = waiting;
        for task in ready {
            self.enqueue(task);
        }
    }

    fn in_flight_on(&self, lane: Lane) -> usize {
        self.in_flight
            .values()
            .filter(|entry| entry.task.kind.lane() == lane)
            .count()
    }

    fn drain(&mut self, now: Instant, events: &mut Vec<SchedulerEvent<P>>) {
        let mut render_free = self
            .config
            .max_render_workers
            .saturating_sub(self.in_flight_on(Lane::Render));
        let mut filter_free = self
            .config
            .max_filter_workers
            .saturating_sub(self.in_flight_on(Lane::Filter));

        let mut ready = Vec::new();
        for (key, task) in &self.queue {
            if render_free == 0 && filter_free == 0 {
                break;
            }
            let free = match task.kind.lane() {
                Lane::Render => &mut render_free,
                Lane::Filter => &mut filter_free,
            };
            if *free > 0 {
                *free -= 1;
                ready.push(*key);
            }
        }

        for key in ready {
            let Some(task) = self.queue.remove(&key) else {
                continue;
            };
            let deadline = now + self.config.task_timeout;
            let dispatch = Dispatch {
                id: task.id,
                kind: task.kind,
                priority: task.priority,
                attempt: task.attempt(),
                deadline,
                generation: task.generation,
                payload: task.payload.clone(),
            };
            tracing::debug!(
                id = %task.id,
                kind = ?task.kind,
                attempt = dispatch.attempt,
                "dispatching task"
            );
            self.totals.dispatched += 1;
            self.in_flight.insert(task.id, InFlight { task, deadline });
            events.push(SchedulerEvent::Dispatch(dispatch));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(300),
            task_timeout: Duration::from_secs(2),
            ..SchedulerConfig::default()
        }
    }

    fn dispatches(events: &[SchedulerEvent<&'static str>]) -> Vec<Dispatch<&'static str>> {
        events
            .iter()
            .filter_map(|event| match event {
                SchedulerEvent::Dispatch(dispatch) => Some(dispatch.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn dispatches_by_priority_then_fifo() {
        let mut scheduler = TaskScheduler::new(&config(), 1);
        let now = Instant::now();
        scheduler.submit(TaskRequest::new(TaskKind::Render, Priority::Low, "low"), now);
        scheduler.submit(
            TaskRequest::new(TaskKind::Render, Priority::Critical, "critical"),
            now,
        );
        scheduler.submit(
            TaskRequest::new(TaskKind::Render, Priority::Medium, "medium"),
            now,
        );

        let mut order = Vec::new();
        for _ in 0..3 {
            let sent = dispatches(&scheduler.poll(now));
            assert_eq!(sent.len(), 1, "render lane is single-flight");
            let dispatch = &sent[0];
            order.push(dispatch.payload);
            assert_eq!(
                scheduler.complete(dispatch.id, dispatch.attempt),
                Resolution::Accepted
            );
        }
        assert_eq!(order, vec!["critical", "medium", "low"]);
    }

    #[test]
    fn equal_priorities_dispatch_in_submission_order() {
        let mut scheduler = TaskScheduler::new(&config(), 1);
        let now = Instant::now();
        for name in ["first", "second", "third"] {
            scheduler.submit(TaskRequest::new(TaskKind::Resize, Priority::High, name), now);
        }
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.queued.len(), 3);
        let first = dispatches(&scheduler.poll(now));
        assert_eq!(first[0].payload, "first");
    }

    #[test]
    fn filter_lane_runs_beside_render() {
        let mut scheduler = TaskScheduler::new(&config(), 1);
        let now = Instant::now();
        scheduler.submit(TaskRequest::new(TaskKind::Render, Priority::Low, "render"), now);
        scheduler.submit(TaskRequest::new(TaskKind::Render, Priority::Low, "render-2"), now);
        scheduler.submit(TaskRequest::new(TaskKind::Filter, Priority::Low, "filter"), now);

        let sent = dispatches(&scheduler.poll(now));
        let payloads: Vec<_> = sent.iter().map(|d| d.payload).collect();
        assert_eq!(payloads, vec!["render", "filter"]);
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.in_flight_render, 1);
        assert_eq!(snapshot.in_flight_filter, 1);
        assert_eq!(snapshot.queued.len(), 1);
    }

    #[test]
    fn always_failing_task_is_attempted_max_retries_plus_one_times() {
        let mut scheduler = TaskScheduler::new(&config(), 1);
        let mut now = Instant::now();
        let id = scheduler.submit(
            TaskRequest::new(TaskKind::Render, Priority::Low, "doomed").with_max_retries(3),
            now,
        );

        let mut attempts = 0;
        let mut delays = Vec::new();
        let mut terminal = None;
        while terminal.is_none() {
            let sent = dispatches(&scheduler.poll(now));
            assert_eq!(sent.len(), 1);
            attempts += 1;
            assert_eq!(sent[0].attempt, attempts);
            let failure = TaskFailure::new(ErrorCode::Render, "device lost");
            match scheduler.fail(id, sent[0].attempt, failure, now) {
                FailureResolution::Retrying { delay, .. } => {
                    delays.push(delay);
                    // Not yet due: nothing is dispatched during the backoff.
                    assert!(dispatches(&scheduler.poll(now)).is_empty());
                    now += delay;
                }
                FailureResolution::Failed(failure) => terminal = Some(failure),
                other => panic!("unexpected resolution {other:?}"),
            }
        }

        assert_eq!(attempts, 4);
        assert_eq!(terminal.unwrap().code, ErrorCode::Render);
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
            ]
        );
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn retry_boosts_priority() {
        let mut scheduler = TaskScheduler::new(&config(), 1);
        let mut now = Instant::now();
        let id = scheduler.submit(TaskRequest::new(TaskKind::Render, Priority::Low, "a"), now);
        let sent = dispatches(&scheduler.poll(now));
        let resolution = scheduler.fail(
            id,
            sent[0].attempt,
            TaskFailure::new(ErrorCode::Resource, "out of memory"),
            now,
        );
        assert!(matches!(resolution, FailureResolution::Retrying { .. }));
        now += Duration::from_millis(100);
        let sent = dispatches(&scheduler.poll(now));
        assert_eq!(sent[0].priority, Priority::Medium);
        assert_eq!(sent[0].attempt, 2);
    }

    #[test]
    fn dimension_errors_are_not_retried() {
        let mut scheduler = TaskScheduler::new(&config(), 1);
        let now = Instant::now();
        let id = scheduler.submit(TaskRequest::new(TaskKind::Render, Priority::Low, "a"), now);
        let sent = dispatches(&scheduler.poll(now));
        let resolution = scheduler.fail(
            id,
            sent[0].attempt,
            TaskFailure::new(ErrorCode::Dimension, "too large"),
            now,
        );
        assert!(matches!(
            resolution,
            FailureResolution::Failed(TaskFailure {
                code: ErrorCode::Dimension,
                ..
            })
        ));
    }

    #[test]
    fn timeout_frees_slot_and_counts_as_retry() {
        let mut scheduler = TaskScheduler::new(&config(), 1);
        let mut now = Instant::now();
        let id = scheduler.submit(TaskRequest::new(TaskKind::Render, Priority::Low, "slow"), now);
        let first = dispatches(&scheduler.poll(now));
        assert_eq!(first.len(), 1);

        now += Duration::from_secs(3);
        let events = scheduler.poll(now);
        assert!(events
            .iter()
            .any(|event| matches!(event, SchedulerEvent::TimedOut { attempt: 1, .. })));
        assert!(events.iter().any(|event| matches!(
            event,
            SchedulerEvent::Retrying {
                failure: TaskFailure {
                    code: ErrorCode::Timeout,
                    ..
                },
                ..
            }
        )));
        assert_eq!(scheduler.snapshot().in_flight_render, 0);

        // The late answer from the first attempt must not complete the retry.
        assert_eq!(scheduler.complete(id, 1), Resolution::Stale);
        now += Duration::from_millis(100);
        let retry = dispatches(&scheduler.poll(now));
        assert_eq!(retry[0].attempt, 2);
        assert_eq!(scheduler.complete(id, 2), Resolution::Accepted);
    }

    #[test]
    fn repeated_timeouts_report_unresponsive_worker() {
        let cfg = SchedulerConfig {
            max_retries: 5,
            unresponsive_after: 2,
            ..config()
        };
        let mut scheduler = TaskScheduler::new(&cfg, 1);
        let mut now = Instant::now();
        scheduler.submit(TaskRequest::new(TaskKind::Render, Priority::Low, "stuck"), now);
        scheduler.poll(now);
        assert_eq!(scheduler.health(), Health::Healthy);
        for _ in 0..2 {
            now += Duration::from_secs(3);
            scheduler.poll(now);
            now += Duration::from_millis(300);
            scheduler.poll(now);
        }
        assert!(matches!(
            scheduler.health(),
            Health::Unresponsive {
                consecutive_timeouts: 2
            }
        ));
    }

    #[test]
    fn cancel_removes_queued_and_discards_in_flight() {
        let mut scheduler = TaskScheduler::new(&config(), 1);
        let now = Instant::now();
        let running = scheduler.submit(TaskRequest::new(TaskKind::Render, Priority::High, "a"), now);
        let queued = scheduler.submit(TaskRequest::new(TaskKind::Render, Priority::Low, "b"), now);
        let sent = dispatches(&scheduler.poll(now));
        assert_eq!(sent[0].id, running);

        assert!(scheduler.cancel(queued));
        assert!(!scheduler.cancel(queued));
        assert!(scheduler.cancel(running));
        assert!(!scheduler.accepts_progress(running, 1));
        assert_eq!(scheduler.complete(running, 1), Resolution::Discarded);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn cancel_unknown_task_reports_false() {
        let mut scheduler: TaskScheduler<&str> = TaskScheduler::new(&config(), 1);
        assert!(!scheduler.cancel(TaskId(42)));
    }

    #[test]
    fn newer_render_generation_preempts_older_work() {
        let mut scheduler = TaskScheduler::new(&config(), 1);
        let now = Instant::now();
        let first = scheduler.submit(
            TaskRequest::new(TaskKind::Render, Priority::Medium, "g1").with_generation(1),
            now,
        );
        let sent = dispatches(&scheduler.poll(now));
        assert_eq!(sent[0].id, first);
        let second = scheduler.submit(
            TaskRequest::new(TaskKind::Render, Priority::Medium, "g2").with_generation(2),
            now,
        );
        let third = scheduler.submit(
            TaskRequest::new(TaskKind::Render, Priority::Medium, "g3").with_generation(3),
            now,
        );

        let events = scheduler.poll(now);
        let preempted: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                SchedulerEvent::Preempted { id } => Some(*id),
                _ => None,
            })
            .collect();
        assert!(preempted.contains(&first));
        assert!(preempted.contains(&second));
        let sent = dispatches(&events);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, third);
        assert_eq!(scheduler.complete(first, 1), Resolution::Discarded);
    }

    #[test]
    fn older_generation_submitted_late_is_dropped() {
        let mut scheduler = TaskScheduler::new(&config(), 1);
        let now = Instant::now();
        scheduler.submit(
            TaskRequest::new(TaskKind::Render, Priority::Medium, "g5").with_generation(5),
            now,
        );
        let late = scheduler.submit(
            TaskRequest::new(TaskKind::Render, Priority::Medium, "g4").with_generation(4),
            now,
        );
        let events = scheduler.poll(now);
        assert!(events
            .iter()
            .any(|event| matches!(event, SchedulerEvent::Preempted { id } if *id == late)));
        assert_eq!(dispatches(&events)[0].payload, "g5");
    }

    #[test]
    fn next_wakeup_tracks_backoff_and_deadlines() {
        let mut scheduler = TaskScheduler::new(&config(), 1);
        let now = Instant::now();
        assert!(scheduler.next_wakeup().is_none());
        scheduler.submit(TaskRequest::new(TaskKind::Filter, Priority::Low, "f"), now);
        scheduler.poll(now);
        assert_eq!(scheduler.next_wakeup(), Some(now + Duration::from_secs(2)));
    }
}
