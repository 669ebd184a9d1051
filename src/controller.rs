//! The dispatcher at the heart of the pool: a single task that owns the FIFO submission queue,
//! the worker table, and the table of pending futures.
//!
//! Everything that mutates pool state flows through here as a [Ctl] message, which is what makes
//! the ordering guarantees cheap: submissions are dispatched in enqueue order, notifications
//! reach each worker in enqueue order, and a submission's frames are handled by exactly one task.
//!
use crate::handler::{ResultHandler, WorkError, WorkErrorKind};
use crate::notifications::{self, Notification};
use crate::pool::{PoolShared, PoolStatus};
use crate::protocol::{MainFrame, ResultFrame, SubmissionId, SubmissionSpec, WorkerFrame};
use crate::worker::spawn::WorkerLink;
use crate::events::Event;
use fxhash::FxHashMap;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::*;

pub(crate) struct InFlight {
    pub handler: Box<dyn ResultHandler>,
    pub done: oneshot::Sender<Result<Value, WorkError>>,
}

impl InFlight {
    pub(crate) fn complete_cancelled(mut self) {
        self.handler.cancel();
        let _ = self.done.send(Err(WorkError::Cancelled));
    }
}

pub(crate) enum Ctl {
    AdoptWorker(WorkerLink),
    Submit {
        spec: SubmissionSpec,
        inflight: InFlight,
    },
    Cancel {
        id: SubmissionId,
    },
    Broadcast(Notification),
    FromWorker {
        worker_id: usize,
        frame: WorkerFrame,
    },
    WorkerGone {
        worker_id: usize,
    },
    WorkerExited {
        worker_id: usize,
        clean: bool,
    },
    Stop {
        timeout: Duration,
        done: oneshot::Sender<()>,
    },
}

impl std::fmt::Debug for Ctl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdoptWorker(link) => write!(f, "AdoptWorker({})", link.worker_id),
            Self::Submit { spec, .. } => write!(f, "Submit({})", spec.id),
            Self::Cancel { id } => write!(f, "Cancel({id})"),
            Self::Broadcast(n) => write!(f, "Broadcast({})", n.name),
            Self::FromWorker { worker_id, .. } => write!(f, "FromWorker({worker_id})"),
            Self::WorkerGone { worker_id } => write!(f, "WorkerGone({worker_id})"),
            Self::WorkerExited { worker_id, clean } => {
                write!(f, "WorkerExited({worker_id}, clean: {clean})")
            }
            Self::Stop { .. } => write!(f, "Stop"),
        }
    }
}

struct WorkerRecord {
    link: WorkerLink,
    alive: bool,
    start_complete: bool,
    load_complete: bool,
    current: Option<SubmissionId>,
}

impl WorkerRecord {
    fn is_idle(&self) -> bool {
        self.alive && self.start_complete && self.current.is_none()
    }
}

struct StopState {
    done: Vec<oneshot::Sender<()>>,
    deadline: Instant,
    killed: bool,
}

pub(crate) struct Controller {
    shared: Arc<PoolShared>,
    inbox: mpsc::UnboundedReceiver<Ctl>,
    workers: BTreeMap<usize, WorkerRecord>,
    queue: VecDeque<(SubmissionSpec, InFlight)>,
    pending: FxHashMap<SubmissionId, InFlight>,
    stop: Option<StopState>,
    last_broadcast: Instant,
    finished: bool,
}

impl Controller {
    pub(crate) fn new(shared: Arc<PoolShared>, inbox: mpsc::UnboundedReceiver<Ctl>) -> Self {
        Self {
            shared,
            inbox,
            workers: BTreeMap::new(),
            queue: VecDeque::new(),
            pending: FxHashMap::default(),
            stop: None,
            last_broadcast: Instant::now(),
            finished: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let keep_alive = self.shared.config().keep_alive_interval();
        let mut keepalive = tokio::time::interval(keep_alive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stop_deadline = self
                .stop
                .as_ref()
                .filter(|stop| !stop.killed)
                .map(|stop| stop.deadline);

            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => {
                        // the pool was dropped without a stop; don't leave children behind
                        self.kill_alive_workers();
                        break;
                    }
                },
                _ = tokio::time::sleep_until(
                    stop_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400)),
                ), if stop_deadline.is_some() => {
                    self.force_kill_stragglers();
                }
                _ = keepalive.tick() => self.maybe_send_keepalive(keep_alive),
            }

            if self.finished {
                break;
            }
        }
    }

    fn handle(&mut self, msg: Ctl) {
        match msg {
            Ctl::AdoptWorker(link) => self.adopt_worker(link),
            Ctl::Submit { spec, inflight } => self.submit(spec, inflight),
            Ctl::Cancel { id } => self.cancel(id),
            Ctl::Broadcast(notification) => self.broadcast(notification),
            Ctl::FromWorker { worker_id, frame } => self.from_worker(worker_id, frame),
            Ctl::WorkerGone { worker_id } => {
                debug!(worker_id, "worker stream closed, waiting for its exit status");
            }
            Ctl::WorkerExited { worker_id, clean } => self.worker_exited(worker_id, clean),
            Ctl::Stop { timeout, done } => self.stop(timeout, done),
        }
    }

    fn adopt_worker(&mut self, link: WorkerLink) {
        self.shared.events().send(Event::WorkerSpawned {
            worker_id: link.worker_id,
            pid: link.pid,
        });

        // Seed the worker's state mirror, then probe the notification path. The ack to this
        // ping is what marks the worker load-complete.
        let snapshot = notifications::state_snapshot(self.shared.state().snapshot());
        let _ = link.writer.send(MainFrame::Notify(snapshot));
        let _ = link.writer.send(MainFrame::Notify(notifications::ping()));
        self.last_broadcast = Instant::now();

        self.shared.worker_attached();
        self.workers.insert(
            link.worker_id,
            WorkerRecord {
                link,
                alive: true,
                start_complete: false,
                load_complete: false,
                current: None,
            },
        );
    }

    fn submit(&mut self, spec: SubmissionSpec, inflight: InFlight) {
        if self.stop.is_some() || self.finished {
            inflight.complete_cancelled();
            return;
        }
        self.shared
            .events()
            .send(Event::SubmissionQueued { id: spec.id });
        self.queue.push_back((spec, inflight));
        self.pump();
    }

    fn cancel(&mut self, id: SubmissionId) {
        if let Some(position) = self.queue.iter().position(|(spec, _)| spec.id == id) {
            // cancelled before pickup: the frame never reaches a worker
            let (_spec, inflight) = self.queue.remove(position).unwrap();
            inflight.complete_cancelled();
            self.shared.state().purge_cancelled(id);
            self.shared.events().send(Event::SubmissionCancelled { id });
        } else if self.pending.contains_key(&id) {
            // in flight: let the worker's cooperative checks observe the flag via its mirror
            self.broadcast(notifications::cancel(id));
        } else {
            // already terminal (or never dispatched through us): nothing to interrupt, but
            // don't leave the flag behind
            self.shared.state().purge_cancelled(id);
        }
    }

    fn broadcast(&mut self, notification: Notification) {
        self.last_broadcast = Instant::now();
        self.shared.events().send(Event::NotificationBroadcast {
            name: notification.name.clone(),
        });
        for record in self.workers.values().filter(|w| w.alive) {
            let _ = record
                .link
                .writer
                .send(MainFrame::Notify(notification.clone()));
        }
    }

    fn from_worker(&mut self, worker_id: usize, frame: WorkerFrame) {
        match frame {
            WorkerFrame::Started { .. } => {
                if let Some(record) = self.workers.get_mut(&worker_id) {
                    record.start_complete = true;
                }
                self.shared.events().send(Event::WorkerStarted { worker_id });
                self.check_all_started();
            }
            WorkerFrame::NotifyAck { .. } => {
                if let Some(record) = self.workers.get_mut(&worker_id) {
                    record.load_complete = true;
                }
                self.shared.events().send(Event::WorkerLoaded { worker_id });
                self.check_all_loaded();
            }
            WorkerFrame::Result(frame) => self.dispatch_result(worker_id, frame),
        }
    }

    fn dispatch_result(&mut self, worker_id: usize, frame: ResultFrame) {
        let id = frame.id();
        if !self.pending.contains_key(&id) {
            // e.g. a frame raced a forced shutdown
            debug!(%id, "dropping result frame for unknown submission");
            return;
        }

        match frame {
            ResultFrame::StreamValue { payload, .. } => {
                let inflight = self.pending.get_mut(&id).unwrap();
                inflight.handler.handle_result(payload);
            }
            ResultFrame::Value { payload, .. } => {
                let mut inflight = self.pending.remove(&id).unwrap();
                inflight.handler.handle_result(payload);
                let value = inflight.handler.finalize_result();
                let _ = inflight.done.send(Ok(value));
                self.shared.events().send(Event::SubmissionCompleted { id });
                self.settle(worker_id, id);
            }
            ResultFrame::StreamEnd { .. } => {
                let mut inflight = self.pending.remove(&id).unwrap();
                let value = inflight.handler.finalize_result();
                let _ = inflight.done.send(Ok(value));
                self.shared.events().send(Event::SubmissionCompleted { id });
                self.settle(worker_id, id);
            }
            ResultFrame::Error {
                kind,
                message,
                traceback,
                ..
            } => {
                let inflight = self.pending.remove(&id).unwrap();
                let _ = inflight.done.send(Err(WorkError::Worker {
                    kind,
                    message,
                    traceback,
                }));
                self.shared
                    .events()
                    .send(Event::SubmissionFailed { id, kind });
                self.settle(worker_id, id);
            }
            ResultFrame::Cancelled { .. } => {
                let inflight = self.pending.remove(&id).unwrap();
                inflight.complete_cancelled();
                self.shared.events().send(Event::SubmissionCancelled { id });
                self.settle(worker_id, id);
            }
        }
    }

    /// A submission reached its terminal frame: drop its cancel flag and put its worker back
    /// into rotation.
    fn settle(&mut self, worker_id: usize, id: SubmissionId) {
        self.shared.state().purge_cancelled(id);
        if let Some(record) = self.workers.get_mut(&worker_id) {
            if record.current == Some(id) {
                record.current = None;
            }
        }
        self.pump();
    }

    fn worker_exited(&mut self, worker_id: usize, clean: bool) {
        let Some(record) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if !record.alive {
            return;
        }
        record.alive = false;
        let in_flight = record.current.take();
        let remaining = self.shared.worker_detached();
        self.shared
            .events()
            .send(Event::WorkerExited { worker_id, clean });

        if self.stop.is_some() {
            if remaining == 0 {
                self.finalize_stop();
            }
            return;
        }

        if !clean {
            warn!(worker_id, "worker process crashed");
            self.shared.events().send(Event::WorkerCrashed { worker_id });
        }

        if let Some(id) = in_flight {
            if let Some(inflight) = self.pending.remove(&id) {
                let _ = inflight.done.send(Err(WorkError::Worker {
                    kind: WorkErrorKind::WorkerCrash,
                    message: format!(
                        "worker {worker_id} exited while the submission was in flight"
                    ),
                    traceback: String::new(),
                }));
                self.shared.events().send(Event::SubmissionFailed {
                    id,
                    kind: WorkErrorKind::WorkerCrash,
                });
                self.shared.state().purge_cancelled(id);
            }
        }

        if remaining == 0 {
            warn!("no live workers remain, disabling offload");
            if self.shared.set_offload_enabled(false) {
                self.shared.events().send(Event::OffloadDisabled);
            }
            // nothing will ever pull from the queue again; resolve what is left rather than
            // leaving those futures hanging
            for (spec, inflight) in self.queue.drain(..) {
                inflight.complete_cancelled();
                self.shared.state().purge_cancelled(spec.id);
                self.shared
                    .events()
                    .send(Event::SubmissionCancelled { id: spec.id });
            }
        } else {
            self.check_all_started();
            self.check_all_loaded();
            self.pump();
        }
    }

    fn check_all_started(&mut self) {
        if self.shared.status().current() != PoolStatus::Starting {
            return;
        }
        let alive: Vec<_> = self.workers.values().filter(|w| w.alive).collect();
        if alive.is_empty() || !alive.iter().all(|w| w.start_complete) {
            return;
        }
        let count = alive.len();
        drop(alive);

        self.shared.status().advance(PoolStatus::Running);
        if self.shared.auto_enable_offload() {
            self.shared.events().send(Event::OffloadEnabled);
        }
        self.shared.set_started(true);
        self.shared.events().send(Event::PoolRunning { count });
        self.pump();
    }

    fn check_all_loaded(&mut self) {
        let alive: Vec<_> = self.workers.values().filter(|w| w.alive).collect();
        if !alive.is_empty() && alive.iter().all(|w| w.load_complete) {
            self.shared.set_loaded(true);
        }
    }

    /// Feeds queued submissions to idle workers, in FIFO order.
    fn pump(&mut self) {
        if self.shared.status().current() != PoolStatus::Running
            || !self.shared.offload_enabled()
        {
            return;
        }

        while !self.queue.is_empty() {
            let Some(worker_id) = self
                .workers
                .values()
                .find(|w| w.is_idle())
                .map(|w| w.link.worker_id)
            else {
                return;
            };

            let (spec, inflight) = self.queue.pop_front().unwrap();
            let id = spec.id;

            // the cancel flag can be ahead of its Ctl message; never hand a cancelled
            // submission to a worker
            if self.shared.state().is_cancelled(id) {
                inflight.complete_cancelled();
                self.shared.state().purge_cancelled(id);
                self.shared.events().send(Event::SubmissionCancelled { id });
                continue;
            }

            let record = self.workers.get_mut(&worker_id).unwrap();
            if record.link.writer.send(MainFrame::Run(spec.clone())).is_err() {
                // the worker is going away; its exit will be reported separately
                record.alive = false;
                self.queue.push_front((spec, inflight));
                continue;
            }
            record.current = Some(id);
            self.pending.insert(id, inflight);
            self.shared
                .events()
                .send(Event::SubmissionDispatched { id, worker_id });
        }
    }

    fn stop(&mut self, timeout: Duration, done: oneshot::Sender<()>) {
        if self.finished {
            let _ = done.send(());
            return;
        }
        if let Some(stop) = &mut self.stop {
            stop.done.push(done);
            return;
        }

        self.shared.status().advance(PoolStatus::Stopping);
        if self.shared.set_offload_enabled(false) {
            self.shared.events().send(Event::OffloadDisabled);
        }
        self.shared.events().send(Event::PoolStopping);

        let shutdown = notifications::shutdown();
        for record in self.workers.values().filter(|w| w.alive) {
            let _ = record
                .link
                .writer
                .send(MainFrame::Notify(shutdown.clone()));
            let _ = record.link.writer.send(MainFrame::Shutdown);
        }

        // shutdown drops unclaimed work: every outstanding future completes as cancelled
        for (spec, inflight) in self.queue.drain(..) {
            inflight.complete_cancelled();
            self.shared.state().purge_cancelled(spec.id);
            self.shared
                .events()
                .send(Event::SubmissionCancelled { id: spec.id });
        }
        let pending: Vec<_> = self.pending.drain().collect();
        for (id, inflight) in pending {
            inflight.complete_cancelled();
            self.shared.state().purge_cancelled(id);
            self.shared.events().send(Event::SubmissionCancelled { id });
        }
        for record in self.workers.values_mut() {
            record.current = None;
        }

        if self.workers.values().any(|w| w.alive) {
            self.stop = Some(StopState {
                done: vec![done],
                deadline: Instant::now() + timeout,
                killed: false,
            });
        } else {
            self.stop = Some(StopState {
                done: vec![done],
                deadline: Instant::now(),
                killed: false,
            });
            self.finalize_stop();
        }
    }

    fn force_kill_stragglers(&mut self) {
        let Some(stop) = &mut self.stop else {
            return;
        };
        stop.killed = true;
        for record in self.workers.values().filter(|w| w.alive) {
            warn!(worker_id = record.link.worker_id, "worker did not exit in time, killing it");
            let _ = record.link.kill.send(());
        }
    }

    fn finalize_stop(&mut self) {
        self.shared.status().advance(PoolStatus::Stopped);
        self.shared.events().send(Event::PoolStopped);
        if let Some(stop) = self.stop.take() {
            for done in stop.done {
                let _ = done.send(());
            }
        }
        self.finished = true;
    }

    fn kill_alive_workers(&mut self) {
        for record in self.workers.values().filter(|w| w.alive) {
            let _ = record.link.kill.send(());
        }
        self.finished = true;
    }

    fn maybe_send_keepalive(&mut self, keep_alive: Duration) {
        if self.finished || self.stop.is_some() {
            return;
        }
        if self.workers.values().any(|w| w.alive)
            && self.last_broadcast.elapsed() >= keep_alive
        {
            self.broadcast(notifications::ping());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handler::{WorkError, WorkFuture};
    use crate::pool::Pool;
    use crate::registry::Registry;
    use serde_json::json;

    /// A pool whose single "worker" is a channel we hold the receiving end of, so tests can
    /// observe exactly which frames would have reached a real worker process.
    struct Fixture {
        pool: Pool,
        shared: Arc<crate::pool::PoolShared>,
        frames: mpsc::UnboundedReceiver<MainFrame>,
        _kill: mpsc::UnboundedReceiver<()>,
    }

    async fn running_pool_with_fake_worker() -> Fixture {
        let registry = Arc::new(
            Registry::builder()
                .register("job", |_cx, v: i64| Ok(v))
                .build()
                .unwrap(),
        );
        let pool = Pool::new(Config::default(), registry).unwrap();
        let (shared, inbox) = pool.test_parts();
        shared.status().advance(crate::pool::PoolStatus::Starting);
        tokio::spawn(Controller::new(shared.clone(), inbox).run());

        let (writer, frames) = mpsc::unbounded_channel();
        let (kill, kill_rx) = mpsc::unbounded_channel();
        shared
            .ctl()
            .send(Ctl::AdoptWorker(WorkerLink {
                worker_id: 0,
                pid: None,
                writer,
                kill,
            }))
            .unwrap();
        shared
            .ctl()
            .send(Ctl::FromWorker {
                worker_id: 0,
                frame: WorkerFrame::Started { worker_id: 0 },
            })
            .unwrap();
        assert!(pool.wait_for_process_start(Duration::from_secs(5)).await);

        Fixture {
            pool,
            shared,
            frames,
            _kill: kill_rx,
        }
    }

    async fn expect_run(frames: &mut mpsc::UnboundedReceiver<MainFrame>) -> SubmissionSpec {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("the worker writer closed");
            if let MainFrame::Run(spec) = frame {
                return spec;
            }
        }
    }

    fn complete(shared: &Arc<crate::pool::PoolShared>, id: SubmissionId) {
        shared
            .ctl()
            .send(Ctl::FromWorker {
                worker_id: 0,
                frame: WorkerFrame::Result(ResultFrame::Value {
                    id,
                    payload: json!(0),
                }),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn submissions_are_dispatched_in_fifo_order() {
        let mut fx = running_pool_with_fake_worker().await;

        let futures: Vec<WorkFuture<i64>> = (0..3)
            .map(|v| fx.pool.submit("job", v).unwrap())
            .collect();

        for expected in &futures {
            let spec = expect_run(&mut fx.frames).await;
            assert_eq!(spec.id, expected.id());
            complete(&fx.shared, spec.id);
        }
        for fut in futures {
            assert_eq!(fut.result().await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn cancel_before_pickup_never_reaches_a_worker() {
        let mut fx = running_pool_with_fake_worker().await;

        // occupy the only worker
        let busy: WorkFuture<i64> = fx.pool.submit("job", 1).unwrap();
        let busy_spec = expect_run(&mut fx.frames).await;
        assert_eq!(busy_spec.id, busy.id());

        // queue a second submission and cancel it before pickup
        let queued: WorkFuture<i64> = fx.pool.submit("job", 2).unwrap();
        let queued_id = queued.id();
        queued.cancel();
        assert_matches!(queued.result().await, Err(WorkError::Cancelled));
        // its cancel flag is purged once it settles
        assert!(!fx.shared.state().is_cancelled(queued_id));

        complete(&fx.shared, busy_spec.id);
        assert_eq!(busy.result().await.unwrap(), 0);

        // the next frame the worker sees is a later submission, not the cancelled one
        let after: WorkFuture<i64> = fx.pool.submit("job", 3).unwrap();
        let next = expect_run(&mut fx.frames).await;
        assert_eq!(next.id, after.id());
        complete(&fx.shared, next.id);
        assert_eq!(after.result().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_cancels_outstanding_futures_and_stops_the_pool() {
        let mut fx = running_pool_with_fake_worker().await;

        let in_flight: WorkFuture<i64> = fx.pool.submit("job", 1).unwrap();
        let _ = expect_run(&mut fx.frames).await;
        let queued: WorkFuture<i64> = fx.pool.submit("job", 2).unwrap();

        // the fake worker "exits" shortly after the sentinels go out
        let shared = fx.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = shared.ctl().send(Ctl::WorkerExited {
                worker_id: 0,
                clean: true,
            });
        });

        fx.pool.stop(Some(Duration::from_secs(1))).await;

        assert_eq!(fx.pool.status(), crate::pool::PoolStatus::Stopped);
        assert_eq!(fx.pool.current_process_count(), 0);
        assert_matches!(in_flight.result().await, Err(WorkError::Cancelled));
        assert_matches!(queued.result().await, Err(WorkError::Cancelled));
    }

    #[tokio::test]
    async fn a_worker_crash_fails_its_submission_and_disables_offload_when_last() {
        let mut fx = running_pool_with_fake_worker().await;

        let doomed: WorkFuture<i64> = fx.pool.submit("job", 1).unwrap();
        let spec = expect_run(&mut fx.frames).await;
        assert_eq!(spec.id, doomed.id());
        // a submission queued behind the busy worker, never dispatched
        let stranded: WorkFuture<i64> = fx.pool.submit("job", 2).unwrap();

        fx.shared
            .ctl()
            .send(Ctl::WorkerExited {
                worker_id: 0,
                clean: false,
            })
            .unwrap();

        let err = doomed.result().await.unwrap_err();
        assert_matches!(
            err,
            WorkError::Worker {
                kind: WorkErrorKind::WorkerCrash,
                ..
            }
        );
        // the queued submission resolves too instead of hanging on an empty pool
        assert_matches!(stranded.result().await, Err(WorkError::Cancelled));
        assert_eq!(fx.pool.current_process_count(), 0);
        // with no workers left, new submissions fall back to local execution
        let local: WorkFuture<i64> = fx.pool.submit("job", 7).unwrap();
        assert_eq!(local.result().await.unwrap(), 7);
    }
}
