//! The single-threaded cooperative worker.
//!
//! Each worker owns one partition of the source, the compiled operator
//! chain, the keyed state of every stateful step for the keys it owns, and
//! its slice of the recovery log. The loop drains inbound transport
//! events, pumps the source a small batch at a time, fires window timers,
//! and commits epochs as the cluster frontier advances.
//!
//! Records bound for stateful steps are staged in an epoch-ordered buffer
//! and applied once their epoch is at or below the next epoch to commit,
//! so a snapshot for epoch `E` contains the effects of epochs `<= E` and
//! nothing else. On a single worker (or a cluster advancing in step) the
//! staging is invisible: records apply as they arrive.
//!
//! Shutdown is staged. A worker whose source is exhausted announces a
//! source-done boundary; once every source is done, stateful steps flush
//! end-of-stream output one chain position at a time, each position
//! fenced by its own boundary so routed flushes land before peers move
//! on. The run ends when every worker announces the closed boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use freshet_communication::{Endpoint, Event};

use crate::dataflow::{Dataflow, Step};
use crate::errors::{Error, UserError};
use crate::execute::EpochConfig;
use crate::inputs::{InputConfig, Poll, SourcePartition};
use crate::operators::reduce::ReduceOp;
use crate::operators::stateful_map::StatefulMapOp;
use crate::operators::window::{FoldWindowLogic, ReduceWindowLogic, WindowedOp};
use crate::operators::{extract_pair, StatefulOp, StatelessOp};
use crate::outputs::SinkPartition;
use crate::progress::{FrontierTracker, CLOSED};
use crate::recovery::{
    FrontierRecord, LocalLogView, LogEntry, RecoveryConfig, RecoveryLog, ResumeToken, Retention,
};
use crate::router;
use crate::state::StateKey;
use crate::value::Value;

/// Records pulled from the source per scheduler pass.
const PUMP_BATCH: usize = 64;
/// Transport events drained per scheduler pass.
const DRAIN_BATCH: usize = 256;
/// How long an idle pass parks on the inbound queue.
const PARK: Duration = Duration::from_millis(1);

/// Boundary announced once a worker's source is exhausted. Stateful steps
/// may still flush records downstream of it, so it is below [`CLOSED`].
/// Real epochs must stay below this; the gap leaves room for one fence per
/// stateful step in the chain.
const SOURCE_DONE: u64 = u64::MAX - 1024;

fn stage_boundary(stage: usize) -> u64 {
    SOURCE_DONE + 1 + stage as u64
}

/// Everything workers exchange over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Message {
    /// Start-of-run exchange of each worker's last completed epoch.
    Resume {
        /// Newest committed epoch in the sender's recovery log.
        completed: Option<u64>,
    },
    /// A keyed record routed to its owner.
    Data {
        /// Index into the compiled chain.
        step: usize,
        /// The record's epoch.
        epoch: u64,
        /// The routing key; always owned by the receiver.
        key: StateKey,
        /// The value half of the pair.
        value: Value,
    },
    /// The sender will emit no further records below `boundary`.
    Progress {
        /// The announced epoch boundary.
        boundary: u64,
    },
}

enum RuntimeStep {
    Stateless(StatelessOp),
    Stateful(Box<dyn StatefulOp>),
    Capture(Box<dyn SinkPartition>),
}

struct BufferedRecord {
    step: usize,
    key: StateKey,
    value: Value,
    timestamp: Option<DateTime<Utc>>,
}

enum Phase {
    /// Pumping the source.
    Running,
    /// Source exhausted; flushing stateful step `stage` once the cluster
    /// catches up to the preceding fence.
    Draining(usize),
    /// All stages flushed; waiting for every worker to close.
    Closing,
    /// Protocol complete.
    Finished,
}

pub(crate) struct Worker {
    endpoint: Endpoint<Message>,
    index: usize,
    peers: usize,
    threads_per_process: usize,
    steps: Vec<RuntimeStep>,
    stateful_indices: Vec<usize>,
    source: Box<dyn SourcePartition>,
    epoch_config: EpochConfig,
    log: Box<dyn RecoveryLog>,
    retention: Retention,
    tracker: FrontierTracker,
    phase: Phase,
    epoch: u64,
    epoch_opened: Instant,
    /// Next epoch to apply and commit; everything below is durable.
    acked: u64,
    /// Epoch of the newest frontier record appended, to suppress
    /// duplicates from the forced final commit.
    last_recorded: Option<u64>,
    last_token: Option<ResumeToken>,
    pending_tokens: VecDeque<(u64, Option<ResumeToken>)>,
    committed_token: Option<ResumeToken>,
    buffer: BTreeMap<u64, VecDeque<BufferedRecord>>,
    interrupt: Arc<AtomicBool>,
}

impl Worker {
    /// Compiles the dataflow, negotiates the cluster resume epoch, and
    /// restores recovered state.
    pub(crate) fn new(
        endpoint: Endpoint<Message>,
        flow: Dataflow,
        epoch_config: EpochConfig,
        recovery: RecoveryConfig,
        interrupt: Arc<AtomicBool>,
        threads_per_process: usize,
    ) -> Result<Worker, Error> {
        let index = endpoint.index();
        let peers = endpoint.peers();
        flow.validate()?;

        let mut log = recovery.open(index)?;
        let view = LocalLogView::from_entries(log.read_from(0)?);
        if let Some(recorded) = view.recorded_worker_count() {
            if recorded != peers {
                return Err(Error::Resume(format!(
                    "recovery log was written by a cluster of {} workers but this cluster has {}",
                    recorded, peers
                )));
            }
        }

        // Exchange last completed epochs; the cluster resumes from the
        // minimum. Data and progress from peers that finish the exchange
        // first is held over and replayed below.
        let local_completed = view.last_completed();
        let mut holdover: Vec<Event<Message>> = Vec::new();
        let cluster_completed = if peers > 1 {
            endpoint
                .broadcast(Message::Resume { completed: local_completed })
                .map_err(Error::Transport)?;
            let mut candidates: Vec<Option<Option<u64>>> = vec![None; peers];
            candidates[index] = Some(local_completed);
            let mut remaining = peers - 1;
            while remaining > 0 {
                if interrupt.load(Ordering::Relaxed) {
                    return Err(Error::Aborted);
                }
                match endpoint.recv_timeout(Duration::from_millis(50)) {
                    Some(Event::Message { source, payload: Message::Resume { completed } }) => {
                        if candidates[source].is_none() {
                            candidates[source] = Some(completed);
                            remaining -= 1;
                        }
                    }
                    Some(other) => holdover.push(other),
                    None => {}
                }
            }
            candidates
                .into_iter()
                .map(|c| c.expect("all candidates collected"))
                .min()
                .expect("at least one worker")
        } else {
            local_completed
        };

        let resume_epoch = cluster_completed.map_or(0, |c| c + 1);
        // Restore from this worker's own newest record at or below the
        // cluster's completed epoch; later local snapshots are ignored and
        // regenerated by replay.
        let (restore_bound, resume_token) = match cluster_completed {
            Some(c) => match view.frontier_at_or_before(c) {
                Some(rec) => (Some(rec.epoch), rec.token.clone()),
                None => (None, None),
            },
            None => (None, None),
        };
        let mut restored =
            restore_bound.map(|bound| view.restored_state(bound)).unwrap_or_default();
        tracing::info!(
            worker = index,
            resume_epoch,
            restoring = restore_bound.is_some(),
            "worker start"
        );

        let mut steps = Vec::new();
        let mut stateful_indices = Vec::new();
        let mut source: Option<Box<dyn SourcePartition>> = None;
        for step in flow.into_steps() {
            match step {
                Step::Input { step_id, input } => {
                    tracing::debug!(worker = index, step = %step_id, "building input partition");
                    let partition = match input {
                        InputConfig::Partitioned(src) => src
                            .build(index, peers, resume_token.clone())
                            .map_err(Error::Source)?,
                        InputConfig::Dynamic(src) => {
                            src.build(index, peers).map_err(Error::Source)?
                        }
                    };
                    source = Some(partition);
                }
                Step::Map { mapper } => {
                    steps.push(RuntimeStep::Stateless(StatelessOp::Map(mapper)))
                }
                Step::Filter { predicate } => {
                    steps.push(RuntimeStep::Stateless(StatelessOp::Filter(predicate)))
                }
                Step::FilterMap { mapper } => {
                    steps.push(RuntimeStep::Stateless(StatelessOp::FilterMap(mapper)))
                }
                Step::FlatMap { mapper } => {
                    steps.push(RuntimeStep::Stateless(StatelessOp::FlatMap(mapper)))
                }
                Step::Inspect { inspector } => {
                    steps.push(RuntimeStep::Stateless(StatelessOp::Inspect(inspector)))
                }
                Step::InspectEpoch { inspector } => {
                    steps.push(RuntimeStep::Stateless(StatelessOp::InspectEpoch(inspector)))
                }
                Step::Reduce { step_id, reducer, is_complete } => {
                    let mut op = ReduceOp::new(step_id.clone(), reducer, is_complete);
                    op.restore(restored.remove(&step_id))?;
                    stateful_indices.push(steps.len());
                    steps.push(RuntimeStep::Stateful(Box::new(op)));
                }
                Step::StatefulMap { step_id, builder, mapper } => {
                    let mut op = StatefulMapOp::new(step_id.clone(), builder, mapper);
                    op.restore(restored.remove(&step_id))?;
                    stateful_indices.push(steps.len());
                    steps.push(RuntimeStep::Stateful(Box::new(op)));
                }
                Step::ReduceWindow { step_id, clock, windower, reducer } => {
                    let mut op = WindowedOp::new(
                        step_id.clone(),
                        clock.build(),
                        windower,
                        ReduceWindowLogic::new(reducer),
                    );
                    op.restore(restored.remove(&step_id))?;
                    stateful_indices.push(steps.len());
                    steps.push(RuntimeStep::Stateful(Box::new(op)));
                }
                Step::FoldWindow { step_id, clock, windower, builder, folder } => {
                    let mut op = WindowedOp::new(
                        step_id.clone(),
                        clock.build(),
                        windower,
                        FoldWindowLogic::new(builder, folder),
                    );
                    op.restore(restored.remove(&step_id))?;
                    stateful_indices.push(steps.len());
                    steps.push(RuntimeStep::Stateful(Box::new(op)));
                }
                Step::Capture { sink } => {
                    let partition = sink
                        .build(index, peers)
                        .map_err(|e| Error::User(UserError(e)))?;
                    steps.push(RuntimeStep::Capture(partition));
                }
            }
        }
        if !restored.is_empty() {
            tracing::warn!(
                steps = ?restored.keys(),
                "resume state exists for unknown steps; did you delete or rename a step \
                 and forget to remove or migrate its state?"
            );
        }

        let mut worker = Worker {
            endpoint,
            index,
            peers,
            threads_per_process,
            steps,
            stateful_indices,
            source: source.expect("validated: first step is the input"),
            epoch_config,
            log,
            retention: recovery.retention,
            tracker: FrontierTracker::new(peers, resume_epoch),
            phase: Phase::Running,
            epoch: resume_epoch,
            epoch_opened: Instant::now(),
            acked: resume_epoch,
            last_recorded: None,
            last_token: resume_token.clone(),
            pending_tokens: VecDeque::new(),
            committed_token: resume_token,
            interrupt,
            buffer: BTreeMap::new(),
        };
        for event in holdover {
            worker.handle_event(event)?;
        }
        Ok(worker)
    }

    /// Runs the worker to completion.
    pub(crate) fn run(mut self) -> Result<(), Error> {
        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                return Err(Error::Aborted);
            }
            let mut busy = self.drain_transport()?;
            busy |= self.apply_eligible()?;
            busy |= self.pump_source()?;
            // Commit before firing timers: a window close belongs to the
            // open epoch, never to the one being snapshotted.
            self.commit_due()?;
            self.tick_windows()?;
            self.advance_close_protocol()?;
            if matches!(self.phase, Phase::Finished) {
                break;
            }
            if !busy {
                if let Some(event) = self.endpoint.recv_timeout(PARK) {
                    self.handle_event(event)?;
                }
            }
        }
        for step in &mut self.steps {
            if let RuntimeStep::Capture(sink) = step {
                sink.close().map_err(|e| Error::User(UserError(e)))?;
            }
        }
        tracing::info!(worker = self.index, "worker stop");
        Ok(())
    }

    fn drain_transport(&mut self) -> Result<bool, Error> {
        let mut any = false;
        for _ in 0..DRAIN_BATCH {
            match self.endpoint.try_recv() {
                Some(event) => {
                    any = true;
                    self.handle_event(event)?;
                }
                None => break,
            }
        }
        Ok(any)
    }

    fn handle_event(&mut self, event: Event<Message>) -> Result<(), Error> {
        match event {
            Event::Message { source, payload } => match payload {
                Message::Data { step, epoch, key, value } => {
                    self.enqueue(step, epoch, key, value)
                }
                Message::Progress { boundary } => {
                    self.tracker.update(source, boundary);
                    Ok(())
                }
                // A restarted peer's exchange; ours already concluded.
                Message::Resume { .. } => Ok(()),
            },
            Event::Disconnected { process } => {
                let lo = process * self.threads_per_process;
                let hi = lo + self.threads_per_process;
                let benign = (lo..hi).all(|w| self.tracker.boundary(w) == CLOSED);
                if benign || matches!(self.phase, Phase::Finished) {
                    Ok(())
                } else {
                    Err(Error::Transport(format!("process {} disconnected mid-run", process)))
                }
            }
        }
    }

    fn enqueue(
        &mut self,
        step: usize,
        epoch: u64,
        key: StateKey,
        value: Value,
    ) -> Result<(), Error> {
        let timestamp = match self.steps.get_mut(step) {
            Some(RuntimeStep::Stateful(op)) => op.stamp(&value),
            _ => {
                return Err(Error::Transport(format!(
                    "malformed frame: step {} is not stateful",
                    step
                )))
            }
        };
        self.buffer
            .entry(epoch)
            .or_default()
            .push_back(BufferedRecord { step, key, value, timestamp });
        Ok(())
    }

    /// Applies staged records whose epoch is due, oldest epoch first.
    fn apply_eligible(&mut self) -> Result<bool, Error> {
        let mut any = false;
        loop {
            let Some((&epoch, _)) = self.buffer.iter().next() else { break };
            if epoch > self.acked {
                break;
            }
            let record = match self.buffer.get_mut(&epoch).and_then(VecDeque::pop_front) {
                Some(record) => record,
                None => {
                    self.buffer.remove(&epoch);
                    continue;
                }
            };
            any = true;
            let mut out = Vec::new();
            match &mut self.steps[record.step] {
                RuntimeStep::Stateful(op) => {
                    op.on_item(record.key, record.value, record.timestamp, &mut out)?
                }
                _ => unreachable!("only stateful steps are buffered"),
            }
            for output in out {
                self.process_from(record.step + 1, epoch, output)?;
            }
        }
        Ok(any)
    }

    /// Pushes one record through the chain starting at `start`.
    ///
    /// Stateless steps run inline; stateful steps route the record to its
    /// owner (staging it locally when that is us); captures write and pass
    /// the record through.
    fn process_from(&mut self, start: usize, epoch: u64, record: Value) -> Result<(), Error> {
        let mut stack = vec![(start, record)];
        while let Some((idx, record)) = stack.pop() {
            if idx >= self.steps.len() {
                continue;
            }
            if matches!(self.steps[idx], RuntimeStep::Stateful(_)) {
                let (key, value) = extract_pair(record)?;
                let owner = router::owner_of(&key, self.peers);
                if owner == self.index {
                    self.enqueue(idx, epoch, key, value)?;
                } else {
                    self.send(owner, Message::Data { step: idx, epoch, key, value })?;
                }
                continue;
            }
            match &mut self.steps[idx] {
                RuntimeStep::Stateless(op) => {
                    let mut out = Vec::new();
                    op.apply(epoch, record, &mut out)?;
                    for output in out.into_iter().rev() {
                        stack.push((idx + 1, output));
                    }
                }
                RuntimeStep::Capture(sink) => {
                    sink.write(record.clone()).map_err(|e| Error::User(UserError(e)))?;
                    stack.push((idx + 1, record));
                }
                RuntimeStep::Stateful(_) => unreachable!(),
            }
        }
        Ok(())
    }

    fn pump_source(&mut self) -> Result<bool, Error> {
        if !matches!(self.phase, Phase::Running) {
            return Ok(false);
        }
        let EpochConfig::Periodic(interval) = self.epoch_config;
        if !interval.is_zero() && self.epoch_opened.elapsed() >= interval {
            self.advance_epoch()?;
        }
        let mut any = false;
        for _ in 0..PUMP_BATCH {
            match self.source.next().map_err(Error::Source)? {
                Poll::Item { token, value } => {
                    any = true;
                    if token.is_some() {
                        self.last_token = token;
                    }
                    self.process_from(0, self.epoch, value)?;
                    // Keep application prompt: on a cluster advancing in
                    // step this epoch is already eligible.
                    self.apply_eligible()?;
                }
                Poll::AdvanceEpoch => {
                    any = true;
                    self.advance_epoch()?;
                    break;
                }
                Poll::Pending => break,
                Poll::Eof => {
                    any = true;
                    self.finish_source()?;
                    break;
                }
            }
        }
        Ok(any)
    }

    fn advance_epoch(&mut self) -> Result<(), Error> {
        self.pending_tokens.push_back((self.epoch, self.last_token.clone()));
        self.epoch += 1;
        self.epoch_opened = Instant::now();
        tracing::trace!(worker = self.index, epoch = self.epoch, "epoch opened");
        self.announce(self.epoch)
    }

    fn finish_source(&mut self) -> Result<(), Error> {
        self.pending_tokens.push_back((self.epoch, self.last_token.clone()));
        self.phase = Phase::Draining(0);
        tracing::info!(worker = self.index, final_epoch = self.epoch, "source exhausted");
        self.announce(SOURCE_DONE)
    }

    fn announce(&mut self, boundary: u64) -> Result<(), Error> {
        self.tracker.update(self.index, boundary);
        if self.peers > 1 {
            self.endpoint
                .broadcast(Message::Progress { boundary })
                .map_err(|e| self.send_error(e))?;
        }
        Ok(())
    }

    fn send(&self, target: usize, message: Message) -> Result<(), Error> {
        self.endpoint.send(target, message).map_err(|e| self.send_error(e))
    }

    fn send_error(&self, message: String) -> Error {
        if self.interrupt.load(Ordering::Relaxed) {
            Error::Aborted
        } else {
            Error::Transport(message)
        }
    }

    fn tick_windows(&mut self) -> Result<(), Error> {
        for i in 0..self.stateful_indices.len() {
            let idx = self.stateful_indices[i];
            let mut out = Vec::new();
            match &mut self.steps[idx] {
                RuntimeStep::Stateful(op) => op.on_tick(&mut out)?,
                _ => unreachable!(),
            }
            for output in out {
                self.process_from(idx + 1, self.epoch, output)?;
            }
        }
        Ok(())
    }

    /// The newest epoch the whole cluster has finished, if any.
    fn completed_epoch(&self) -> Option<u64> {
        let frontier = self.tracker.frontier();
        if frontier >= SOURCE_DONE {
            // Every source is exhausted; whatever remains staged (a peer
            // may have run further than us) is ready to finish.
            let staged_max = self.buffer.keys().next_back().copied().unwrap_or(0);
            Some(self.epoch.max(staged_max))
        } else if frontier > 0 {
            Some(frontier - 1)
        } else {
            None
        }
    }

    fn commit_due(&mut self) -> Result<(), Error> {
        if let Some(completed) = self.completed_epoch() {
            if completed >= self.acked {
                self.commit(completed)?;
            }
        }
        Ok(())
    }

    /// Closes every epoch up to `completed`: applies their staged records,
    /// drains dirty state, and makes the snapshots and the frontier record
    /// durable before acknowledging the source.
    fn commit(&mut self, completed: u64) -> Result<(), Error> {
        if completed >= self.acked {
            self.acked = completed;
            self.apply_eligible()?;
        }

        let mut entries: Vec<LogEntry> = Vec::new();
        for i in 0..self.stateful_indices.len() {
            let idx = self.stateful_indices[i];
            match &mut self.steps[idx] {
                RuntimeStep::Stateful(op) => {
                    entries.extend(op.snapshot(completed).into_iter().map(LogEntry::Snapshot))
                }
                _ => unreachable!(),
            }
        }

        while let Some(&(epoch, _)) = self.pending_tokens.front() {
            if epoch > completed {
                break;
            }
            let (_, token) = self.pending_tokens.pop_front().expect("peeked");
            if token.is_some() {
                self.committed_token = token;
            }
        }

        if entries.is_empty() && self.last_recorded == Some(completed) {
            // Forced final pass with nothing new.
            return Ok(());
        }
        entries.push(LogEntry::Frontier(FrontierRecord {
            worker_index: self.index,
            worker_count: self.peers,
            epoch: completed,
            token: self.committed_token.clone(),
        }));
        self.log.append(&entries)?;
        if self.retention == Retention::Compact {
            self.log.truncate(completed)?;
        }
        if let Some(token) = self.committed_token.clone() {
            self.source.commit(&token);
        }
        self.last_recorded = Some(completed);
        self.acked = completed + 1;
        tracing::debug!(
            worker = self.index,
            epoch = completed,
            entries = entries.len(),
            "epoch committed"
        );
        Ok(())
    }

    /// Walks the staged shutdown once the cluster is ready for each move.
    fn advance_close_protocol(&mut self) -> Result<(), Error> {
        match self.phase {
            Phase::Running | Phase::Finished => Ok(()),
            Phase::Draining(stage) => {
                let fence = if stage == 0 { SOURCE_DONE } else { stage_boundary(stage - 1) };
                if self.tracker.frontier() < fence {
                    return Ok(());
                }
                if stage < self.stateful_indices.len() {
                    let idx = self.stateful_indices[stage];
                    let mut out = Vec::new();
                    match &mut self.steps[idx] {
                        RuntimeStep::Stateful(op) => op.on_eof(&mut out)?,
                        _ => unreachable!(),
                    }
                    for output in out {
                        self.process_from(idx + 1, self.epoch, output)?;
                    }
                    self.apply_eligible()?;
                    self.announce(stage_boundary(stage))?;
                    self.phase = Phase::Draining(stage + 1);
                } else {
                    self.announce(CLOSED)?;
                    self.phase = Phase::Closing;
                }
                Ok(())
            }
            Phase::Closing => {
                if self.tracker.all_closed() {
                    // The end-of-stream flushes may have dirtied state
                    // after the last commit; force one more.
                    let completed = self.completed_epoch().unwrap_or(self.epoch);
                    self.commit(completed)?;
                    self.phase = Phase::Finished;
                }
                Ok(())
            }
        }
    }
}
