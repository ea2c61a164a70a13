//! Atom scheduling over the hardware job slots.
//!
//! TEAM_526: Atoms enter a FIFO of submitted work. Once their dependencies
//! have completed they either run right away (soft atoms) or move into the
//! runnable list of their job slot, ordered by priority and then arrival.
//! Idle slots take the head of their list. The scheduler also drives
//! timeouts (soft-stop, then hard-stop and a hang report, then a GPU reset
//! if the hardware never acknowledges the stop), preemption of
//! lower-priority work, and switches between protected and normal mode.
//!
//! The scheduler lives on the device thread only and is deliberately not
//! `Sync`. Everything with side effects goes through [`JobSchedulerOwner`].

use std::cell::Cell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::atom::{Atom, AtomLifecycle, ResultCode, SoftOp};
use crate::config::DriverConfig;
use crate::semaphore::Semaphore;

#[cfg(feature = "verbose-scheduler")]
macro_rules! sched_trace {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

#[cfg(not(feature = "verbose-scheduler"))]
macro_rules! sched_trace {
    ($($arg:tt)*) => {};
}

/// Hardware and client side effects of scheduling decisions.
pub trait JobSchedulerOwner {
    /// Start `atom` on its job slot. Its address slot is already assigned.
    fn run_atom(&mut self, atom: &Arc<Atom>);
    /// Deliver the final result to the atom's connection.
    fn atom_completed(&mut self, atom: &Arc<Atom>, result: ResultCode);
    fn soft_stop_atom(&mut self, atom: &Arc<Atom>);
    fn hard_stop_atom(&mut self, atom: &Arc<Atom>);
    /// Bind the atom's address space to a hardware slot.
    fn assign_address_space(&mut self, atom: &Arc<Atom>) -> bool;
    fn release_mappings_for_atom(&mut self, atom: &Arc<Atom>);
    /// `None` asks to retry once memory has been freed.
    fn allocate_jit_memory(&mut self, atom: &Arc<Atom>) -> Option<ResultCode>;
    fn release_jit_memory(&mut self, atom: &Arc<Atom>) -> ResultCode;
    /// Arrange for the scheduler to run again once `semaphore` signals.
    fn wait_for_semaphore(&mut self, atom: &Arc<Atom>, semaphore: &Arc<Semaphore>);
    fn output_hang_message(&mut self, reason: &str, status: &[String]);
    fn enter_protected_mode(&mut self);
    fn exit_protected_mode(&mut self);
    fn is_in_protected_mode(&self) -> bool;
    fn now(&self) -> Instant;
}

/// Timing and policy knobs taken from [`DriverConfig`].
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    pub job_timeout: Duration,
    pub semaphore_timeout: Duration,
    pub hard_stop_grace: Duration,
    pub preemption_enabled: bool,
}

impl From<&DriverConfig> for SchedulerConfig {
    fn from(config: &DriverConfig) -> Self {
        Self {
            job_timeout: config.job_timeout,
            semaphore_timeout: config.semaphore_timeout,
            hard_stop_grace: config.hard_stop_grace,
            preemption_enabled: config.preemption_enabled,
        }
    }
}

pub struct JobScheduler {
    config: SchedulerConfig,
    /// Submitted atoms whose dependencies may be outstanding, in order.
    waiting_atoms: VecDeque<Arc<Atom>>,
    /// Per job slot, highest priority first, FIFO within a priority.
    runnable_atoms: Vec<VecDeque<Arc<Atom>>>,
    executing_atoms: Vec<Option<Arc<Atom>>>,
    /// Soft atoms blocked on a semaphore.
    waiting_semaphore_atoms: Vec<Arc<Atom>>,
    /// JIT allocations waiting for memory to be freed.
    waiting_jit_atoms: VecDeque<Arc<Atom>>,
    want_to_switch_to_protected: bool,
    want_to_switch_to_unprotected: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl JobScheduler {
    pub fn new(job_slot_count: u32, config: SchedulerConfig) -> Self {
        let slots = job_slot_count as usize;
        Self {
            config,
            waiting_atoms: VecDeque::new(),
            runnable_atoms: (0..slots).map(|_| VecDeque::new()).collect(),
            executing_atoms: vec![None; slots],
            waiting_semaphore_atoms: Vec::new(),
            waiting_jit_atoms: VecDeque::new(),
            want_to_switch_to_protected: false,
            want_to_switch_to_unprotected: false,
            _not_sync: PhantomData,
        }
    }

    pub fn job_slot_count(&self) -> u32 {
        self.executing_atoms.len() as u32
    }

    pub fn enqueue_atom(&mut self, atom: Arc<Atom>) {
        sched_trace!("sched: enqueue {atom:?}");
        atom.set_lifecycle(AtomLifecycle::Pending);
        self.waiting_atoms.push_back(atom);
    }

    pub fn executing_atom(&self, slot: u32) -> Option<&Arc<Atom>> {
        self.executing_atoms.get(slot as usize)?.as_ref()
    }

    /// Atoms not yet completed, executing ones included.
    pub fn outstanding_atom_count(&self) -> usize {
        self.waiting_atoms.len()
            + self.runnable_atoms.iter().map(VecDeque::len).sum::<usize>()
            + self.executing_atoms.iter().flatten().count()
            + self.waiting_semaphore_atoms.len()
            + self.waiting_jit_atoms.len()
    }

    pub fn want_to_switch_to_protected(&self) -> bool {
        self.want_to_switch_to_protected
    }

    pub fn want_to_switch_to_unprotected(&self) -> bool {
        self.want_to_switch_to_unprotected
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Advance everything that can make progress.
    pub fn try_to_schedule(&mut self, owner: &mut dyn JobSchedulerOwner) {
        // Soft atoms complete synchronously and can release further
        // dependents, so iterate until nothing moves.
        loop {
            let mut progressed = self.move_ready_atoms(owner);
            progressed |= self.process_waiting_semaphores(owner);
            progressed |= self.process_waiting_jit(owner);
            if !progressed {
                break;
            }
        }
        self.update_protected_mode_wishes(owner);
        self.validate_can_switch_protected(owner);
        self.schedule_runnable_atoms(owner);
    }

    /// Move atoms whose dependencies have completed out of the waiting FIFO.
    fn move_ready_atoms(&mut self, owner: &mut dyn JobSchedulerOwner) -> bool {
        let mut progressed = false;
        let mut index = 0;
        while index < self.waiting_atoms.len() {
            if !self.waiting_atoms[index].update_dependencies() {
                index += 1;
                continue;
            }
            let Some(atom) = self.waiting_atoms.remove(index) else {
                break;
            };
            progressed = true;

            let dependency_result = atom.final_dependency_result();
            if !dependency_result.is_success() {
                debug!(
                    "sched: atom {} inherits {dependency_result:?} from a dependency",
                    atom.trace_id()
                );
                Self::complete_atom(owner, &atom, dependency_result);
                continue;
            }
            if atom.is_soft() {
                self.process_soft_atom(owner, atom);
            } else {
                self.make_runnable(atom, false);
            }
        }
        progressed
    }

    fn make_runnable(&mut self, atom: Arc<Atom>, front_of_class: bool) {
        let Some(queue) = self.runnable_atoms.get_mut(atom.slot() as usize) else {
            error!("sched: atom {} names missing slot {}", atom.trace_id(), atom.slot());
            return;
        };
        let priority = atom.priority();
        let position = if front_of_class {
            queue.iter().position(|a| a.priority() <= priority)
        } else {
            queue.iter().position(|a| a.priority() < priority)
        }
        .unwrap_or(queue.len());
        atom.set_lifecycle(AtomLifecycle::Runnable);
        queue.insert(position, atom);
    }

    fn process_soft_atom(&mut self, owner: &mut dyn JobSchedulerOwner, atom: Arc<Atom>) {
        let Some(op) = atom.soft_op().cloned() else {
            return;
        };
        sched_trace!("sched: soft atom {} {op:?}", atom.trace_id());
        match op {
            SoftOp::SemaphoreSet(semaphore) => {
                semaphore.signal();
                Self::complete_atom(owner, &atom, ResultCode::Success);
            }
            SoftOp::SemaphoreReset(semaphore) => {
                semaphore.reset();
                Self::complete_atom(owner, &atom, ResultCode::Success);
            }
            SoftOp::SemaphoreWait(semaphore) | SoftOp::SemaphoreWaitAndReset(semaphore) => {
                if semaphore.is_signaled() {
                    self.finish_semaphore_wait(owner, &atom, &semaphore);
                } else {
                    atom.set_lifecycle(AtomLifecycle::Executing);
                    atom.set_execution_started(owner.now());
                    owner.wait_for_semaphore(&atom, &semaphore);
                    self.waiting_semaphore_atoms.push(atom);
                }
            }
            SoftOp::JitAllocate(_) => match owner.allocate_jit_memory(&atom) {
                Some(result) => Self::complete_atom(owner, &atom, result),
                None => {
                    debug!("sched: JIT atom {} waits for memory", atom.trace_id());
                    atom.set_lifecycle(AtomLifecycle::Executing);
                    self.waiting_jit_atoms.push_back(atom);
                }
            },
            SoftOp::JitFree(_) => {
                let result = owner.release_jit_memory(&atom);
                Self::complete_atom(owner, &atom, result);
            }
        }
    }

    fn finish_semaphore_wait(
        &mut self,
        owner: &mut dyn JobSchedulerOwner,
        atom: &Arc<Atom>,
        semaphore: &Semaphore,
    ) {
        if matches!(atom.soft_op(), Some(SoftOp::SemaphoreWaitAndReset(_))) {
            semaphore.reset();
        }
        Self::complete_atom(owner, atom, ResultCode::Success);
    }

    fn process_waiting_semaphores(&mut self, owner: &mut dyn JobSchedulerOwner) -> bool {
        let (signaled, still_waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.waiting_semaphore_atoms)
                .into_iter()
                .partition(|atom| match atom.soft_op() {
                    Some(
                        SoftOp::SemaphoreWait(semaphore)
                        | SoftOp::SemaphoreWaitAndReset(semaphore),
                    ) => semaphore.is_signaled(),
                    _ => true,
                });
        self.waiting_semaphore_atoms = still_waiting;
        let progressed = !signaled.is_empty();
        for atom in signaled {
            match atom.soft_op() {
                Some(
                    SoftOp::SemaphoreWait(semaphore) | SoftOp::SemaphoreWaitAndReset(semaphore),
                ) => {
                    let semaphore = semaphore.clone();
                    self.finish_semaphore_wait(owner, &atom, &semaphore);
                }
                _ => Self::complete_atom(owner, &atom, ResultCode::Success),
            }
        }
        progressed
    }

    /// JIT allocations are retried in submission order; the first that
    /// still cannot be satisfied blocks those behind it.
    fn process_waiting_jit(&mut self, owner: &mut dyn JobSchedulerOwner) -> bool {
        let mut progressed = false;
        while let Some(atom) = self.waiting_jit_atoms.front().cloned() {
            match owner.allocate_jit_memory(&atom) {
                Some(result) => {
                    self.waiting_jit_atoms.pop_front();
                    Self::complete_atom(owner, &atom, result);
                    progressed = true;
                }
                None => break,
            }
        }
        progressed
    }

    /// Oldest runnable work decides which mode the GPU should be in.
    fn update_protected_mode_wishes(&mut self, owner: &dyn JobSchedulerOwner) {
        let protected = owner.is_in_protected_mode();
        let oldest = self
            .runnable_atoms
            .iter()
            .filter_map(VecDeque::front)
            .min_by_key(|atom| atom.trace_id());
        self.want_to_switch_to_protected = false;
        self.want_to_switch_to_unprotected = false;
        if let Some(atom) = oldest {
            if atom.is_protected() && !protected {
                self.want_to_switch_to_protected = true;
            } else if !atom.is_protected() && protected {
                self.want_to_switch_to_unprotected = true;
            }
        }
    }

    /// Switch modes once every job slot has drained.
    fn validate_can_switch_protected(&mut self, owner: &mut dyn JobSchedulerOwner) {
        if !self.want_to_switch_to_protected && !self.want_to_switch_to_unprotected {
            return;
        }
        if self.executing_atoms.iter().any(Option::is_some) {
            return;
        }
        if self.want_to_switch_to_protected {
            info!("sched: entering protected mode");
            owner.enter_protected_mode();
            self.want_to_switch_to_protected = false;
        } else {
            info!("sched: leaving protected mode");
            owner.exit_protected_mode();
            self.want_to_switch_to_unprotected = false;
        }
    }

    fn schedule_runnable_atoms(&mut self, owner: &mut dyn JobSchedulerOwner) {
        let switch_pending = self.want_to_switch_to_protected || self.want_to_switch_to_unprotected;
        let protected = owner.is_in_protected_mode();

        for slot in 0..self.executing_atoms.len() {
            if let Some(executing) = self.executing_atoms[slot].clone() {
                self.maybe_preempt(owner, slot, &executing);
                continue;
            }
            if switch_pending {
                continue;
            }
            let Some(head) = self.runnable_atoms[slot].front() else {
                continue;
            };
            if head.is_protected() != protected {
                continue;
            }
            let Some(atom) = self.runnable_atoms[slot].pop_front() else {
                continue;
            };

            if !owner.assign_address_space(&atom) {
                let result = if atom.connection().upgrade().is_none() {
                    ResultCode::Cancelled
                } else {
                    ResultCode::TimedOut
                };
                warn!("sched: atom {} has no address slot, failing with {result:?}", atom.trace_id());
                Self::complete_atom(owner, &atom, result);
                continue;
            }

            sched_trace!("sched: slot {slot} runs {atom:?}");
            atom.set_lifecycle(AtomLifecycle::Executing);
            atom.set_execution_started(owner.now());
            owner.run_atom(&atom);
            self.executing_atoms[slot] = Some(atom);
        }
    }

    /// Soft-stop a running atom that a higher-priority one is waiting on.
    fn maybe_preempt(&self, owner: &mut dyn JobSchedulerOwner, slot: usize, executing: &Arc<Atom>) {
        if !self.config.preemption_enabled
            || executing.is_preempted()
            || executing.hard_stop_deadline().is_some()
        {
            return;
        }
        let Some(head) = self.runnable_atoms[slot].front() else {
            return;
        };
        if head.priority() <= executing.priority() || head.is_protected() != executing.is_protected()
        {
            return;
        }
        debug!(
            "sched: atom {} (priority {}) preempts atom {} on slot {slot}",
            head.trace_id(),
            head.priority(),
            executing.trace_id()
        );
        executing.set_preempted(true);
        owner.soft_stop_atom(executing);
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    /// The hardware finished the atom on `slot`. `tail` is the job chain
    /// address to resume from after a soft-stop, 0 if none.
    pub fn job_completed(
        &mut self,
        owner: &mut dyn JobSchedulerOwner,
        slot: u32,
        result: ResultCode,
        tail: u64,
    ) {
        let Some(atom) = self
            .executing_atoms
            .get_mut(slot as usize)
            .and_then(Option::take)
        else {
            warn!("sched: completion on idle slot {slot}");
            return;
        };

        let mut result = result;
        if result == ResultCode::SoftStopped && atom.lifecycle() == AtomLifecycle::Executing {
            if atom.is_preempted() {
                atom.set_preempted(false);
                if tail != 0 {
                    atom.set_resume_address(Some(tail));
                }
                owner.release_mappings_for_atom(&atom);
                sched_trace!("sched: atom {} requeued at {tail:#x}", atom.trace_id());
                self.make_runnable(atom, true);
                self.try_to_schedule(owner);
                return;
            }
        }
        // Whatever the hardware reports for a stopped job, the client sees a
        // timeout. A job that finished before the stop landed keeps Success.
        if atom.hard_stop_deadline().is_some() && result != ResultCode::Success {
            result = ResultCode::TimedOut;
        }

        Self::complete_atom(owner, &atom, result);
        self.try_to_schedule(owner);
    }

    fn complete_atom(owner: &mut dyn JobSchedulerOwner, atom: &Arc<Atom>, result: ResultCode) {
        sched_trace!("sched: atom {} completed {result:?}", atom.trace_id());
        atom.set_result_code(result);
        atom.set_lifecycle(AtomLifecycle::Completed);
        owner.release_mappings_for_atom(atom);
        owner.atom_completed(atom, result);
    }

    /// Drop every queued atom of `client_id` with a cancelled result and
    /// hard-stop its running ones.
    pub fn cancel_atoms_for_connection(&mut self, owner: &mut dyn JobSchedulerOwner, client_id: u64) {
        let mut cancelled = Vec::new();
        let mut drain = |queue: &mut VecDeque<Arc<Atom>>| {
            let (gone, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(queue)
                .into_iter()
                .partition(|atom| atom.client_id() == client_id);
            *queue = kept;
            cancelled.extend(gone);
        };
        drain(&mut self.waiting_atoms);
        drain(&mut self.waiting_jit_atoms);
        for queue in &mut self.runnable_atoms {
            drain(queue);
        }
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiting_semaphore_atoms)
            .into_iter()
            .partition(|atom| atom.client_id() == client_id);
        self.waiting_semaphore_atoms = kept;
        cancelled.extend(gone);

        if !cancelled.is_empty() {
            info!("sched: cancelled {} atoms of client {client_id}", cancelled.len());
        }
        for atom in &cancelled {
            Self::complete_atom(owner, atom, ResultCode::Cancelled);
        }
        for atom in self.executing_atoms.iter().flatten() {
            if atom.client_id() == client_id {
                owner.hard_stop_atom(atom);
            }
        }
        self.try_to_schedule(owner);
    }

    /// Fail every running atom after a GPU reset.
    pub fn kill_executing_atoms(&mut self, owner: &mut dyn JobSchedulerOwner) {
        let killed: Vec<_> = self.executing_atoms.iter_mut().filter_map(Option::take).collect();
        for atom in &killed {
            warn!("sched: atom {} killed by reset", atom.trace_id());
            atom.set_preempted(false);
            Self::complete_atom(owner, atom, ResultCode::Terminated);
        }
    }

    // ------------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------------

    /// Time until the next timeout needs handling, `None` if nothing runs.
    pub fn get_current_timeout_duration(&self, now: Instant) -> Option<Duration> {
        let hardware = self.executing_atoms.iter().flatten().filter_map(|atom| {
            atom.hard_stop_deadline().or_else(|| {
                atom.execution_started()
                    .map(|started| started + self.config.job_timeout)
            })
        });
        let semaphores = self.waiting_semaphore_atoms.iter().filter_map(|atom| {
            atom.execution_started()
                .map(|started| started + self.config.semaphore_timeout)
        });
        hardware
            .chain(semaphores)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Soft-stop atoms over their time budget, hard-stop those that ignored
    /// the soft-stop, and fail semaphore waits that never completed.
    ///
    /// A hard-stopped atom keeps its slot until the stop is acknowledged
    /// through [`JobScheduler::job_completed`]. Returns true when a slot
    /// stayed silent past the grace period after a hard-stop; only a GPU
    /// reset can recover it.
    pub fn handle_timed_out_atoms(&mut self, owner: &mut dyn JobSchedulerOwner) -> bool {
        let now = owner.now();
        let grace = self.config.hard_stop_grace;
        let mut hung = Vec::new();
        let mut needs_reset = false;

        for slot in 0..self.executing_atoms.len() {
            let Some(atom) = self.executing_atoms[slot].clone() else {
                continue;
            };
            match atom.hard_stop_deadline() {
                Some(deadline) if now < deadline => {}
                Some(_) if atom.lifecycle() == AtomLifecycle::HardStopped => {
                    error!(
                        "sched: hard-stop of atom {} on slot {slot} never completed",
                        atom.trace_id()
                    );
                    needs_reset = true;
                }
                Some(_) => hung.push(atom),
                None => {
                    let overdue = atom
                        .execution_started()
                        .is_some_and(|started| now >= started + self.config.job_timeout);
                    if overdue {
                        warn!(
                            "sched: atom {} on slot {slot} timed out, soft-stopping",
                            atom.trace_id()
                        );
                        atom.set_hard_stop_deadline(now + grace);
                        owner.soft_stop_atom(&atom);
                    }
                }
            }
        }

        if !hung.is_empty() {
            let status = self.dump();
            owner.output_hang_message("job did not stop after soft-stop", &status);
            for atom in &hung {
                atom.set_lifecycle(AtomLifecycle::HardStopped);
                atom.set_hard_stop_deadline(now + grace);
                owner.hard_stop_atom(atom);
            }
        }

        let semaphore_timeout = self.config.semaphore_timeout;
        let (expired, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiting_semaphore_atoms)
            .into_iter()
            .partition(|atom| {
                atom.execution_started()
                    .is_some_and(|started| now >= started + semaphore_timeout)
            });
        self.waiting_semaphore_atoms = waiting;
        if !expired.is_empty() {
            let status = self.dump();
            owner.output_hang_message("semaphore wait timed out", &status);
            for atom in &expired {
                Self::complete_atom(owner, atom, ResultCode::TimedOut);
            }
            self.try_to_schedule(owner);
        }
        needs_reset
    }

    pub fn dump(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (slot, atom) in self.executing_atoms.iter().enumerate() {
            match atom {
                Some(atom) => lines.push(format!(
                    "job slot {slot}: atom {} client {} number {} priority {} {:?}{}",
                    atom.trace_id(),
                    atom.client_id(),
                    atom.atom_number(),
                    atom.priority(),
                    atom.lifecycle(),
                    if atom.hard_stop_deadline().is_some() {
                        " (timing out)"
                    } else {
                        ""
                    }
                )),
                None => lines.push(format!("job slot {slot}: idle")),
            }
        }
        for (slot, queue) in self.runnable_atoms.iter().enumerate() {
            if !queue.is_empty() {
                lines.push(format!("job slot {slot}: {} runnable", queue.len()));
            }
        }
        lines.push(format!(
            "waiting {} semaphore {} jit {}",
            self.waiting_atoms.len(),
            self.waiting_semaphore_atoms.len(),
            self.waiting_jit_atoms.len()
        ));
        if self.want_to_switch_to_protected || self.want_to_switch_to_unprotected {
            lines.push(format!(
                "mode switch pending: to protected {} to unprotected {}",
                self.want_to_switch_to_protected, self.want_to_switch_to_unprotected
            ));
        }
        lines
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
