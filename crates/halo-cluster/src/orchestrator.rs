//! Leader/worker life cycle of one distributed convolution.
//!
//! ```text
//! leader: Idle -> ParsingInputs -> Distributing -> Computing -> Collecting -> Done
//! worker: Idle -> AwaitingInputs -> Computing -> Returning -> Done
//! ```
//!
//! Each state owns exactly the data it needs, so buffers are released
//! as soon as the run moves past them. The leader does not convolve;
//! its `Computing` phase only waits for the workers. Any error aborts
//! the pool so no peer is left blocked on this participant.

use std::fmt;
use std::io::{BufRead, Read, Write};
use std::time::{Duration, Instant};

use halo_pipeline::diagnostics::{RunDiagnostics, StageMetrics};
use halo_pipeline::{
    BandAssignment, Dimensions, FilterMatrix, PartitionPlan, PixelBuffer, convolve_rows,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::comm::{Communicator, LEADER, Rank, Traffic};
use crate::coordinator::DistributionCoordinator;
use crate::error::{ClusterError, Result};
use crate::local::LocalCluster;

/// Observable phase of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    /// Leader: reading the image and filter.
    ParsingInputs,
    /// Leader: broadcasting inputs and sending bands.
    Distributing,
    /// Worker: waiting for inputs and its band.
    AwaitingInputs,
    /// Worker: convolving its band. Leader: waiting on workers.
    Computing,
    /// Leader: receiving computed bands and writing the result.
    Collecting,
    /// Worker: sending its computed band back.
    Returning,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::ParsingInputs => "ParsingInputs",
            Self::Distributing => "Distributing",
            Self::AwaitingInputs => "AwaitingInputs",
            Self::Computing => "Computing",
            Self::Collecting => "Collecting",
            Self::Returning => "Returning",
            Self::Done => "Done",
        };
        f.write_str(name)
    }
}

/// Everything the leader needs to start a run.
pub struct LeaderJob<'a> {
    /// Declared image shape.
    pub dimensions: Dimensions,
    /// Raw pixel bytes, row-major, at least `dimensions.byte_len()` long.
    pub image: Box<dyn Read + 'a>,
    /// Filter text.
    pub filter: Box<dyn BufRead + 'a>,
    /// Destination for the convolved raw bytes.
    pub output: Box<dyn Write + 'a>,
}

impl fmt::Debug for LeaderJob<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderJob")
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

/// What a participant does in a run.
#[derive(Debug)]
pub enum Role<'a> {
    Leader(LeaderJob<'a>),
    Worker,
}

impl Role<'_> {
    const fn name(&self) -> &'static str {
        match self {
            Self::Leader(_) => "leader",
            Self::Worker => "worker",
        }
    }
}

/// Outcome of [`run`] for one participant.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub rank: Rank,
    /// Every phase entered, in order, ending with [`Phase::Done`].
    pub phases: Vec<Phase>,
    pub diagnostics: RunDiagnostics,
    /// The convolved image (leader only).
    pub output: Option<PixelBuffer>,
}

struct ParsedInputs<'a> {
    image: PixelBuffer,
    filter: FilterMatrix,
    radius: u32,
    output: Box<dyn Write + 'a>,
}

struct Pending<'a> {
    plan: PartitionPlan,
    dimensions: Dimensions,
    output: Box<dyn Write + 'a>,
}

struct WorkerBand {
    assignment: BandAssignment,
    filter: FilterMatrix,
    band: Option<PixelBuffer>,
}

enum Compute<'a> {
    Leader(Pending<'a>),
    Worker(WorkerBand),
}

struct WorkerResult {
    assignment: BandAssignment,
    output: Option<PixelBuffer>,
}

enum State<'a> {
    Idle(Role<'a>),
    ParsingInputs(LeaderJob<'a>),
    Distributing(ParsedInputs<'a>),
    AwaitingInputs,
    Computing(Compute<'a>),
    Collecting(Pending<'a>),
    Returning(WorkerResult),
    Done(Option<PixelBuffer>),
}

impl State<'_> {
    const fn phase(&self) -> Phase {
        match self {
            Self::Idle(_) => Phase::Idle,
            Self::ParsingInputs(_) => Phase::ParsingInputs,
            Self::Distributing(_) => Phase::Distributing,
            Self::AwaitingInputs => Phase::AwaitingInputs,
            Self::Computing(_) => Phase::Computing,
            Self::Collecting(_) => Phase::Collecting,
            Self::Returning(_) => Phase::Returning,
            Self::Done(_) => Phase::Done,
        }
    }
}

/// Run one participant to completion.
///
/// A [`Role::Leader`] must hold rank [`LEADER`] and a [`Role::Worker`]
/// any other rank. On error the pool is aborted before returning.
///
/// # Errors
///
/// Returns [`ClusterError::RoleMismatch`] for a role on the wrong rank,
/// a pipeline error for invalid or truncated inputs, or any transport
/// error (including [`ClusterError::Aborted`] when a peer failed).
pub fn run<C: Communicator + ?Sized>(role: Role<'_>, comm: &mut C) -> Result<RunReport> {
    let rank = comm.rank();
    let is_leader = rank == LEADER;
    if matches!(role, Role::Leader(_)) != is_leader {
        return Err(ClusterError::RoleMismatch {
            rank,
            role: role.name(),
        });
    }

    let mut driver = Driver {
        rank,
        phases: Vec::new(),
        diagnostics: RunDiagnostics::default(),
    };
    driver.diagnostics.summary.workers = comm.size().saturating_sub(1);

    let start = Instant::now();
    let traffic_at_start = comm.traffic();
    let result = driver.drive(State::Idle(role), comm);
    let traffic = comm.traffic().since(&traffic_at_start);

    match result {
        Ok(output) => {
            driver.diagnostics.total_duration = start.elapsed();
            driver.diagnostics.summary.bytes_sent = traffic.bytes_sent;
            driver.diagnostics.summary.bytes_received = traffic.bytes_received;
            Ok(RunReport {
                rank,
                phases: driver.phases,
                diagnostics: driver.diagnostics,
                output,
            })
        }
        Err(e) => {
            if !matches!(e, ClusterError::Aborted { .. }) {
                warn!(rank, error = %e, "run failed; aborting pool");
                comm.abort();
            }
            Err(e)
        }
    }
}

struct Driver {
    rank: Rank,
    phases: Vec<Phase>,
    diagnostics: RunDiagnostics,
}

impl Driver {
    fn drive<C: Communicator + ?Sized>(
        &mut self,
        mut state: State<'_>,
        comm: &mut C,
    ) -> Result<Option<PixelBuffer>> {
        loop {
            let phase = state.phase();
            self.phases.push(phase);
            if let State::Done(output) = state {
                debug!(rank = self.rank, "done");
                return Ok(output);
            }

            let started = Instant::now();
            let before = comm.traffic();
            state = self.step(state, comm)?;
            debug!(rank = self.rank, from = %phase, to = %state.phase(), "transition");

            if let Some(metrics) = self.metrics_for(phase, comm.traffic().since(&before)) {
                self.diagnostics
                    .record(phase.to_string(), started.elapsed(), metrics);
            }
        }
    }

    /// Transfer phases are measured by traffic; other phases record
    /// their own metrics in [`step`](Self::step).
    fn metrics_for(&self, phase: Phase, traffic: Traffic) -> Option<StageMetrics> {
        match phase {
            Phase::Distributing | Phase::AwaitingInputs | Phase::Returning => {
                Some(StageMetrics::Transfer {
                    messages: traffic.messages_sent + traffic.messages_received,
                    bytes: traffic.bytes_sent + traffic.bytes_received,
                })
            }
            Phase::Computing if self.rank == LEADER => Some(StageMetrics::Wait),
            _ => None,
        }
    }

    fn step<'a, C: Communicator + ?Sized>(
        &mut self,
        state: State<'a>,
        comm: &mut C,
    ) -> Result<State<'a>> {
        let next = match state {
            State::Idle(Role::Leader(job)) => State::ParsingInputs(job),
            State::Idle(Role::Worker) => State::AwaitingInputs,
            State::ParsingInputs(job) => State::Distributing(self.parse_inputs(job)?),
            State::Distributing(inputs) => {
                State::Computing(Compute::Leader(distribute(inputs, comm)?))
            }
            State::AwaitingInputs => {
                State::Computing(Compute::Worker(self.await_inputs(comm)?))
            }
            State::Computing(Compute::Leader(pending)) => State::Collecting(pending),
            State::Computing(Compute::Worker(work)) => State::Returning(self.compute(work)?),
            State::Collecting(pending) => State::Done(Some(self.collect(pending, comm)?)),
            State::Returning(result) => {
                if let Some(output) = &result.output {
                    DistributionCoordinator::new(comm).return_band(output, &result.assignment)?;
                }
                State::Done(None)
            }
            State::Done(output) => State::Done(output),
        };
        Ok(next)
    }

    fn parse_inputs<'a>(&mut self, job: LeaderJob<'a>) -> Result<ParsedInputs<'a>> {
        let started = Instant::now();
        let dimensions = job.dimensions;
        dimensions.validate()?;
        let image = PixelBuffer::read_from(job.image, dimensions)?;
        let filter = FilterMatrix::parse_from_text(job.filter)?;
        let radius = filter.kernel_radius()?;
        info!(
            %dimensions,
            filter_width = filter.width(),
            filter_height = filter.height(),
            "inputs parsed"
        );

        self.diagnostics.summary.dimensions = Some(dimensions);
        self.diagnostics.summary.filter_radius = Some(radius);
        self.diagnostics.record(
            Phase::ParsingInputs.to_string(),
            started.elapsed(),
            StageMetrics::Parse {
                dimensions,
                filter_width: filter.width(),
                filter_height: filter.height(),
            },
        );
        Ok(ParsedInputs {
            image,
            filter,
            radius,
            output: job.output,
        })
    }

    fn await_inputs<C: Communicator + ?Sized>(&mut self, comm: &mut C) -> Result<WorkerBand> {
        let worker = self.rank - 1;
        let mut coord = DistributionCoordinator::new(comm);
        let shared = coord.receive_inputs()?;
        let radius = shared.filter.kernel_radius()?;
        let plan = coord.plan(shared.dimensions, radius)?;
        let assignment = *plan.assignment(worker).ok_or(ClusterError::UnknownRank {
            rank: self.rank,
            size: plan.assignments.len() + 1,
        })?;
        let band = coord.receive_band(shared.dimensions, &assignment)?;
        if band.is_none() {
            info!(rank = self.rank, "no rows assigned");
        }

        self.diagnostics.summary.dimensions = Some(shared.dimensions);
        self.diagnostics.summary.filter_radius = Some(radius);
        Ok(WorkerBand {
            assignment,
            filter: shared.filter,
            band,
        })
    }

    fn compute(&mut self, work: WorkerBand) -> Result<WorkerResult> {
        let started = Instant::now();
        let Some(band) = work.band else {
            return Ok(WorkerResult {
                assignment: work.assignment,
                output: None,
            });
        };

        let normalized = work.filter.normalize();
        let local = work.assignment.local_interior();
        let mut output = PixelBuffer::allocate(band.dimensions())?;
        convolve_rows(&band, local, &mut output, &normalized)?;
        debug!(
            rank = self.rank,
            interior = %work.assignment.interior,
            halo = %work.assignment.halo,
            "band convolved"
        );

        self.diagnostics.record(
            Phase::Computing.to_string(),
            started.elapsed(),
            StageMetrics::Convolve {
                rows: local.count,
                pixels: u64::from(local.count) * u64::from(band.width()),
            },
        );
        Ok(WorkerResult {
            assignment: work.assignment,
            output: Some(output),
        })
    }

    fn collect<C: Communicator + ?Sized>(
        &mut self,
        mut pending: Pending<'_>,
        comm: &mut C,
    ) -> Result<PixelBuffer> {
        let started = Instant::now();
        let before = comm.traffic();
        let mut output = PixelBuffer::allocate(pending.dimensions)?;
        DistributionCoordinator::new(comm).gather(&mut output, &pending.plan)?;
        let traffic = comm.traffic().since(&before);
        self.diagnostics.record(
            Phase::Collecting.to_string(),
            started.elapsed(),
            StageMetrics::Transfer {
                messages: traffic.messages_received,
                bytes: traffic.bytes_received,
            },
        );

        let started = Instant::now();
        output.encode_to_bytes(&mut pending.output)?;
        pending.output.flush()?;
        self.diagnostics.record(
            "WriteOutput",
            started.elapsed(),
            StageMetrics::Write {
                bytes: output.as_bytes().len() as u64,
            },
        );
        info!(bytes = output.as_bytes().len(), "result written");
        Ok(output)
    }
}

fn distribute<'a, C: Communicator + ?Sized>(
    inputs: ParsedInputs<'a>,
    comm: &mut C,
) -> Result<Pending<'a>> {
    let dimensions = inputs.image.dimensions();
    let mut coord = DistributionCoordinator::new(comm);
    let plan = coord.plan(dimensions, inputs.radius)?;
    coord.share_inputs(&inputs.filter, dimensions)?;
    coord.scatter(&inputs.image, &plan)?;
    info!(
        workers = plan.assignments.len(),
        active = plan.active_workers(),
        rows_per_band = plan.rows_per_band,
        "bands distributed"
    );
    Ok(Pending {
        plan,
        dimensions,
        output: inputs.output,
    })
}

/// Reports from an in-process run.
#[derive(Debug, Clone)]
pub struct LocalRun {
    pub leader: RunReport,
    /// Worker reports in rank order.
    pub workers: Vec<RunReport>,
}

/// Run a whole pool in this process: the leader on the calling thread,
/// each of `workers` workers on its own thread.
///
/// # Errors
///
/// Returns the first failure that is not just a peer's abort, or
/// [`ClusterError::Panicked`] if a worker thread panicked.
pub fn run_local(job: LeaderJob<'_>, workers: usize) -> Result<LocalRun> {
    let mut comms = LocalCluster::communicators(workers + 1)?.into_iter();
    let Some(mut leader_comm) = comms.next() else {
        return Err(ClusterError::UnknownRank {
            rank: LEADER,
            size: 0,
        });
    };

    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .map(|mut comm| scope.spawn(move || run(Role::Worker, &mut comm)))
            .collect();
        let leader = run(Role::Leader(job), &mut leader_comm);
        // A failed leader has already aborted the pool, which releases
        // any worker still blocked on it. Peers hold senders to each
        // other, so dropping this end alone would not.
        drop(leader_comm);

        let mut reports = Vec::with_capacity(handles.len());
        let mut worker_error = None;
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(ClusterError::Aborted { .. })) => {}
                Ok(Err(e)) => {
                    worker_error = worker_error.or(Some(e));
                }
                Err(_) => {
                    worker_error = worker_error.or(Some(ClusterError::Panicked { rank: i + 1 }));
                }
            }
        }

        match leader {
            Ok(leader) => Ok(LocalRun {
                leader,
                workers: reports,
            }),
            Err(leader_error) => Err(match (leader_error, worker_error) {
                (ClusterError::Aborted { .. }, Some(cause)) => cause,
                (leader_error, _) => leader_error,
            }),
        }
    })
}

/// Elapsed time recorded for `phase`, if it was recorded.
#[must_use]
pub fn phase_duration(report: &RunReport, phase: Phase) -> Option<Duration> {
    report
        .diagnostics
        .stage(&phase.to_string())
        .map(|s| s.duration)
}
