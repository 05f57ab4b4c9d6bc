//! Closed-loop synthetic workload engine bound to one qpair.
//!
//! A worker primes `qdepth` I/Os, then keeps the pipeline full by issuing a
//! fresh command from within each completion until its termination predicate
//! fires: the requested I/O count was sent, the deadline passed, or a
//! completion carried an error. The poll loop enforces a hard wall-clock
//! ceiling of `seconds + 10` so a wedged device cannot hang the caller.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::RngCore;
use tracing::{debug, warn};

use crate::buffer::DmaBuffer;
use crate::cmdlog::CMD_LOG_DEPTH;
use crate::controller::{Controller, IoCallback, Namespace, Qpair};
use crate::error::{DriverError, Result};
use crate::nvme::{NvmeCompletion, US_PER_S};

const MAX_SECONDS: u32 = 24 * 3600;

/// Workload shape. Zero `iops` means unthrottled, zero `io_count` unbounded,
/// zero `seconds` unbounded (capped at 24 h); at least one bound must be set.
#[derive(Debug, Clone)]
pub struct Args {
    pub lba_start: u64,
    /// Blocks per I/O.
    pub lba_size: u32,
    pub lba_align: u32,
    pub lba_random: bool,
    pub region_start: u64,
    pub region_end: u64,
    pub read_percentage: u32,
    pub iops: u32,
    pub io_count: u64,
    pub seconds: u32,
    pub qdepth: u32,
    pub enable_per_second_counters: bool,
    pub enable_latency_histogram: bool,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            lba_start: 0,
            lba_size: 8,
            lba_align: 8,
            lba_random: false,
            region_start: 0,
            region_end: u64::MAX,
            read_percentage: 100,
            iops: 0,
            io_count: 0,
            seconds: 0,
            qdepth: 64,
            enable_per_second_counters: false,
            enable_latency_histogram: false,
        }
    }
}

/// Workload results. `error` latches the composite status of the first
/// failed completion (or `0x0002` when the I/O size was rejected up front);
/// `timed_out` is set when the wall-clock ceiling fired with completions
/// still pending.
#[derive(Debug, Clone, Default)]
pub struct Rets {
    pub io_count_read: u64,
    pub io_count_write: u64,
    pub latency_max_us: u32,
    pub mseconds: u32,
    pub error: u16,
    pub timed_out: bool,
    /// I/Os completed in each elapsed second, when requested.
    pub per_second: Option<Vec<u64>>,
    /// Completions per microsecond of latency (last bucket collects the
    /// tail), when requested.
    pub latency_histogram: Option<Vec<u32>>,
}

fn align_up(n: u64, align: u64) -> u64 {
    match n % align {
        0 => n,
        rem => n + align - rem,
    }
}

fn align_down(n: u64, align: u64) -> u64 {
    n - n % align
}

struct IoContext {
    buf: DmaBuffer,
    is_read: bool,
    sent_at: Instant,
}

struct Worker<'a> {
    ctrl: &'a mut Controller,
    ns: &'a Namespace,
    qpair: Qpair,
    rng: Arc<Mutex<StdRng>>,

    lba_size: u16,
    lba_align: u64,
    lba_random: bool,
    region_start: u64,
    region_end: u64,
    read_percentage: u64,
    io_count: u64,

    due_time: Instant,
    io_delay: Duration,
    io_due_time: Instant,
    time_next_sec: Instant,

    cursor: u64,
    sent: u64,
    cplt: u64,
    finish: bool,
    last_sec: usize,
    count_till_last_sec: u64,

    ctxs: Vec<IoContext>,
    completed: Rc<RefCell<VecDeque<(usize, NvmeCompletion)>>>,
    rets: Rets,
}

impl Worker<'_> {
    fn is_read_io(&self) -> bool {
        self.rng.lock().unwrap().next_u64() % 100 < self.read_percentage
    }

    fn pick_lba(&mut self) -> u64 {
        let raw = if self.lba_random {
            let span = self.region_end - self.region_start;
            self.rng.lock().unwrap().next_u64() % span + self.region_start
        } else {
            let mut next = self.cursor + self.lba_align;
            if next > self.region_end {
                next = self.region_start;
            }
            self.cursor = next;
            next
        };
        align_down(raw, self.lba_align)
    }

    fn send_one(&mut self, idx: usize) {
        let is_read = self.is_read_io();
        let lba = self.pick_lba();
        let buf = self.ctxs[idx].buf.clone();
        let completed = Rc::clone(&self.completed);
        let cb: IoCallback = Box::new(move |cpl| {
            completed.borrow_mut().push_back((idx, *cpl));
        });

        let result = self.ctrl.read_write(
            self.ns,
            self.qpair,
            is_read,
            &buf,
            buf.len(),
            lba,
            self.lba_size,
            0, // workers carry no extra io flags
            Some(cb),
        );
        match result {
            Ok(()) => {
                self.sent += 1;
                let ctx = &mut self.ctxs[idx];
                ctx.is_read = is_read;
                ctx.sent_at = Instant::now();
            }
            Err(err) => {
                warn!(%err, "ioworker submission failed");
                self.finish = true;
            }
        }
    }

    fn throttle(&mut self, now: Instant) {
        if self.io_due_time > now {
            std::thread::sleep(self.io_due_time - now);
        }
        self.io_due_time += self.io_delay;
    }

    fn roll_per_second(&mut self) {
        let current = self.rets.io_count_read + self.rets.io_count_write;
        self.time_next_sec += Duration::from_secs(1);
        if let Some(per_second) = self.rets.per_second.as_mut() {
            let bucket = self.last_sec.min(per_second.len() - 1);
            per_second[bucket] += current - self.count_till_last_sec;
        }
        self.last_sec += 1;
        self.count_till_last_sec = current;
    }

    fn on_completion(&mut self, idx: usize, cpl: &NvmeCompletion) {
        self.cplt += 1;
        let now = Instant::now();

        let latency_us = now.duration_since(self.ctxs[idx].sent_at).as_micros() as u32;
        if latency_us > self.rets.latency_max_us {
            self.rets.latency_max_us = latency_us;
        }
        if self.ctxs[idx].is_read {
            self.rets.io_count_read += 1;
        } else {
            self.rets.io_count_write += 1;
        }
        if let Some(histogram) = self.rets.latency_histogram.as_mut() {
            histogram[(latency_us as usize).min(US_PER_S as usize - 1)] += 1;
        }

        if !self.io_delay.is_zero() {
            self.throttle(now);
        }

        if cpl.is_error() {
            // terminate on any error, keep only the first status
            debug!(status = cpl.status_composite(), "ioworker error in completion");
            self.finish = true;
            if self.rets.error == 0 {
                self.rets.error = cpl.status_composite();
            }
        }

        if self.rets.per_second.is_some() && now > self.time_next_sec {
            self.roll_per_second();
        }

        if !self.finish {
            self.finish = self.sent == self.io_count || now > self.due_time;
        }
        if !self.finish {
            self.send_one(idx);
        }
    }
}

/// Run a workload to completion on the calling thread.
pub fn run(ctrl: &mut Controller, ns: &Namespace, qpair: Qpair, args: &Args) -> Result<Rets> {
    debug!(?args, "ioworker starting");

    if args.read_percentage > 100 {
        return Err(DriverError::InvalidWorkerArgs("read_percentage over 100"));
    }
    if args.io_count == 0 && args.seconds == 0 {
        return Err(DriverError::InvalidWorkerArgs("neither io_count nor seconds bound set"));
    }
    if args.seconds > MAX_SECONDS {
        return Err(DriverError::InvalidWorkerArgs("seconds over 24 hours"));
    }
    if args.lba_size == 0 || args.lba_size > u16::MAX as u32 {
        return Err(DriverError::InvalidWorkerArgs("lba_size out of range"));
    }
    if args.lba_align == 0 {
        return Err(DriverError::InvalidWorkerArgs("lba_align must be nonzero"));
    }
    if args.region_start >= args.region_end {
        return Err(DriverError::InvalidWorkerArgs("empty region"));
    }
    if args.qdepth == 0 || args.qdepth as usize > CMD_LOG_DEPTH / 2 {
        return Err(DriverError::InvalidWorkerArgs("qdepth out of range"));
    }

    let mut rets = Rets::default();

    let bytes = args.lba_size as usize * ns.sector_size() as usize;
    if bytes > ctrl.max_transfer_bytes() {
        warn!(
            bytes,
            max = ctrl.max_transfer_bytes(),
            "IO size is larger than max xfer size"
        );
        rets.error = 0x0002; // Invalid Field in Command
        return Ok(rets);
    }

    // normalize the bounds and clamp the region to the namespace
    let io_count = if args.io_count == 0 { u64::MAX } else { args.io_count };
    let seconds = if args.seconds == 0 { MAX_SECONDS } else { args.seconds };
    let align = args.lba_align as u64;
    let region_start = align_up(args.region_start, align);
    let region_end = args
        .region_end
        .min(ns.num_sectors())
        .checked_sub(args.lba_size as u64 + 1)
        .map(|end| align_down(end, align))
        .ok_or(DriverError::InvalidWorkerArgs("region smaller than one io"))?;
    if region_start >= region_end {
        return Err(DriverError::InvalidWorkerArgs("region smaller than one io"));
    }
    let lba_start = args.lba_start.max(region_start);
    let qdepth = (args.qdepth as u64).min(io_count) as usize;

    rets.per_second = args
        .enable_per_second_counters
        .then(|| vec![0u64; seconds as usize + 1]);
    rets.latency_histogram = args
        .enable_latency_histogram
        .then(|| vec![0u32; US_PER_S as usize]);

    let start = Instant::now();
    let io_delay = if args.iops > 0 {
        Duration::from_micros(US_PER_S / args.iops as u64)
    } else {
        Duration::ZERO
    };

    let mut worker = Worker {
        rng: ctrl.driver().rng(),
        ctrl,
        ns,
        qpair,
        lba_size: args.lba_size as u16,
        lba_align: align,
        lba_random: args.lba_random,
        region_start,
        region_end,
        read_percentage: args.read_percentage as u64,
        io_count,
        due_time: start + Duration::from_secs(seconds as u64),
        io_delay,
        io_due_time: start + io_delay,
        time_next_sec: start + Duration::from_secs(1),
        cursor: lba_start,
        sent: 0,
        cplt: 0,
        finish: false,
        last_sec: 0,
        count_till_last_sec: 0,
        ctxs: (0..qdepth)
            .map(|_| IoContext {
                buf: DmaBuffer::zeroed(bytes),
                is_read: false,
                sent_at: start,
            })
            .collect(),
        completed: Rc::new(RefCell::new(VecDeque::new())),
        rets,
    };

    // prime the pipeline; everything after rides on completions
    for idx in 0..qdepth {
        worker.send_one(idx);
    }

    let budget = Duration::from_millis(seconds as u64 * 1000 + 10_000);
    while worker.sent != worker.cplt || !worker.finish {
        if start.elapsed() > budget {
            warn!("ioworker exceeded its wall-clock budget, aborting");
            worker.rets.timed_out = true;
            break;
        }

        worker.ctrl.process_completions(qpair, 0)?;
        loop {
            let next = worker.completed.borrow_mut().pop_front();
            match next {
                Some((idx, cpl)) => worker.on_completion(idx, &cpl),
                None => break,
            }
        }
    }

    worker.rets.mseconds = ((start.elapsed().as_micros() + 500) / 1000) as u32;

    // account the tail of the last (partial) second so the per-second
    // counters always sum to the completed io count
    if worker.rets.per_second.is_some() {
        let total = worker.rets.io_count_read + worker.rets.io_count_write;
        let residual = total - worker.count_till_last_sec;
        let last_sec = worker.last_sec;
        if let Some(per_second) = worker.rets.per_second.as_mut() {
            let bucket = last_sec.min(per_second.len() - 1);
            per_second[bucket] += residual;
            per_second.truncate((last_sec + 1).min(per_second.len()));
        }
    }

    debug!(
        reads = worker.rets.io_count_read,
        writes = worker.rets.io_count_write,
        mseconds = worker.rets.mseconds,
        error = worker.rets.error,
        "ioworker finished"
    );
    Ok(worker.rets)
}
