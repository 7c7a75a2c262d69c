//! Persistent worker pool turning draw item lists into command sequences.
//!
//! One coordinating thread plus `W` worker threads created once at startup.
//! Per frame, the coordinator publishes the flat draw item array read-only
//! together with a shared work cursor; workers pull variable numbers of
//! fixed-size chunks off the cursor (dynamic load balancing), encode each
//! chunk into a pre-sized command buffer owned by the current frame slot, and
//! push the result onto a shared FIFO. The coordinator submits sequences to
//! the device in arrival order. Ordering across workers carries no meaning;
//! every sequence re-binds its full state up front, so arrival order is a
//! valid replay order.
//!
//! Frame slots bound CPU/device pipelining: before a worker reuses slot
//! `frame % F` it waits on that slot's device fence, with a timeout so a hung
//! device surfaces as an error instead of blocking forever.

use std::{
    ops::Range,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use cadre_types::{Allocation, DrawItem, PoolOptions};
use parking_lot::Mutex;

use crate::{
    device::{Device, Fence},
    error::{FrameError, PoolError},
    exec::encode::{CommandEncoder, EncodedCommand, MAX_COMMANDS_PER_ITEM},
    util::math::round_up_div,
};

/// One worker's encoded output for one claimed chunk of the draw item array,
/// plus the metadata the device and the coordinator need to route it.
pub struct CommandSequence {
    pub worker: usize,
    pub slot: usize,
    pub frame: u64,
    /// Index of the first draw item this sequence covers.
    pub first_item: usize,
    /// Number of draw items covered.
    pub item_count: usize,
    /// Bind records emitted.
    pub state_changes: u32,
    commands: Vec<EncodedCommand>,
}

impl CommandSequence {
    pub fn commands(&self) -> &[EncodedCommand] {
        &self.commands
    }

    /// The encoded records as raw bytes.
    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.commands)
    }
}

/// Counters for one encoded frame.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FrameStatistics {
    pub frame: u64,
    pub draw_items: usize,
    pub sequences: usize,
    pub commands: usize,
    pub state_changes: usize,
    pub draws: usize,
}

/// Shared integer offset into the frame's draw item array. The sole piece of
/// shared mutable state during encoding.
struct WorkCursor {
    next: Mutex<usize>,
    len: usize,
}

impl WorkCursor {
    fn new(len: usize) -> Self {
        Self {
            next: Mutex::new(0),
            len,
        }
    }

    /// Atomically advances the cursor by up to `working_set` items. Returns
    /// `None` once the array is exhausted.
    fn claim(&self, working_set: usize) -> Option<Range<usize>> {
        let mut next = self.next.lock();
        if *next >= self.len {
            return None;
        }
        let start = *next;
        let count = working_set.min(self.len - start);
        *next += count;
        Some(start..start + count)
    }
}

struct FrameJob {
    frame: u64,
    items: Arc<Vec<DrawItem>>,
    locations: Arc<Vec<Allocation>>,
    cursor: WorkCursor,
}

enum WorkerCommand {
    Frame(Arc<FrameJob>),
    Stop,
}

enum Completion {
    Sequence(CommandSequence),
    /// Per-frame sentinel: this worker has exhausted the cursor. The frame is
    /// complete once one sentinel per worker has arrived.
    WorkerDone {
        worker: usize,
        result: Result<(), FrameError>,
    },
}

/// One of `F` rotating per-worker slots. Owns the pre-sized command buffers
/// for encoding and the device fence gating the slot's reuse. Nothing here is
/// ever touched by another worker.
struct FrameSlot {
    fence: Arc<dyn Fence>,
    buffers: Vec<Vec<EncodedCommand>>,
    /// Buffers come back from the coordinator on this channel after their
    /// sequence has been submitted.
    returns: flume::Receiver<Vec<EncodedCommand>>,
    buffer_count: usize,
    /// True while sequences encoded from this slot are still with the device.
    in_flight: bool,
}

impl FrameSlot {
    /// Gates slot reuse on the device having consumed the slot's previous
    /// submissions, then reclaims every loaned buffer. Skipped entirely when
    /// the slot's last use produced no sequences: the device never saw the
    /// slot, so its fence may never signal.
    fn acquire(&mut self, worker: usize, slot: usize, timeout: Duration) -> Result<(), FrameError> {
        if self.in_flight {
            self.fence
                .wait(timeout)
                .map_err(|_| FrameError::DeviceStall { worker, slot })?;
            while let Ok(buffer) = self.returns.try_recv() {
                self.buffers.push(buffer);
            }
            assert_eq!(
                self.buffers.len(),
                self.buffer_count,
                "coordinator did not return every command buffer before slot reuse"
            );
            self.in_flight = false;
        }
        Ok(())
    }

    fn pop_buffer(&mut self) -> Vec<EncodedCommand> {
        // Mid-frame returns may already have arrived.
        while let Ok(buffer) = self.returns.try_recv() {
            self.buffers.push(buffer);
        }
        self.buffers
            .pop()
            .expect("frame slot ran out of command buffers; the pool was sized for fewer draw items")
    }
}

struct WorkerContext {
    index: usize,
    working_set: usize,
    buffer_capacity: usize,
    slot_timeout: Duration,
    commands: flume::Receiver<WorkerCommand>,
    completions: flume::Sender<Completion>,
    slots: Vec<FrameSlot>,
}

struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    commands: flume::Sender<WorkerCommand>,
    /// Return channel per frame slot, for handing command buffers back.
    returns: Vec<flume::Sender<Vec<EncodedCommand>>>,
}

/// The coordinator-side handle. Owns the worker threads for the lifetime of
/// the renderer; dropping it shuts the pool down.
pub struct WorkerPool {
    device: Arc<dyn Device>,
    workers: Vec<WorkerHandle>,
    completions: flume::Receiver<Completion>,
    frames_in_flight: usize,
    working_set: usize,
    max_items: usize,
    frame: u64,
    poisoned: bool,
}

impl WorkerPool {
    /// Spawns the persistent workers and pre-sizes all per-slot storage for
    /// frames of up to `max_items` draw items. Worst-case sizing: a single
    /// worker may claim the entire list, so every slot carries
    /// `ceil(max_items / working_set)` buffers of
    /// `working_set * MAX_COMMANDS_PER_ITEM` records each.
    pub fn new(device: Arc<dyn Device>, options: &PoolOptions, max_items: usize) -> Result<Self, PoolError> {
        profiling::scope!("WorkerPool::new");

        if options.workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        if options.frames_in_flight < 2 {
            return Err(PoolError::TooFewFrameSlots {
                got: options.frames_in_flight,
            });
        }
        if options.working_set == 0 {
            return Err(PoolError::EmptyWorkingSet);
        }

        let buffer_count = round_up_div(max_items.max(1), options.working_set);
        let buffer_capacity = options.working_set * MAX_COMMANDS_PER_ITEM;

        let (completion_sender, completions) = flume::unbounded();

        let mut workers = Vec::with_capacity(options.workers);
        for index in 0..options.workers {
            let (command_sender, command_receiver) = flume::unbounded();

            let mut slots = Vec::with_capacity(options.frames_in_flight);
            let mut returns = Vec::with_capacity(options.frames_in_flight);
            for _ in 0..options.frames_in_flight {
                let (return_sender, return_receiver) = flume::unbounded();
                returns.push(return_sender);
                slots.push(FrameSlot {
                    fence: device.create_fence(),
                    buffers: (0..buffer_count).map(|_| Vec::with_capacity(buffer_capacity)).collect(),
                    returns: return_receiver,
                    buffer_count,
                    in_flight: false,
                });
            }

            let context = WorkerContext {
                index,
                working_set: options.working_set,
                buffer_capacity,
                slot_timeout: options.slot_timeout,
                commands: command_receiver,
                completions: completion_sender.clone(),
                slots,
            };
            let thread = thread::Builder::new()
                .name(format!("cadre worker {index}"))
                .spawn(move || worker_loop(context))
                .map_err(PoolError::WorkerSpawnFailed)?;

            workers.push(WorkerHandle {
                thread: Some(thread),
                commands: command_sender,
                returns,
            });
        }

        log::debug!(
            "worker pool online: {} workers, {} frame slots, working set {}, {} buffers per slot",
            options.workers,
            options.frames_in_flight,
            options.working_set,
            buffer_count,
        );

        Ok(Self {
            device,
            workers,
            completions,
            frames_in_flight: options.frames_in_flight,
            working_set: options.working_set,
            max_items,
            frame: 0,
            poisoned: false,
        })
    }

    /// Encodes and submits one frame.
    ///
    /// Publishes `items` read-only to all workers, then drains the completion
    /// FIFO, submitting each sequence to the device the moment it arrives.
    /// Returns once every worker's sentinel has been seen. Any failure
    /// poisons the pool; there is no per-frame retry.
    pub fn encode_frame(
        &mut self,
        items: Arc<Vec<DrawItem>>,
        locations: Arc<Vec<Allocation>>,
    ) -> Result<FrameStatistics, FrameError> {
        profiling::scope!("WorkerPool::encode_frame");

        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        assert!(
            items.len() <= self.max_items,
            "frame has {} draw items but the pool was sized for {}",
            items.len(),
            self.max_items,
        );

        let frame = self.frame;
        self.frame += 1;

        let job = Arc::new(FrameJob {
            frame,
            cursor: WorkCursor::new(items.len()),
            items,
            locations,
        });
        for worker in &self.workers {
            worker
                .commands
                .send(WorkerCommand::Frame(job.clone()))
                .expect("worker thread exited while the pool was alive");
        }

        let mut statistics = FrameStatistics {
            frame,
            draw_items: job.items.len(),
            ..FrameStatistics::default()
        };
        let mut failure: Option<FrameError> = None;
        let mut sentinels = 0;

        while sentinels < self.workers.len() {
            let completion = self
                .completions
                .recv()
                .expect("all workers disconnected mid-frame");
            match completion {
                Completion::Sequence(sequence) => {
                    statistics.sequences += 1;
                    statistics.commands += sequence.commands.len();
                    statistics.state_changes += sequence.state_changes as usize;
                    statistics.draws += sequence.item_count;

                    if failure.is_none() {
                        if let Err(inner) = self.device.submit(&sequence) {
                            failure = Some(FrameError::Submit(inner));
                        }
                    }

                    // Hand the buffer back even on failure so workers never
                    // starve during the drain.
                    let CommandSequence { worker, slot, commands, .. } = sequence;
                    let _ = self.workers[worker].returns[slot].send(commands);
                }
                Completion::WorkerDone { result, .. } => {
                    sentinels += 1;
                    if let Err(error) = result {
                        failure.get_or_insert(error);
                    }
                }
            }
        }

        self.device.frame_complete(frame);

        if let Some(error) = failure {
            self.poisoned = true;
            log::error!("frame {frame} failed: {error}");
            return Err(error);
        }

        log::trace!(
            "frame {frame}: {} items in {} sequences, {} state changes",
            statistics.draw_items,
            statistics.sequences,
            statistics.state_changes,
        );

        Ok(statistics)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn working_set(&self) -> usize {
        self.working_set
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            let _ = worker.commands.send(WorkerCommand::Stop);
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                thread.join().expect("worker thread panicked");
            }
        }
        log::debug!("worker pool shut down");
    }
}

fn worker_loop(mut context: WorkerContext) {
    while let Ok(command) = context.commands.recv() {
        match command {
            WorkerCommand::Frame(job) => {
                let result = encode_worker_frame(&mut context, &job);
                if context
                    .completions
                    .send(Completion::WorkerDone {
                        worker: context.index,
                        result,
                    })
                    .is_err()
                {
                    // Coordinator dropped mid-frame; nothing left to do.
                    return;
                }
            }
            WorkerCommand::Stop => return,
        }
    }
}

fn encode_worker_frame(context: &mut WorkerContext, job: &FrameJob) -> Result<(), FrameError> {
    profiling::scope!("worker encode");

    let slot_index = (job.frame % context.slots.len() as u64) as usize;
    let worker = context.index;
    let slot = &mut context.slots[slot_index];
    slot.acquire(worker, slot_index, context.slot_timeout)?;

    let mut sent = 0usize;
    while let Some(range) = job.cursor.claim(context.working_set) {
        let mut commands = slot.pop_buffer();
        commands.clear();

        let mut encoder = CommandEncoder::new(&job.locations);
        for item in &job.items[range.clone()] {
            encoder.encode(item, &mut commands);
        }
        assert!(
            commands.len() <= context.buffer_capacity,
            "command buffer outgrew its worst-case size"
        );

        let sequence = CommandSequence {
            worker,
            slot: slot_index,
            frame: job.frame,
            first_item: range.start,
            item_count: range.len(),
            state_changes: encoder.state_changes(),
            commands,
        };
        if context.completions.send(Completion::Sequence(sequence)).is_err() {
            // Coordinator is gone; the sentinel send will notice too.
            return Ok(());
        }
        sent += 1;
    }
    slot.in_flight = sent > 0;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use cadre_types::{
        Allocation, DrawItem, GeometryIndex, IndexRange, MaterialIndex, ObjectIndex, PoolOptions,
        TransformIndex,
    };
    use parking_lot::{Condvar, Mutex};

    use super::{CommandSequence, WorkerPool};
    use crate::{
        device::{Device, DeviceError, Fence, FenceTimeout, NullDevice},
        error::FrameError,
        exec::encode::OP_DRAW,
        util::typedefs::FastHashSet,
    };

    fn items(count: usize) -> Arc<Vec<DrawItem>> {
        Arc::new(
            (0..count)
                .map(|i| DrawItem {
                    geometry: GeometryIndex::new(0),
                    matrix: TransformIndex::new(i % 7),
                    material: MaterialIndex::new(i % 3),
                    object: ObjectIndex::new(i),
                    solid: true,
                    range: IndexRange::new((i * 24) as u32, 6),
                })
                .collect(),
        )
    }

    fn locations() -> Arc<Vec<Allocation>> {
        Arc::new(vec![Allocation::default()])
    }

    fn options(workers: usize, working_set: usize) -> PoolOptions {
        PoolOptions {
            workers,
            frames_in_flight: 2,
            working_set,
            slot_timeout: Duration::from_secs(1),
        }
    }

    /// Records every submitted sequence; otherwise behaves like NullDevice.
    #[derive(Default)]
    struct RecordingDevice {
        inner: NullDevice,
        submissions: Mutex<Vec<(u64, usize, usize, usize)>>,
    }

    impl Device for RecordingDevice {
        fn realize_chunk(&self, _chunk: u32, _vertex: &[u8], _index: &[u8]) -> Result<(), DeviceError> {
            Ok(())
        }

        fn submit(&self, sequence: &CommandSequence) -> Result<(), DeviceError> {
            let draws = sequence.commands().iter().filter(|c| c.op == OP_DRAW).count();
            self.submissions
                .lock()
                .push((sequence.frame, sequence.first_item, sequence.item_count, draws));
            Ok(())
        }

        fn create_fence(&self) -> Arc<dyn Fence> {
            self.inner.create_fence()
        }

        fn frame_complete(&self, frame: u64) {
            self.inner.frame_complete(frame);
        }
    }

    #[test]
    fn every_item_is_claimed_exactly_once() {
        let device = Arc::new(RecordingDevice::default());
        let mut pool = WorkerPool::new(device.clone(), &options(4, 16), 1000).unwrap();

        let statistics = pool.encode_frame(items(1000), locations()).unwrap();
        assert_eq!(statistics.draw_items, 1000);
        assert_eq!(statistics.draws, 1000);

        let submissions = device.submissions.lock();
        let mut seen = FastHashSet::default();
        for &(frame, first_item, item_count, draws) in submissions.iter() {
            assert_eq!(frame, 0);
            assert_eq!(item_count, draws, "one draw record per item");
            for item in first_item..first_item + item_count {
                assert!(seen.insert(item), "item {item} encoded twice");
            }
        }
        assert_eq!(seen.len(), 1000, "every item encoded exactly once");
    }

    #[test]
    fn frames_pipeline_through_all_slots() {
        let device = Arc::new(RecordingDevice::default());
        let mut pool = WorkerPool::new(device.clone(), &options(2, 8), 100).unwrap();

        // More frames than slots forces every slot through the
        // fence-wait/reclaim path.
        for frame in 0..5u64 {
            let statistics = pool.encode_frame(items(100), locations()).unwrap();
            assert_eq!(statistics.frame, frame);
            assert_eq!(statistics.draws, 100);
        }

        let total: usize = device.submissions.lock().iter().map(|&(_, _, count, _)| count).sum();
        assert_eq!(total, 500);
    }

    #[test]
    fn empty_frame_completes() {
        let device = Arc::new(NullDevice::new());
        let mut pool = WorkerPool::new(device, &options(3, 8), 0).unwrap();

        let statistics = pool.encode_frame(Arc::new(Vec::new()), locations()).unwrap();

        assert_eq!(statistics.sequences, 0);
        assert_eq!(statistics.draws, 0);
    }

    #[test]
    fn uneven_item_counts_split_cleanly() {
        let device = Arc::new(RecordingDevice::default());
        let mut pool = WorkerPool::new(device.clone(), &options(3, 16), 50).unwrap();

        // 50 items with a working set of 16: chunks of 16, 16, 16, 2.
        pool.encode_frame(items(50), locations()).unwrap();

        let submissions = device.submissions.lock();
        let mut counts: Vec<usize> = submissions.iter().map(|&(_, _, count, _)| count).collect();
        counts.sort_unstable();
        assert_eq!(counts, [2, 16, 16, 16]);
    }

    /// Signalable fence for the mock devices below.
    struct TestFence {
        signaled: Mutex<bool>,
        condvar: Condvar,
    }

    impl TestFence {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                signaled: Mutex::new(false),
                condvar: Condvar::new(),
            })
        }

        fn signal(&self) {
            *self.signaled.lock() = true;
            self.condvar.notify_all();
        }
    }

    impl Fence for TestFence {
        fn wait(&self, timeout: Duration) -> Result<(), FenceTimeout> {
            let mut signaled = self.signaled.lock();
            while !*signaled {
                if self.condvar.wait_for(&mut signaled, timeout).timed_out() && !*signaled {
                    return Err(FenceTimeout);
                }
            }
            *signaled = false;
            Ok(())
        }
    }

    /// Device holding the narrowest reading of the fence contract: it signals
    /// only the fences of slots it actually received submissions from.
    struct StrictDevice {
        frames_in_flight: usize,
        fences: Mutex<Vec<Arc<TestFence>>>,
        pending: Mutex<FastHashSet<(usize, usize)>>,
    }

    impl StrictDevice {
        fn new(frames_in_flight: usize) -> Self {
            Self {
                frames_in_flight,
                fences: Mutex::new(Vec::new()),
                pending: Mutex::new(FastHashSet::default()),
            }
        }
    }

    impl Device for StrictDevice {
        fn realize_chunk(&self, _chunk: u32, _vertex: &[u8], _index: &[u8]) -> Result<(), DeviceError> {
            Ok(())
        }

        fn submit(&self, sequence: &CommandSequence) -> Result<(), DeviceError> {
            self.pending.lock().insert((sequence.worker, sequence.slot));
            Ok(())
        }

        fn create_fence(&self) -> Arc<dyn Fence> {
            let fence = TestFence::new();
            self.fences.lock().push(fence.clone());
            fence
        }

        fn frame_complete(&self, _frame: u64) {
            // Fences are created worker-major at pool startup.
            let fences = self.fences.lock();
            for (worker, slot) in self.pending.lock().drain() {
                fences[worker * self.frames_in_flight + slot].signal();
            }
        }
    }

    #[test]
    fn idle_slots_are_reused_without_a_fence_wait() {
        // Far fewer items than workers * working_set: most workers claim no
        // chunk, so their slots submit nothing and their fences never signal.
        // Reusing those slots must not wait on the fence.
        let device = Arc::new(StrictDevice::new(2));
        let mut pool = WorkerPool::new(
            device,
            &PoolOptions {
                workers: 4,
                frames_in_flight: 2,
                working_set: 64,
                slot_timeout: Duration::from_millis(50),
            },
            8,
        )
        .unwrap();

        for _ in 0..6 {
            let statistics = pool.encode_frame(items(8), locations()).unwrap();
            assert_eq!(statistics.draws, 8);
        }
    }

    /// Device whose fences never signal: every slot reuse stalls.
    struct StalledDevice;

    struct NeverFence;
    impl Fence for NeverFence {
        fn wait(&self, timeout: Duration) -> Result<(), FenceTimeout> {
            std::thread::sleep(timeout);
            Err(FenceTimeout)
        }
    }

    impl Device for StalledDevice {
        fn realize_chunk(&self, _chunk: u32, _vertex: &[u8], _index: &[u8]) -> Result<(), DeviceError> {
            Ok(())
        }
        fn submit(&self, _sequence: &CommandSequence) -> Result<(), DeviceError> {
            Ok(())
        }
        fn create_fence(&self) -> Arc<dyn Fence> {
            Arc::new(NeverFence)
        }
        fn frame_complete(&self, _frame: u64) {}
    }

    #[test]
    fn a_stalled_device_poisons_the_pool() {
        let mut pool = WorkerPool::new(
            Arc::new(StalledDevice),
            &PoolOptions {
                workers: 1,
                frames_in_flight: 2,
                working_set: 8,
                slot_timeout: Duration::from_millis(10),
            },
            10,
        )
        .unwrap();

        // Slots 0 and 1 have never been used; the first two frames pass.
        pool.encode_frame(items(10), locations()).unwrap();
        pool.encode_frame(items(10), locations()).unwrap();

        // Frame 2 reuses slot 0, whose fence never signals.
        let error = pool.encode_frame(items(10), locations()).unwrap_err();
        assert!(matches!(error, FrameError::DeviceStall { worker: 0, slot: 0 }));

        let error = pool.encode_frame(items(10), locations()).unwrap_err();
        assert!(matches!(error, FrameError::Poisoned));
    }

    #[test]
    fn bad_configurations_are_rejected() {
        let device: Arc<NullDevice> = Arc::new(NullDevice::new());
        assert!(WorkerPool::new(device.clone(), &options(0, 8), 10).is_err());
        assert!(WorkerPool::new(device.clone(), &options(2, 0), 10).is_err());
        assert!(
            WorkerPool::new(
                device,
                &PoolOptions {
                    frames_in_flight: 1,
                    ..options(2, 8)
                },
                10,
            )
            .is_err()
        );
    }

    #[test]
    fn shutdown_joins_all_workers() {
        let device = Arc::new(NullDevice::new());
        let mut pool = WorkerPool::new(device, &options(4, 8), 100).unwrap();
        pool.encode_frame(items(100), locations()).unwrap();
        // Drop joins every worker; a hang here fails the test by timeout.
        drop(pool);
    }
}
