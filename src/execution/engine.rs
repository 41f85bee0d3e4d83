//! Chunk scheduler.
//!
//! Chunks of the requested selection are evaluated on the engine's rayon
//! pool and streamed through a bounded crossbeam channel to the calling
//! thread, which alone drives the sink.

use crate::core::error::{ChunkError, CubeError, CubeResult};
use crate::core::types::ChunkData;
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{contains_streaming, CubeRef};
use crate::execution::config::Engine;
use crate::execution::progress::ProgressTracker;
use crate::execution::swarm::{ChunkWorker, LocalWorker, SwarmWorker};
use crate::sinks::ChunkSink;
use crossbeam::channel;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How chunk failures affect an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// The first failure aborts the evaluation.
    Fatal,
    /// Failed chunks are written as nodata.
    Tolerant,
    /// Tolerant for recoverable errors when the graph streams to external
    /// processes, fatal otherwise.
    #[default]
    Auto,
}

impl ErrorPolicy {
    /// Whether `error` is replaced by a nodata chunk.
    pub fn tolerates(&self, error: &ChunkError, streaming: bool) -> bool {
        match self {
            ErrorPolicy::Fatal => false,
            ErrorPolicy::Tolerant => true,
            ErrorPolicy::Auto => streaming && error.is_recoverable(),
        }
    }
}

/// Which chunks to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChunkSelection {
    /// Every chunk of the cube.
    #[default]
    All,
    /// Only the listed chunks; duplicates are evaluated once.
    Only(Vec<ChunkId>),
}

impl ChunkSelection {
    /// Resolve to chunk ids of `view`, in ascending order.
    pub fn resolve(&self, view: &CubeView) -> Result<Vec<ChunkId>, ChunkError> {
        match self {
            ChunkSelection::All => Ok(view.chunks().collect()),
            ChunkSelection::Only(ids) => {
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                for id in &ids {
                    view.chunk_coords(*id)?;
                }
                Ok(ids)
            }
        }
    }
}

/// Outcome of a successful evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Chunks in the selection.
    pub chunks_total: usize,
    /// Chunks handed to the sink, including nodata replacements.
    pub chunks_written: usize,
    /// Chunks replaced by nodata after a tolerated failure.
    pub failed_chunks: Vec<ChunkId>,
    /// Wall time.
    pub duration: Duration,
}

/// Evaluates cubes chunk by chunk.
#[derive(Debug, Clone)]
pub struct ChunkScheduler {
    pool: Arc<rayon::ThreadPool>,
    worker: Arc<dyn ChunkWorker>,
    policy: ErrorPolicy,
    queue: usize,
}

impl ChunkScheduler {
    /// Scheduler using the engine's pool and configuration.
    ///
    /// With swarm endpoints configured, chunks are computed remotely.
    pub fn new(engine: &Engine) -> Self {
        let config = engine.config();
        let worker: Arc<dyn ChunkWorker> = if config.swarm.is_empty() {
            Arc::new(LocalWorker)
        } else {
            Arc::new(SwarmWorker::new(
                &config.swarm,
                Duration::from_secs_f64(config.stream_timeout_secs),
            ))
        };
        Self {
            pool: engine.pool(),
            worker,
            policy: config.error_policy,
            queue: config.chunk_queue.max(1),
        }
    }

    /// Replace the chunk worker.
    pub fn with_worker(mut self, worker: Arc<dyn ChunkWorker>) -> Self {
        self.worker = worker;
        self
    }

    /// Override the error policy.
    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Evaluate `selection` of `cube` into `sink`.
    pub fn run(
        &self,
        cube: &CubeRef,
        selection: ChunkSelection,
        sink: &mut dyn ChunkSink,
    ) -> CubeResult<EvaluationReport> {
        self.run_tracked(cube, selection, sink, ProgressTracker::new_shared())
    }

    /// Evaluate with a caller-owned tracker, which can cancel from another thread.
    ///
    /// After cancellation, chunks already being computed are still delivered
    /// to the sink, no further chunks start, `finish` is not called and the
    /// result is [`CubeError::Cancelled`].
    pub fn run_tracked(
        &self,
        cube: &CubeRef,
        selection: ChunkSelection,
        sink: &mut dyn ChunkSink,
        tracker: Arc<ProgressTracker>,
    ) -> CubeResult<EvaluationReport> {
        let started = Instant::now();
        let ids = selection.resolve(cube.view())?;
        let total = ids.len();
        let streaming = contains_streaming(cube.as_ref());
        info!(
            "Evaluating {} chunks of {} cube {} with {} ({} threads, {:?} policy)",
            total,
            cube.kind(),
            cube.id(),
            self.worker.name(),
            self.pool.current_num_threads(),
            self.policy
        );

        sink.begin(cube.as_ref())?;
        tracker.start(total);

        let mut report = EvaluationReport {
            chunks_total: total,
            ..EvaluationReport::default()
        };
        let mut failure: Option<CubeError> = None;
        let (tx, rx) = channel::bounded::<(ChunkId, Result<ChunkData, ChunkError>, Duration)>(self.queue);

        std::thread::scope(|scope| {
            let producer_tracker = tracker.clone();
            let ids = &ids;
            scope.spawn(move || {
                self.pool.install(|| {
                    ids.par_iter().for_each_with(tx, |tx, &id| {
                        if producer_tracker.is_cancelled() {
                            return;
                        }
                        let chunk_started = Instant::now();
                        let result = self.worker.compute(cube.as_ref(), id);
                        let _ = tx.send((id, result, chunk_started.elapsed()));
                    });
                });
            });

            for (id, result, elapsed) in rx.iter() {
                if failure.is_some() {
                    continue;
                }
                let chunk = match result {
                    Ok(chunk) => chunk,
                    Err(e) if self.policy.tolerates(&e, streaming) => {
                        warn!("Chunk {} failed, writing nodata: {}", id, e);
                        tracker.chunk_failed(id, e.to_string(), true);
                        report.failed_chunks.push(id);
                        match nodata_chunk(cube, id) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                failure = Some(CubeError::ChunkFailed { chunk: id, source: e });
                                tracker.cancel();
                                continue;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Chunk {} failed: {}", id, e);
                        tracker.chunk_failed(id, e.to_string(), false);
                        failure = Some(CubeError::ChunkFailed { chunk: id, source: e });
                        tracker.cancel();
                        continue;
                    }
                };
                if let Err(e) = sink.consume(id, chunk) {
                    error!("Sink rejected chunk {}: {}", id, e);
                    failure = Some(CubeError::Sink(e));
                    tracker.cancel();
                    continue;
                }
                report.chunks_written += 1;
                tracker.chunk_completed(id, elapsed.as_millis() as u64);
                debug!("Chunk {} done in {:?}", id, elapsed);
            }
        });

        if let Some(e) = failure {
            tracker.complete();
            return Err(e);
        }
        if tracker.is_cancelled() && report.chunks_written < total {
            tracker.complete();
            return Err(CubeError::Cancelled {
                completed: report.chunks_written,
                total,
            });
        }

        sink.finish()?;
        report.failed_chunks.sort_unstable();
        report.duration = started.elapsed();
        tracker.complete();
        info!(
            "Evaluated {} chunks in {:?} ({} failed)",
            report.chunks_written,
            report.duration,
            report.failed_chunks.len()
        );
        Ok(report)
    }
}

fn nodata_chunk(cube: &CubeRef, id: ChunkId) -> Result<ChunkData, ChunkError> {
    let region = cube.view().chunk_region(id)?;
    let [t, y, x] = region.size;
    Ok(ChunkData::nodata([cube.bands().len(), t, y, x], cube.nodata()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ChunkResult;
    use crate::core::reducer::Reducer;
    use crate::core::types::BandCollection;
    use crate::core::view::tests::test_view;
    use crate::core::view::ChunkShape;
    use crate::cubes::testing::{assert_same, grid_cube, materialize, small_view};
    use crate::cubes::{
        ApplyPixelCube, Cube, DummyCube, ReduceTimeCube, StreamCommand, StreamCube,
    };
    use crate::execution::config::EngineConfig;
    use crate::execution::swarm::tests::spawn_server;
    use crate::graph::registry::CollectionRegistry;
    use crate::graph::serialization::CubeSpec;
    use crate::sinks::MemorySink;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(threads: usize, policy: ErrorPolicy) -> Engine {
        Engine::init(
            EngineConfig::default()
                .with_threads(threads)
                .with_error_policy(policy),
        )
        .unwrap()
    }

    /// Fails every chunk whose id is listed.
    #[derive(Debug)]
    struct FailingCube {
        input: CubeRef,
        failing: Vec<ChunkId>,
        recoverable: bool,
    }

    impl Cube for FailingCube {
        fn id(&self) -> crate::core::error::CubeId {
            self.input.id()
        }
        fn kind(&self) -> &'static str {
            "failing"
        }
        fn view(&self) -> &CubeView {
            self.input.view()
        }
        fn bands(&self) -> &BandCollection {
            self.input.bands()
        }
        fn nodata(&self) -> f64 {
            self.input.nodata()
        }
        fn read_chunk(&self, id: ChunkId) -> ChunkResult<ChunkData> {
            if !self.failing.contains(&id) {
                return self.input.read_chunk(id);
            }
            if self.recoverable {
                Err(ChunkError::AssetRead {
                    asset: "broken.tif".to_string(),
                    reason: "truncated".to_string(),
                })
            } else {
                Err(ChunkError::Other("bad chunk".to_string()))
            }
        }
        fn to_spec(&self) -> CubeSpec {
            self.input.to_spec()
        }
        fn is_streaming(&self) -> bool {
            true
        }
    }

    fn failing(recoverable: bool) -> CubeRef {
        Arc::new(FailingCube {
            input: grid_cube(&small_view(), &["B1"], |_, t, y, x| (t + y + x) as f64),
            failing: vec![ChunkId(2), ChunkId(5)],
            recoverable,
        })
    }

    #[test]
    fn test_run_matches_direct_reads() {
        let cube = grid_cube(&small_view(), &["B1", "B2"], |b, t, y, x| {
            (b * 1000 + t * 100 + y * 10 + x) as f64
        });
        let scheduler = ChunkScheduler::new(&engine(3, ErrorPolicy::Fatal));
        let mut sink = MemorySink::new();
        let report = scheduler.run(&cube, ChunkSelection::All, &mut sink).unwrap();
        assert_eq!(report.chunks_total, 8);
        assert_eq!(report.chunks_written, 8);
        assert!(report.failed_chunks.is_empty());
        assert!(sink.is_finished());
        assert_same(
            sink.assemble().unwrap().as_slice(),
            materialize(cube.as_ref()).as_slice(),
        );
    }

    #[test]
    fn test_selection() {
        let view = small_view();
        let ids = ChunkSelection::Only(vec![ChunkId(3), ChunkId(1), ChunkId(3)])
            .resolve(&view)
            .unwrap();
        assert_eq!(ids, vec![ChunkId(1), ChunkId(3)]);
        assert!(matches!(
            ChunkSelection::Only(vec![ChunkId(8)]).resolve(&view),
            Err(ChunkError::OutOfRange { .. })
        ));

        let cube = grid_cube(&view, &["B1"], |_, _, _, _| 1.0);
        let scheduler = ChunkScheduler::new(&engine(2, ErrorPolicy::Fatal));
        let mut sink = MemorySink::new();
        let report = scheduler
            .run(&cube, ChunkSelection::Only(vec![ChunkId(4)]), &mut sink)
            .unwrap();
        assert_eq!(report.chunks_written, 1);
        assert!(sink.get(ChunkId(4)).is_some());
        assert!(sink.get(ChunkId(0)).is_none());
    }

    #[test]
    fn test_fatal_policy_aborts() {
        let scheduler = ChunkScheduler::new(&engine(2, ErrorPolicy::Fatal));
        let mut sink = MemorySink::new();
        let err = scheduler
            .run(&failing(true), ChunkSelection::All, &mut sink)
            .unwrap_err();
        assert!(matches!(err.chunk(), Some(ChunkId(2)) | Some(ChunkId(5))));
        assert!(!sink.is_finished());
    }

    #[test]
    fn test_tolerant_policy_writes_nodata() {
        let scheduler = ChunkScheduler::new(&engine(4, ErrorPolicy::Tolerant));
        let mut sink = MemorySink::new();
        let report = scheduler
            .run(&failing(false), ChunkSelection::All, &mut sink)
            .unwrap();
        assert_eq!(report.chunks_written, 8);
        assert_eq!(report.failed_chunks, vec![ChunkId(2), ChunkId(5)]);
        assert!(sink.get(ChunkId(2)).unwrap().is_all_nodata());
        assert!(!sink.get(ChunkId(3)).unwrap().is_all_nodata());
    }

    #[test]
    fn test_auto_policy() {
        // Recoverable errors in a streaming graph are tolerated.
        let scheduler = ChunkScheduler::new(&engine(2, ErrorPolicy::Auto));
        let mut sink = MemorySink::new();
        let report = scheduler
            .run(&failing(true), ChunkSelection::All, &mut sink)
            .unwrap();
        assert_eq!(report.failed_chunks.len(), 2);

        let mut sink = MemorySink::new();
        assert!(scheduler
            .run(&failing(false), ChunkSelection::All, &mut sink)
            .is_err());
        assert!(ErrorPolicy::Auto.tolerates(
            &ChunkError::StreamMalformed { reason: String::new() },
            true
        ));
        assert!(!ErrorPolicy::Auto.tolerates(
            &ChunkError::StreamMalformed { reason: String::new() },
            false
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_stream_is_tolerated_by_default() {
        let input = grid_cube(&small_view(), &["B1"], |_, _, _, _| 1.0);
        let cube: CubeRef = Arc::new(StreamCube::new(input, StreamCommand::new("false"), None).unwrap());
        let scheduler = ChunkScheduler::new(&engine(2, ErrorPolicy::default()));
        let mut sink = MemorySink::new();
        let report = scheduler.run(&cube, ChunkSelection::All, &mut sink).unwrap();
        assert_eq!(report.failed_chunks.len(), 8);
        assert!(sink.assemble().unwrap().is_all_nodata());
    }

    /// Counts chunk reads and cancels the tracker on the first one.
    #[derive(Debug)]
    struct CancellingCube {
        input: CubeRef,
        tracker: Arc<ProgressTracker>,
        reads: AtomicUsize,
    }

    impl Cube for CancellingCube {
        fn id(&self) -> crate::core::error::CubeId {
            self.input.id()
        }
        fn kind(&self) -> &'static str {
            "cancelling"
        }
        fn view(&self) -> &CubeView {
            self.input.view()
        }
        fn bands(&self) -> &BandCollection {
            self.input.bands()
        }
        fn nodata(&self) -> f64 {
            self.input.nodata()
        }
        fn read_chunk(&self, id: ChunkId) -> ChunkResult<ChunkData> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.tracker.cancel();
            self.input.read_chunk(id)
        }
        fn to_spec(&self) -> CubeSpec {
            self.input.to_spec()
        }
    }

    #[test]
    fn test_cancellation() {
        let view = test_view(16, 4, 4, ChunkShape::new(1, 2, 2));
        let tracker = ProgressTracker::new_shared();
        let cube = Arc::new(CancellingCube {
            input: Arc::new(DummyCube::new(view, 1, 1.0).unwrap()),
            tracker: tracker.clone(),
            reads: AtomicUsize::new(0),
        });
        let as_ref: CubeRef = cube.clone();
        let scheduler = ChunkScheduler::new(&engine(2, ErrorPolicy::Fatal));
        let mut sink = MemorySink::new();
        let err = scheduler
            .run_tracked(&as_ref, ChunkSelection::All, &mut sink, tracker)
            .unwrap_err();
        match err {
            CubeError::Cancelled { completed, total } => {
                assert_eq!(total, 64);
                assert_eq!(completed, cube.reads.load(Ordering::SeqCst));
                assert!(completed <= 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!sink.is_finished());
        assert_eq!(sink.len(), cube.reads.load(Ordering::SeqCst));
    }

    #[test]
    fn test_swarm_matches_local() {
        let address = spawn_server(CollectionRegistry::new());
        let view = test_view(5, 3, 4, ChunkShape::new(2, 2, 2));
        let dummy: CubeRef = Arc::new(DummyCube::new(view, 2, 3.0).unwrap());
        let applied: CubeRef =
            Arc::new(ApplyPixelCube::new(dummy, &["band1 + band2"], &["sum"], false).unwrap());
        let cube: CubeRef = Arc::new(ReduceTimeCube::single(applied, Reducer::Sum).unwrap());

        let swarm = Engine::init(
            EngineConfig::default()
                .with_threads(2)
                .with_swarm(vec![address.clone(), address]),
        )
        .unwrap();
        let mut remote = MemorySink::new();
        ChunkScheduler::new(&swarm)
            .run(&cube, ChunkSelection::All, &mut remote)
            .unwrap();
        let remote = remote.assemble().unwrap();
        assert!(remote.as_slice().iter().all(|&v| v == 30.0));
        assert_same(remote.as_slice(), materialize(cube.as_ref()).as_slice());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn test_thread_count_does_not_change_results(threads in 1usize..6, seed in 0u32..1000) {
            let cube = grid_cube(&small_view(), &["B1"], move |_, t, y, x| {
                ((t * 31 + y * 7 + x) as u32 ^ seed) as f64
            });
            let reduced: CubeRef = Arc::new(ReduceTimeCube::single(cube, Reducer::Median).unwrap());

            let mut single = MemorySink::new();
            ChunkScheduler::new(&engine(1, ErrorPolicy::Fatal))
                .run(&reduced, ChunkSelection::All, &mut single)
                .unwrap();
            let mut many = MemorySink::new();
            ChunkScheduler::new(&engine(threads, ErrorPolicy::Fatal))
                .run(&reduced, ChunkSelection::All, &mut many)
                .unwrap();
            let a = single.assemble().unwrap();
            let b = many.assemble().unwrap();
            prop_assert_eq!(a.as_slice(), b.as_slice());
        }
    }
}
