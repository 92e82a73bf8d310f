// THEORY:
// The `parallel_pipeline` module runs one `BlinkPipeline` per camera stream, each on
// its own tokio task. Streams share nothing but the (cloned) configuration and code
// catalogue; a marker tracked by one camera is invisible to the others.
//
// Key architectural principles:
// 1.  **Owned Workers**: Every worker owns its pipeline outright and is fed through an
//     unbounded mpsc channel, so frames of one stream are always processed in
//     submission order.
// 2.  **Request/Reply**: Callers that need the frame summary back attach a oneshot
//     sender to the frame; fire-and-forget callers don't.
// 3.  **Consumer Bypass**: Reading results does not go through the worker's queue.
//     Each stream exposes its `ResultsHandle`, which takes the pipeline's store lock
//     directly, so a result query never waits behind a backlog of frames.

use crate::core_modules::catalogue::Catalogue;
use crate::core_modules::point_state::Frame;
use crate::core_modules::tracker::FrameSummary;
use crate::error::{ConfigError, PoolError};
use crate::pipeline::{BlinkPipeline, PipelineConfig, ResultsHandle, SignalReport};
use futures::future::join_all;
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Messages understood by a stream worker.
pub enum StreamCommand {
    Frame {
        frame: Frame,
        reply: Option<oneshot::Sender<FrameSummary>>,
    },
    Framerate(f64),
    Shutdown,
}

struct StreamWorker {
    name: String,
    sender: mpsc::UnboundedSender<StreamCommand>,
    results: ResultsHandle,
    task: JoinHandle<()>,
}

/// A set of independent per-stream pipelines.
pub struct StreamPool {
    streams: Vec<StreamWorker>,
}

impl StreamPool {
    /// Spawns one worker per stream name. Must be called from within a tokio runtime.
    pub fn new(
        config: PipelineConfig,
        catalogue: Catalogue,
        stream_names: Vec<String>,
    ) -> Result<Self, ConfigError> {
        if stream_names.is_empty() {
            return Err(ConfigError::invalid("streams", "at least one stream is required"));
        }
        let mut seen = HashSet::new();
        for name in &stream_names {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid("streams", "stream names must not be empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::invalid(
                    "streams",
                    format!("duplicate stream name `{name}`"),
                ));
            }
        }

        let mut streams = Vec::with_capacity(stream_names.len());
        for name in stream_names {
            let pipeline = BlinkPipeline::new(config.clone(), catalogue.clone())?;
            let results = pipeline.results_handle();
            let (sender, receiver) = mpsc::unbounded_channel::<StreamCommand>();
            let task = tokio::spawn(Self::run_stream(name.clone(), pipeline, receiver));
            streams.push(StreamWorker {
                name,
                sender,
                results,
                task,
            });
        }
        tracing::info!("stream pool started with {} streams", streams.len());
        Ok(Self { streams })
    }

    async fn run_stream(
        name: String,
        mut pipeline: BlinkPipeline,
        mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    ) {
        while let Some(command) = commands.recv().await {
            match command {
                StreamCommand::Frame { frame, reply } => {
                    let summary = pipeline.process_frame(&frame);
                    if let Some(reply) = reply {
                        let _ = reply.send(summary);
                    }
                }
                StreamCommand::Framerate(framerate) => {
                    pipeline.update_framerate(framerate);
                }
                StreamCommand::Shutdown => break,
            }
        }
        tracing::debug!("stream `{}` worker stopped", name);
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream_names(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(|s| s.name.as_str())
    }

    pub fn stream_index(&self, name: &str) -> Option<usize> {
        self.streams.iter().position(|s| s.name == name)
    }

    fn worker(&self, stream: usize) -> Result<&StreamWorker, PoolError> {
        self.streams.get(stream).ok_or(PoolError::UnknownStream(stream))
    }

    fn send(&self, stream: usize, command: StreamCommand) -> Result<(), PoolError> {
        let worker = self.worker(stream)?;
        worker
            .sender
            .send(command)
            .map_err(|_| PoolError::WorkerGone(worker.name.clone()))
    }

    /// Queues a frame without waiting for it to be processed.
    pub fn submit(&self, stream: usize, frame: Frame) -> Result<(), PoolError> {
        self.send(stream, StreamCommand::Frame { frame, reply: None })
    }

    /// Queues a frame and waits for its summary.
    pub async fn process(&self, stream: usize, frame: Frame) -> Result<FrameSummary, PoolError> {
        let (reply, summary) = oneshot::channel();
        self.send(
            stream,
            StreamCommand::Frame {
                frame,
                reply: Some(reply),
            },
        )?;
        let name = &self.worker(stream)?.name;
        summary.await.map_err(|_| PoolError::WorkerGone(name.clone()))
    }

    pub fn update_framerate(&self, stream: usize, framerate: f64) -> Result<(), PoolError> {
        self.send(stream, StreamCommand::Framerate(framerate))
    }

    /// Current decoded results of one stream. Reflects every frame the worker has
    /// finished, not frames still queued.
    pub fn results(&self, stream: usize) -> Result<Vec<SignalReport>, PoolError> {
        Ok(self.worker(stream)?.results.results())
    }

    /// Results of every stream, read concurrently off the async threads.
    pub async fn results_all(&self) -> Result<Vec<(String, Vec<SignalReport>)>, PoolError> {
        let reads = self.streams.iter().map(|worker| {
            let handle = worker.results.clone();
            let name = worker.name.clone();
            async move {
                match tokio::task::spawn_blocking(move || handle.results()).await {
                    Ok(reports) => Ok((name, reports)),
                    Err(_) => Err(PoolError::WorkerGone(name)),
                }
            }
        });
        join_all(reads).await.into_iter().collect()
    }

    /// Stops every worker after it has drained the frames queued before the call.
    pub async fn shutdown(self) {
        for worker in &self.streams {
            let _ = worker.sender.send(StreamCommand::Shutdown);
        }
        for worker in self.streams {
            if let Err(e) = worker.task.await {
                tracing::warn!("stream `{}` worker ended abnormally: {}", worker.name, e);
            }
        }
        tracing::info!("stream pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::point_state::Point2;

    fn catalogue() -> Catalogue {
        let bits = |s: &str| s.chars().map(|c| c == '1').collect::<Vec<bool>>();
        Catalogue::new(vec![bits("110100"), bits("111010")]).expect("catalogue")
    }

    fn pool(names: &[&str]) -> StreamPool {
        let names = names.iter().map(|n| n.to_string()).collect();
        StreamPool::new(PipelineConfig::default(), catalogue(), names).expect("pool")
    }

    fn frame(stamp: f64, points: &[(f64, f64)]) -> Frame {
        Frame::new(stamp, points.iter().map(|(x, y)| Point2::new(*x, *y)).collect())
    }

    #[tokio::test]
    async fn stream_names_must_be_unique_and_present() {
        let names = |v: &[&str]| v.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        assert!(StreamPool::new(PipelineConfig::default(), catalogue(), vec![]).is_err());
        for streams in [names(&["cam0", ""]), names(&["cam0", "cam0"])] {
            assert!(StreamPool::new(PipelineConfig::default(), catalogue(), streams).is_err());
        }
    }

    #[tokio::test]
    async fn process_returns_the_frame_summary() {
        let pool = pool(&["cam0"]);
        let summary = pool
            .process(0, frame(0.0, &[(10.0, 10.0), (40.0, 40.0)]))
            .await
            .expect("summary");
        assert_eq!(summary.new_sequences, 2);
        assert_eq!(summary.live_sequences, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_streams_are_reported() {
        let pool = pool(&["cam0"]);
        assert_eq!(pool.submit(3, frame(0.0, &[])), Err(PoolError::UnknownStream(3)));
        assert!(matches!(pool.results(1), Err(PoolError::UnknownStream(1))));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn streams_do_not_share_sequences() {
        let pool = pool(&["left", "right"]);
        assert_eq!(pool.stream_index("right"), Some(1));
        for k in 0..3 {
            pool.submit(0, frame(k as f64, &[(10.0, 10.0)])).expect("submit");
        }
        // The reply arrives after every earlier frame of the stream was handled.
        pool.process(0, frame(3.0, &[(10.0, 10.0)])).await.expect("summary");
        pool.process(1, frame(0.0, &[(10.0, 10.0), (90.0, 90.0), (200.0, 20.0)]))
            .await
            .expect("summary");

        let all = pool.results_all().await.expect("results");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "left");
        assert_eq!(all[0].1.len(), 1);
        assert_eq!(all[1].0, "right");
        assert_eq!(all[1].1.len(), 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn framerate_updates_do_not_disturb_frames() {
        let pool = pool(&["cam0"]);
        pool.update_framerate(0, 0.5).expect("queued");
        pool.update_framerate(0, 30.0).expect("queued");
        let summary = pool.process(0, frame(0.0, &[(1.0, 1.0)])).await.expect("summary");
        assert_eq!(summary.new_sequences, 1);
        pool.shutdown().await;
    }
}
