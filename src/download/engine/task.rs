//! The driver task behind a [`DownloadEngine`](super::DownloadEngine).
//!
//! One driver runs per engine: it resolves the link, prepares the target
//! file, then runs block workers in generations. A generation ends when the
//! monitor reports completion, a block fails, ranges turn out to be
//! unsupported, or the caller pauses or stops.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{Notify, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::DownloadRequest;
use super::error_mapping::{actionable_message, block_failure_message};
use super::persistence::{discard_resume_record, persist_resume_record, restore_blocks};
use super::state::{Control, EngineState};
use crate::config::EngineConfig;
use crate::download::block::{BlockSnapshot, BlockStatus, DownloadBlock};
use crate::download::client::{ConnectionManager, Session};
use crate::download::constants::{MAX_POOL_SIZE, STOP_GRACE};
use crate::download::error::DownloadError;
use crate::download::events::{EngineEvent, EventSink};
use crate::download::filename::{corrected_file_name, normalize_file_name, resolve_unique_path};
use crate::download::monitor::{MonitorVerdict, ProgressMonitor};
use crate::download::planner::{ByteRange, plan};
use crate::download::resolver::{LinkResolver, ResolvedLink, session_for};
use crate::download::resume::ResumeStore;
use crate::download::retry::RetryPolicy;
use crate::download::worker::{
    BlockError, BlockOutcome, BlockWorker, HaltReason, HaltSignal, RangeMode, SniffedContentType,
};

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the driver learned about the download target.
#[derive(Debug, Default)]
pub(super) struct TaskInfo {
    /// URL the blocks fetch from (after redirects).
    pub(super) url: String,
    pub(super) file_name: Option<String>,
    pub(super) path: Option<PathBuf>,
    pub(super) file_size: Option<u64>,
    pub(super) multi: bool,
    pub(super) accepts_ranges: bool,
    pub(super) api_like: bool,
}

/// State shared by the public handle, the driver and the monitor.
#[derive(Debug)]
pub(super) struct TaskShared {
    pub(super) request: DownloadRequest,
    pub(super) config: EngineConfig,
    pub(super) events: EventSink,
    pub(super) state_tx: watch::Sender<EngineState>,
    pub(super) control: Mutex<Control>,
    /// Wakes a driver parked on a pause.
    pub(super) wake: Notify,
    /// Cancelled by `stop`; aborts link resolution.
    pub(super) shutdown: CancellationToken,
    pub(super) task: Mutex<TaskInfo>,
    pub(super) blocks: Mutex<Vec<Arc<DownloadBlock>>>,
    /// Bytes taken off the wire, for speed only.
    pub(super) received: Arc<AtomicU64>,
    pub(super) sniffed: SniffedContentType,
    /// Serializes sidecar writes from the driver, the monitor and `pause`.
    pub(super) persist_lock: Mutex<()>,
}

impl TaskShared {
    pub(super) fn new(request: DownloadRequest, config: EngineConfig, events: EventSink) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Created);
        let task = TaskInfo {
            url: request.url.clone(),
            file_name: request.file_name.clone(),
            file_size: request.declared_size,
            ..TaskInfo::default()
        };
        Self {
            request,
            config,
            events,
            state_tx,
            control: Mutex::new(Control::new()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(task),
            blocks: Mutex::new(Vec::new()),
            received: Arc::new(AtomicU64::new(0)),
            sniffed: Arc::new(Mutex::new(None)),
            persist_lock: Mutex::new(()),
        }
    }

    pub(super) fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Moves the driver phase forward. Terminal phases are final.
    pub(super) fn set_phase(&self, phase: EngineState) {
        let mut control = lock(&self.control);
        if control.phase.is_terminal() {
            return;
        }
        control.phase = phase;
        self.publish(&control);
    }

    /// Republishes the visible state after a control flag changed.
    pub(super) fn publish(&self, control: &Control) {
        self.state_tx.send_replace(control.visible_state());
    }

    pub(super) fn block_snapshots(&self) -> Vec<BlockSnapshot> {
        lock(&self.blocks).iter().map(|b| b.snapshot()).collect()
    }

    fn current_halt(&self) -> HaltSignal {
        lock(&self.control).halt.clone()
    }

    fn is_stopping(&self) -> bool {
        lock(&self.control).stopping
    }
}

enum Finish {
    Completed,
    Stopped,
}

enum GenerationEnd {
    Finished(MonitorVerdict),
    Halted,
    RangeRejected { status: u16 },
    Failed(String),
}

/// Runs a download to one of its terminal states.
#[instrument(skip(shared), fields(url = %shared.request.url))]
pub(super) async fn drive(shared: Arc<TaskShared>) {
    match run(&shared).await {
        Ok(Finish::Completed) => {}
        Ok(Finish::Stopped) => {
            persist_resume_record(&shared);
            shared.set_phase(EngineState::Stopped);
            info!("download stopped");
        }
        Err(message) => {
            persist_resume_record(&shared);
            shared.set_phase(EngineState::Failed);
            error!(%message, "download failed");
            shared.events.emit(EngineEvent::Error { message });
        }
    }
}

async fn run(shared: &Arc<TaskShared>) -> Result<Finish, String> {
    shared.set_phase(EngineState::Initializing);
    let request = &shared.request;
    let manager = ConnectionManager::new(shared.config.network.clone());
    let headers = with_default_referer(request);
    let session = session_for(&manager, &request.url, &headers, request.cdn_hint.as_ref())
        .map_err(|e| actionable_message(&e))?;

    let link = tokio::select! {
        () = shared.shutdown.cancelled() => return Ok(Finish::Stopped),
        link = resolve_link(shared, &session) => link.map_err(|e| actionable_message(&e))?,
    };

    shared.set_phase(EngineState::Planning);
    prepare_target(shared, link)
        .await
        .map_err(|e| actionable_message(&e))?;
    let multi = lock(&shared.task).multi;
    shared.events.emit(EngineEvent::Initialized {
        multi_thread_supported: multi,
    });

    loop {
        if !wait_while_paused(shared).await {
            return Ok(Finish::Stopped);
        }
        shared.set_phase(EngineState::Downloading);

        match run_generation(shared, &session).await {
            GenerationEnd::Finished(verdict) => {
                lock(&shared.control).finalizing = true;
                finalize(shared, verdict)
                    .await
                    .map_err(|e| actionable_message(&e))?;
                return Ok(Finish::Completed);
            }
            GenerationEnd::Halted => {
                if shared.is_stopping() {
                    return Ok(Finish::Stopped);
                }
                persist_resume_record(shared);
            }
            GenerationEnd::RangeRejected { status } => downgrade(shared, status),
            GenerationEnd::Failed(message) => return Err(message),
        }
    }
}

/// Adds `Referer: <url>` unless the caller set one.
fn with_default_referer(request: &DownloadRequest) -> std::collections::HashMap<String, String> {
    let mut headers = request.headers.clone();
    if !headers.keys().any(|k| k.eq_ignore_ascii_case("referer")) {
        headers.insert("Referer".to_string(), request.url.clone());
    }
    headers
}

async fn resolve_link(
    shared: &TaskShared,
    session: &Session,
) -> Result<ResolvedLink, DownloadError> {
    let request = &shared.request;
    let declared_size = request.declared_size.filter(|&size| size > 0);

    if let (Some(name), Some(size)) = (request.file_name.as_deref(), declared_size) {
        Url::parse(&request.url).map_err(|_| DownloadError::invalid_url(&request.url))?;
        debug!("name and size supplied by caller, skipping link resolution");
        return Ok(ResolvedLink {
            final_url: request.url.clone(),
            file_name: normalize_file_name(name),
            size: Some(size),
            content_type: None,
            accepts_ranges: false,
            api_like: false,
        });
    }

    let mut link = LinkResolver::new(session.clone())
        .resolve(&request.url, request.file_name.as_deref())
        .await?;
    if link.size.is_none() && !link.api_like {
        link.size = declared_size;
    }
    Ok(link)
}

/// Picks the target path, restores or plans blocks, and sizes the file.
async fn prepare_target(shared: &TaskShared, link: ResolvedLink) -> Result<(), DownloadError> {
    let dir = shared.request.save_dir.clone();
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| DownloadError::io(&dir, e))?;

    let mut file_name = link.file_name;
    let mut path = dir.join(&file_name);
    let size = link.size;
    let multi = size.is_some() && !link.api_like;
    let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);

    let record = if exists && !link.api_like {
        ResumeStore::for_target(&path).load_matching(&shared.request.url, size)
    } else {
        None
    };

    let blocks = if let Some(record) = record {
        let blocks = restore_blocks(&record);
        let done: u64 = blocks.iter().map(|b| b.progress()).sum();
        info!(path = %path.display(), blocks = blocks.len(), done, "resuming download");
        open_target(&path, size, false).await?;
        blocks
    } else {
        if exists {
            path = resolve_unique_path(&dir, &file_name);
            if let Some(name) = path.file_name() {
                file_name = name.to_string_lossy().into_owned();
            }
            debug!(path = %path.display(), "target exists, writing to a new name");
        }
        open_target(&path, size, true).await?;
        fresh_blocks(&shared.config, size, multi)
    };
    shared.received.store(0, Ordering::Relaxed);

    {
        let mut task = lock(&shared.task);
        task.url = link.final_url;
        task.file_name = Some(file_name);
        task.path = Some(path);
        task.file_size = size;
        task.multi = multi;
        task.accepts_ranges = link.accepts_ranges;
        task.api_like = link.api_like;
    }
    info!(blocks = blocks.len(), size = ?size, multi, "download planned");
    *lock(&shared.blocks) = blocks;
    persist_resume_record(shared);
    Ok(())
}

fn fresh_blocks(config: &EngineConfig, size: Option<u64>, multi: bool) -> Vec<Arc<DownloadBlock>> {
    match size {
        Some(size) if multi => plan(size, config.max_concurrency, config.adaptive_concurrency)
            .into_iter()
            .map(|range| Arc::new(DownloadBlock::new(range)))
            .collect(),
        Some(size) => vec![Arc::new(DownloadBlock::new(ByteRange {
            start: 0,
            end: size - 1,
        }))],
        None => vec![Arc::new(DownloadBlock::unknown_size())],
    }
}

/// Creates (or reopens) the target; a known size is allocated up front.
async fn open_target(path: &Path, size: Option<u64>, fresh: bool) -> Result<(), DownloadError> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(fresh)
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    if let Some(size) = size {
        let len = file
            .metadata()
            .await
            .map_err(|e| DownloadError::io(path, e))?
            .len();
        if fresh || len < size {
            file.set_len(size)
                .await
                .map_err(|e| DownloadError::io(path, e))?;
        }
    }
    Ok(())
}

/// Parks while paused. Returns `false` once a stop was requested.
async fn wait_while_paused(shared: &TaskShared) -> bool {
    loop {
        let notified = shared.wake.notified();
        {
            let control = lock(&shared.control);
            if control.stopping {
                return false;
            }
            if !control.paused {
                return true;
            }
        }
        debug!("paused, waiting for resume");
        notified.await;
    }
}

fn pool_size() -> usize {
    std::thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .saturating_mul(4)
        .min(MAX_POOL_SIZE)
}

/// Everything a block worker needs except its block.
struct WorkerTemplate {
    session: Session,
    url: String,
    path: PathBuf,
    mode: RangeMode,
    policy: RetryPolicy,
    chunk_size: usize,
    received: Arc<AtomicU64>,
    halt: HaltSignal,
    sniffed: SniffedContentType,
    pool: Arc<Semaphore>,
}

impl WorkerTemplate {
    fn spawn(
        &self,
        workers: &mut JoinSet<(usize, Result<BlockOutcome, BlockError>)>,
        index: usize,
        block: Arc<DownloadBlock>,
    ) {
        let worker = BlockWorker {
            index,
            block,
            session: self.session.clone(),
            url: self.url.clone(),
            path: self.path.clone(),
            mode: self.mode,
            policy: self.policy.clone(),
            chunk_size: self.chunk_size,
            received: Arc::clone(&self.received),
            halt: self.halt.clone(),
            sniffed: Arc::clone(&self.sniffed),
        };
        let pool = Arc::clone(&self.pool);
        workers.spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                return (index, Ok(BlockOutcome::Cancelled));
            };
            (index, worker.run().await)
        });
    }
}

async fn run_generation(shared: &Arc<TaskShared>, session: &Session) -> GenerationEnd {
    let halt = shared.current_halt().child();
    let (url, path, multi, accepts_ranges) = {
        let task = lock(&shared.task);
        (task.url.clone(), task.path.clone(), task.multi, task.accepts_ranges)
    };
    let Some(path) = path else {
        return GenerationEnd::Failed("download target was never prepared".to_string());
    };
    let mode = if multi {
        RangeMode::Ranged
    } else {
        RangeMode::SingleStream {
            resumable: accepts_ranges,
        }
    };

    let template = WorkerTemplate {
        session: session.clone(),
        url,
        path,
        mode,
        policy: RetryPolicy::for_blocks(&shared.config),
        chunk_size: shared.config.chunk_size,
        received: Arc::clone(&shared.received),
        halt: halt.clone(),
        sniffed: Arc::clone(&shared.sniffed),
        pool: Arc::new(Semaphore::new(pool_size())),
    };

    let pending: Vec<(usize, Arc<DownloadBlock>)> = lock(&shared.blocks)
        .iter()
        .enumerate()
        .filter(|(_, block)| !block.is_complete())
        .map(|(index, block)| (index, Arc::clone(block)))
        .collect();
    let mut workers = JoinSet::new();
    for (index, block) in pending {
        template.spawn(&mut workers, index, block);
    }
    info!(workers = workers.len(), ?mode, "download generation started");

    let (verdict_tx, mut verdict_rx) = mpsc::channel(1);
    let monitor = tokio::spawn(monitor_loop(Arc::clone(shared), halt.clone(), verdict_tx));
    let mut monitor_open = true;

    let end = loop {
        if workers.is_empty() {
            if all_blocks_settled(shared) {
                break GenerationEnd::Finished(MonitorVerdict::Complete);
            }
            if halt.is_halted() {
                break GenerationEnd::Halted;
            }
            let missing: u64 = lock(&shared.blocks).iter().map(|b| b.remaining()).sum();
            break GenerationEnd::Failed(format!(
                "all workers finished with {missing} bytes still missing"
            ));
        }

        tokio::select! {
            verdict = verdict_rx.recv(), if monitor_open => {
                if let Some(verdict) = verdict {
                    halt.halt(HaltReason::Superseded);
                    drain(&mut workers).await;
                    break GenerationEnd::Finished(verdict);
                }
                monitor_open = false;
            }
            joined = workers.join_next() => {
                let Some(joined) = joined else { continue };
                match joined {
                    Ok((index, Ok(BlockOutcome::Completed))) => {
                        debug!(block = index, "block completed");
                        if multi && shared.config.dynamic_split && !halt.is_halted() {
                            if let Some((new_index, block)) =
                                split_largest(shared, shared.config.min_split_size)
                            {
                                debug!(block = new_index, start = block.start(), end = block.end(), "split off new block");
                                template.spawn(&mut workers, new_index, block);
                            }
                        }
                    }
                    Ok((_, Ok(BlockOutcome::Cancelled))) => {}
                    Ok((index, Ok(BlockOutcome::RangeRejected { status }))) => {
                        debug!(block = index, status, "range request rejected");
                        halt.halt(HaltReason::Superseded);
                        drain(&mut workers).await;
                        break GenerationEnd::RangeRejected { status };
                    }
                    Ok((index, Err(error))) => {
                        error!(block = index, %error, "block failed");
                        halt.halt(HaltReason::Superseded);
                        drain(&mut workers).await;
                        break GenerationEnd::Failed(block_failure_message(&error));
                    }
                    Err(join_error) if join_error.is_cancelled() => {}
                    Err(join_error) => {
                        halt.halt(HaltReason::Superseded);
                        drain(&mut workers).await;
                        break GenerationEnd::Failed(format!("block worker crashed: {join_error}"));
                    }
                }
            }
            () = halt.halted() => {
                drain(&mut workers).await;
            }
        }
    };

    halt.halt(HaltReason::Superseded);
    if let Err(join_error) = monitor.await {
        warn!(%join_error, "progress monitor ended abnormally");
    }
    end
}

/// Waits up to the stop grace for workers to flush, then aborts the rest.
async fn drain(workers: &mut JoinSet<(usize, Result<BlockOutcome, BlockError>)>) {
    let graceful = tokio::time::timeout(STOP_GRACE, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if graceful.is_err() {
        warn!(left = workers.len(), "workers did not stop in time, aborting");
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }
}

fn all_blocks_settled(shared: &TaskShared) -> bool {
    let blocks = lock(&shared.blocks);
    !blocks.is_empty()
        && blocks
            .iter()
            .all(|b| b.is_complete() || b.status() == BlockStatus::Completed)
}

/// Takes the upper half of the busiest block's remainder as a new block.
fn split_largest(shared: &TaskShared, min_remaining: u64) -> Option<(usize, Arc<DownloadBlock>)> {
    let mut blocks = lock(&shared.blocks);
    let range = blocks
        .iter()
        .filter(|b| b.status() == BlockStatus::Downloading)
        .max_by_key(|b| b.remaining())?
        .split_remaining(min_remaining)?;
    let block = Arc::new(DownloadBlock::new(range));
    blocks.push(Arc::clone(&block));
    Some((blocks.len() - 1, block))
}

/// Ticks until halted or until it sees completion, publishing progress.
async fn monitor_loop(
    shared: Arc<TaskShared>,
    halt: HaltSignal,
    verdicts: mpsc::Sender<MonitorVerdict>,
) {
    let mut monitor = ProgressMonitor::new(&shared.config, Instant::now());
    monitor.reset(Instant::now(), shared.received.load(Ordering::Relaxed));
    let mut ticker = tokio::time::interval(shared.config.monitor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = halt.halted() => return,
            _ = ticker.tick() => {}
        }
        if shared.events.is_terminated() {
            return;
        }

        let blocks = shared.block_snapshots();
        let file_size = lock(&shared.task).file_size;
        let observation = monitor.observe(
            Instant::now(),
            &blocks,
            shared.received.load(Ordering::Relaxed),
            file_size,
        );
        shared.events.emit(EngineEvent::Progress {
            blocks,
            total_progress: observation.total_progress,
            file_size,
        });
        shared.events.emit(EngineEvent::Speed {
            bytes_per_second: observation.bytes_per_second,
        });
        if shared.config.persist_every_tick {
            persist_resume_record(&shared);
        }

        if observation.verdict != MonitorVerdict::Running {
            debug!(verdict = ?observation.verdict, progress = observation.total_progress, "monitor detected the end of the transfer");
            let _ = verdicts.send(observation.verdict).await;
            return;
        }
    }
}

/// Drops to one single-stream block after the server ignored ranges.
fn downgrade(shared: &TaskShared, status: u16) {
    let size = {
        let mut task = lock(&shared.task);
        task.multi = false;
        task.accepts_ranges = false;
        task.file_size
    };
    warn!(status, "server does not honor range requests, falling back to one stream");
    let block = match size {
        Some(size) if size > 0 => DownloadBlock::new(ByteRange {
            start: 0,
            end: size - 1,
        }),
        _ => DownloadBlock::unknown_size(),
    };
    *lock(&shared.blocks) = vec![Arc::new(block)];
    persist_resume_record(shared);
}

async fn finalize(shared: &TaskShared, verdict: MonitorVerdict) -> Result<(), DownloadError> {
    let (path, known_size) = {
        let task = lock(&shared.task);
        (task.path.clone(), task.file_size)
    };
    let Some(path) = path else {
        return Err(DownloadError::invalid_url(&shared.request.url));
    };

    let final_size = if let Some(size) = known_size {
        if verdict == MonitorVerdict::NearComplete {
            let done: u64 = lock(&shared.blocks).iter().map(|b| b.progress()).sum();
            warn!(missing = size.saturating_sub(done), "finishing a few bytes short");
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| DownloadError::io(&path, e))?;
            file.set_len(size)
                .await
                .map_err(|e| DownloadError::io(&path, e))?;
            for block in lock(&shared.blocks).iter() {
                block.force_complete(block.end().saturating_add(1));
            }
        }
        size
    } else {
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| DownloadError::io(&path, e))?
            .len();
        for block in lock(&shared.blocks).iter() {
            block.force_complete(size);
        }
        lock(&shared.task).file_size = Some(size);
        size
    };

    let blocks = shared.block_snapshots();
    let total_progress = blocks.iter().map(|b| b.progress).sum();
    shared.events.emit(EngineEvent::Progress {
        blocks,
        total_progress,
        file_size: Some(final_size),
    });
    discard_resume_record(shared);
    rename_for_content_type(shared, &path).await;

    shared.set_phase(EngineState::Completed);
    info!(path = %path.display(), size = final_size, "download completed");
    shared.events.emit(EngineEvent::Completed);
    Ok(())
}

/// Fixes the extension of a single-stream download from its sniffed type.
/// A failed rename keeps the original name.
async fn rename_for_content_type(shared: &TaskShared, path: &Path) {
    let Some(content_type) = lock(&shared.sniffed).clone() else {
        return;
    };
    let Some(current) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return;
    };
    let Some(corrected) = corrected_file_name(&current, &content_type) else {
        return;
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let new_path = resolve_unique_path(dir, &corrected);
    if let Err(error) = tokio::fs::rename(path, &new_path).await {
        warn!(%error, "could not rename download to match its content type");
        return;
    }
    let new_name = new_path
        .file_name()
        .map_or_else(|| corrected.clone(), |n| n.to_string_lossy().into_owned());
    info!(from = %current, to = %new_name, "renamed download to match its content type");
    {
        let mut task = lock(&shared.task);
        task.file_name = Some(new_name.clone());
        task.path = Some(new_path);
    }
    shared.events.emit(EngineEvent::FileNameChanged { new_name });
}
