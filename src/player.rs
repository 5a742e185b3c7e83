//! The playback state machine.
//!
//! A [`Player`] owns one source and runs its lifecycle in a spawned task:
//! initialize, read an initial window, then alternate between idle and
//! playing while servicing seeks, speed changes, and subscription changes
//! sent over a command channel. The task is single-threaded and
//! cooperative; every await either belongs to the current lifecycle state or
//! is raced against the command channel, so a seek or close is never stuck
//! behind a slow read.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use futures::StreamExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blocks::{BlockLoader, DEFAULT_BLOCK_CACHE_BYTES, MessageBlock};
use crate::decoders::{DecoderFactory, DecoderStore};
use crate::parsed_cache::ParsedMessageCache;
use crate::problems::ProblemManager;
use crate::source::{BackfillArgs, IterableSource, MessageIteratorArgs, SourceItem, SourceIterator};
use crate::stream::PaceExt;
use crate::subscriptions::SubscriptionManager;
use crate::types::{
    ActiveData, MessageEvent, PlayerPresence, PlayerState, Problem, Progress, SchemaInfo,
    SubscribePayload, Time, Topic, TopicStats,
};

/// How far past the start the initial read extends, so panels have data
/// before the user presses play.
const START_WINDOW_NANOS: u64 = 99_000_000;

/// Recording time a single tick may cover, regardless of speed or a long
/// stall between ticks.
const MAX_TICK_NANOS: u64 = 300_000_000;

/// How long a seek backfill may run before presence flips to Buffering.
const SEEK_ACK: Duration = Duration::from_millis(100);

/// How long a tick read may stall before presence flips to Buffering.
const TICK_STALL: Duration = Duration::from_millis(500);

const TICK_INTERVAL: Duration = Duration::from_millis(16);

/// Minimum interval between snapshots on the public paced stream.
const STATE_EMIT_INTERVAL: Duration = Duration::from_millis(100);

const MAX_ERRORS: u32 = 10;

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(50 * (1 << attempt.min(5)))
}

/// Lossless state delivery: each snapshot is awaited before the next one is
/// produced, which is what UI bridges that must not drop frames want. The
/// watch channel remains available for lossy latest-wins consumers.
pub type StateListener = Box<dyn FnMut(PlayerState) -> BoxFuture<'static, ()> + Send>;

enum Command {
    Start(Option<StateListener>),
    Play,
    Pause,
    PlayUntil(Time),
    Seek(Time),
    SetSpeed(f64),
    SubscriptionsChanged,
    Close,
}

/// Construction options for [`Player`].
pub struct PlayerOptions {
    /// Run the block preloader for full-preload subscriptions.
    pub enable_preload: bool,
    pub block_cache_bytes: usize,
    /// Without a factory the player emits raw payloads unchanged.
    pub decoder_factory: Option<Arc<dyn DecoderFactory>>,
    /// Share a cache between players, or leave `None` for a private one.
    pub parsed_cache: Option<Arc<ParsedMessageCache>>,
    pub decoders: Option<Arc<DecoderStore>>,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            enable_preload: true,
            block_cache_bytes: DEFAULT_BLOCK_CACHE_BYTES,
            decoder_factory: None,
            parsed_cache: None,
            decoders: None,
        }
    }
}

/// Handle to a playback task.
///
/// All methods are fire-and-forget commands; results come back through the
/// state snapshots. Commands sent after `close` are defensive no-ops.
pub struct Player {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<PlayerState>,
    subscriptions: Arc<SubscriptionManager>,
    loader: Arc<Mutex<Option<Arc<BlockLoader>>>>,
    done: CancellationToken,
}

impl Player {
    pub fn open(source: Arc<dyn IterableSource>) -> Self {
        Self::open_with(source, PlayerOptions::default())
    }

    pub fn open_with(source: Arc<dyn IterableSource>, options: PlayerOptions) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PlayerState::default());
        let subscriptions = Arc::new(SubscriptionManager::new());
        let loader = Arc::new(Mutex::new(None));
        let done = CancellationToken::new();

        let task = PlayerTask {
            source,
            commands: command_rx,
            state_tx,
            listener: None,
            subscriptions: subscriptions.clone(),
            problems: Arc::new(ProblemManager::new()),
            parsed_cache: options.parsed_cache.unwrap_or_default(),
            decoders: options.decoders.unwrap_or_default(),
            decoder_factory: options.decoder_factory,
            enable_preload: options.enable_preload,
            block_cache_bytes: options.block_cache_bytes,
            shared_loader: loader.clone(),
            done: done.clone(),
            initialized: false,
            start: Time::ZERO,
            end: Time::ZERO,
            topics: Vec::new(),
            topic_stats: BTreeMap::new(),
            schema_by_topic: HashMap::new(),
            presence: PlayerPresence::NotPresent,
            current_time: Time::ZERO,
            speed: 1.0,
            is_playing: false,
            until_time: None,
            seek_target: None,
            iterator: None,
            pending_message: None,
            smoothed_range_nanos: 0,
            read_errors: 0,
            progress_rx: None,
            loader: None,
            block_task: None,
        };
        tokio::spawn(task.run());

        Self { commands: command_tx, state_rx, subscriptions, loader, done }
    }

    /// Begin initialization, delivering every snapshot through `listener`.
    pub fn set_listener(&self, listener: StateListener) {
        let _ = self.commands.send(Command::Start(Some(listener)));
    }

    /// Begin initialization with watch-channel state delivery only.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start(None));
    }

    /// Latest-wins snapshot channel.
    pub fn state_watch(&self) -> watch::Receiver<PlayerState> {
        self.state_rx.clone()
    }

    /// Rate-limited snapshot stream for UI consumption.
    pub fn state_updates(&self) -> impl Stream<Item = PlayerState> + Send + use<> {
        WatchStream::new(self.state_rx.clone()).paced(STATE_EMIT_INTERVAL)
    }

    /// Replace one consumer's subscriptions.
    pub fn set_subscriptions(
        &self,
        consumer_id: impl Into<String>,
        payloads: Vec<SubscribePayload>,
    ) {
        if self.subscriptions.set_subscriptions(consumer_id, payloads) {
            let _ = self.commands.send(Command::SubscriptionsChanged);
        }
    }

    pub fn remove_consumer(&self, consumer_id: &str) {
        if self.subscriptions.remove_consumer(consumer_id) {
            let _ = self.commands.send(Command::SubscriptionsChanged);
        }
    }

    /// Declare a computed topic backed by real input topics.
    pub fn register_virtual_topic(&self, name: impl Into<String>, inputs: Vec<String>) {
        if self.subscriptions.register_virtual_topic(name, inputs) {
            let _ = self.commands.send(Command::SubscriptionsChanged);
        }
    }

    pub fn unregister_virtual_topic(&self, name: &str) {
        if self.subscriptions.unregister_virtual_topic(name) {
            let _ = self.commands.send(Command::SubscriptionsChanged);
        }
    }

    pub fn seek_playback(&self, time: Time) {
        let _ = self.commands.send(Command::Seek(time));
    }

    pub fn set_playback_speed(&self, speed: f64) {
        let _ = self.commands.send(Command::SetSpeed(speed));
    }

    pub fn start_playback(&self) {
        let _ = self.commands.send(Command::Play);
    }

    pub fn pause_playback(&self) {
        let _ = self.commands.send(Command::Pause);
    }

    /// Play forward and pause automatically at `time`.
    pub fn play_until(&self, time: Time) {
        let _ = self.commands.send(Command::PlayUntil(time));
    }

    /// Shut the playback task down. Supersedes any operation in flight.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Resolves once the playback task has fully shut down.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    /// Snapshot of the preload block array, empty before initialization or
    /// with preloading disabled.
    pub fn blocks(&self) -> Vec<Option<Arc<MessageBlock>>> {
        self.loader.lock().as_ref().map(|loader| loader.blocks()).unwrap_or_default()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Preinit,
    Initialize,
    StartPlay,
    Idle,
    Play,
    SeekBackfill,
    ResetIterator,
    Terminal,
    Close,
}

struct PlayerTask {
    source: Arc<dyn IterableSource>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<PlayerState>,
    listener: Option<StateListener>,
    subscriptions: Arc<SubscriptionManager>,
    problems: Arc<ProblemManager>,
    parsed_cache: Arc<ParsedMessageCache>,
    decoders: Arc<DecoderStore>,
    decoder_factory: Option<Arc<dyn DecoderFactory>>,
    enable_preload: bool,
    block_cache_bytes: usize,
    shared_loader: Arc<Mutex<Option<Arc<BlockLoader>>>>,
    done: CancellationToken,

    initialized: bool,
    start: Time,
    end: Time,
    topics: Vec<Topic>,
    topic_stats: BTreeMap<String, TopicStats>,
    schema_by_topic: HashMap<String, SchemaInfo>,

    presence: PlayerPresence,
    current_time: Time,
    speed: f64,
    is_playing: bool,
    until_time: Option<Time>,
    seek_target: Option<Time>,
    iterator: Option<SourceIterator>,
    /// Read past the tick target; first candidate of the next tick.
    pending_message: Option<Arc<MessageEvent>>,
    smoothed_range_nanos: u64,
    read_errors: u32,

    progress_rx: Option<watch::Receiver<Progress>>,
    loader: Option<Arc<BlockLoader>>,
    block_task: Option<tokio::task::JoinHandle<()>>,
}

impl PlayerTask {
    async fn run(mut self) {
        let mut state = Lifecycle::Preinit;
        loop {
            debug!(?state, "player lifecycle");
            state = match state {
                Lifecycle::Preinit => self.preinit().await,
                Lifecycle::Initialize => self.initialize().await,
                Lifecycle::StartPlay => self.start_play().await,
                Lifecycle::Idle => self.idle().await,
                Lifecycle::Play => self.play().await,
                Lifecycle::SeekBackfill => self.seek_backfill().await,
                Lifecycle::ResetIterator => self.reset_iterator(),
                Lifecycle::Terminal => self.terminal().await,
                Lifecycle::Close => break,
            };
        }
        self.shutdown().await;
    }

    /// Waits for `Start`; other commands just pre-set playback state.
    async fn preinit(&mut self) -> Lifecycle {
        loop {
            match self.commands.recv().await {
                None | Some(Command::Close) => return Lifecycle::Close,
                Some(Command::Start(listener)) => {
                    if listener.is_some() {
                        self.listener = listener;
                    }
                    return Lifecycle::Initialize;
                }
                Some(Command::Seek(time)) => self.seek_target = Some(time),
                Some(Command::Play) => self.is_playing = true,
                Some(Command::Pause) => self.is_playing = false,
                Some(Command::PlayUntil(time)) => {
                    self.is_playing = true;
                    self.until_time = Some(time);
                }
                Some(Command::SetSpeed(speed)) => self.speed = clamp_speed(speed),
                Some(Command::SubscriptionsChanged) => {}
            }
        }
    }

    async fn initialize(&mut self) -> Lifecycle {
        self.presence = PlayerPresence::Initializing;
        self.emit_state(Vec::new()).await;

        let mut attempt = 0u32;
        let init = loop {
            let source = self.source.clone();
            let init_fut = source.initialize();
            tokio::pin!(init_fut);
            let result = loop {
                tokio::select! {
                    cmd = self.commands.recv() => {
                        match cmd {
                            None | Some(Command::Close) => return Lifecycle::Close,
                            Some(cmd) => self.stash_command(cmd),
                        }
                    }
                    result = &mut init_fut => break result,
                }
            };

            match result {
                Ok(init) => break init,
                Err(err) if err.is_retryable() && attempt < MAX_ERRORS => {
                    attempt += 1;
                    warn!(error = %err, attempt, "source initialization failed, retrying");
                    self.problems.add(Problem::warn("source-init", err.to_string()));
                    self.presence = PlayerPresence::Reconnecting;
                    self.emit_state(Vec::new()).await;
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(err) => {
                    error!(error = %err, "source initialization failed");
                    return self.fatal(err.to_string()).await;
                }
            }
        };
        self.problems.remove("source-init");

        for problem in init.problems {
            self.problems.add(problem);
        }

        self.start = init.start;
        self.end = init.end;
        self.current_time = init.start;
        self.topic_stats = init.topic_stats.into_iter().collect();
        self.schema_by_topic = init
            .topics
            .iter()
            .filter_map(|topic| {
                let schema = init.schemas.get(&topic.schema_name)?;
                Some((topic.name.clone(), schema.clone()))
            })
            .collect();
        self.topics = init.topics;
        self.initialized = true;
        info!(
            topics = self.topics.len(),
            start = %self.start,
            end = %self.end,
            "source initialized"
        );

        if self.enable_preload {
            match BlockLoader::new(
                self.source.clone(),
                self.start,
                self.end,
                self.block_cache_bytes,
                self.problems.clone(),
            ) {
                Ok(loader) => {
                    let loader = Arc::new(loader);
                    let (progress_tx, progress_rx) = watch::channel(Progress::default());
                    loader.set_topics(self.subscriptions.preload_selection());
                    self.block_task = Some(tokio::spawn({
                        let loader = loader.clone();
                        async move { loader.start_loading(progress_tx).await }
                    }));
                    self.progress_rx = Some(progress_rx);
                    *self.shared_loader.lock() = Some(loader.clone());
                    self.loader = Some(loader);
                }
                Err(err) => {
                    warn!(error = %err, "preloading disabled");
                    self.problems.add(Problem::warn("preload-unavailable", err.to_string()));
                }
            }
        }

        Lifecycle::StartPlay
    }

    /// Read the initial window after the start so panels have data
    /// immediately, unless a pre-start seek already moved the cursor.
    async fn start_play(&mut self) -> Lifecycle {
        self.presence = PlayerPresence::Buffering;
        self.emit_state(Vec::new()).await;

        if self.seek_target.is_some() {
            return Lifecycle::SeekBackfill;
        }

        self.pending_message = None;
        self.iterator = Some(self.source.message_iterator(MessageIteratorArgs {
            topics: self.subscriptions.playback_selection(),
            start: Some(self.start),
            end: Some(self.end),
        }));

        let target = self.start.add_nanos(START_WINDOW_NANOS).clamp_to(self.start, self.end);
        match self.read_range(target).await {
            Ok(messages) => {
                let parsed = self.parse(messages);
                self.presence = PlayerPresence::Present;
                self.emit_state(parsed).await;
                self.after_motion()
            }
            Err(next) => next,
        }
    }

    /// Parked playback: service commands and forward preload progress.
    async fn idle(&mut self) -> Lifecycle {
        self.presence = PlayerPresence::Present;
        self.emit_state(Vec::new()).await;

        loop {
            let mut progress_rx = self.progress_rx.clone();
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else { return Lifecycle::Close };
                    if let Some(next) = self.apply_command(cmd) {
                        return next;
                    }
                    if self.is_playing {
                        return Lifecycle::Play;
                    }
                    self.emit_state(Vec::new()).await;
                }
                _ = progress_changed(&mut progress_rx) => {
                    self.emit_state(Vec::new()).await;
                }
            }
        }
    }

    async fn play(&mut self) -> Lifecycle {
        self.presence = PlayerPresence::Present;
        self.emit_state(Vec::new()).await;
        let mut last_tick = Instant::now();

        loop {
            if !self.is_playing {
                return Lifecycle::Idle;
            }

            let now = Instant::now();
            let elapsed = now.duration_since(last_tick);
            last_tick = now;

            // Smooth the per-tick range so one slow tick does not cause a
            // visible jump, and clamp how much recording time a tick covers.
            let range = ((elapsed.as_nanos() as f64 * self.speed) as u64).min(MAX_TICK_NANOS);
            self.smoothed_range_nanos = if self.smoothed_range_nanos == 0 {
                range
            } else {
                (self.smoothed_range_nanos * 9 + range) / 10
            };

            let mut target = self.current_time.add_nanos(self.smoothed_range_nanos).min(self.end);
            if let Some(until) = self.until_time {
                target = target.min(until);
            }

            let messages = match self.read_range(target).await {
                Ok(messages) => messages,
                Err(next) => return next,
            };
            let parsed = self.parse(messages);
            self.presence = PlayerPresence::Present;
            self.emit_state(parsed).await;

            if self.until_time.is_some_and(|until| self.current_time >= until) {
                self.until_time = None;
                self.is_playing = false;
            }
            if self.current_time >= self.end {
                self.is_playing = false;
            }
            if !self.is_playing {
                return Lifecycle::Idle;
            }

            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else { return Lifecycle::Close };
                    if let Some(next) = self.apply_command(cmd) {
                        return next;
                    }
                }
            }
        }
    }

    /// Jump the cursor: fetch last-known values at the target, then rebuild
    /// the forward iterator just past it.
    async fn seek_backfill(&mut self) -> Lifecycle {
        let Some(target) = self.seek_target.take() else {
            return self.after_motion();
        };
        let target = target.clamp_to(self.start, self.end);
        debug!(%target, "seeking");

        let args =
            BackfillArgs { topics: self.subscriptions.playback_selection(), time: target };
        let source = self.source.clone();
        let backfill_fut = source.get_backfill_messages(args);
        tokio::pin!(backfill_fut);

        // Quick seeks finish silently; slow ones acknowledge with Buffering.
        let mut result = tokio::select! {
            result = &mut backfill_fut => Some(result),
            _ = tokio::time::sleep(SEEK_ACK) => None,
        };
        if result.is_none() {
            self.presence = PlayerPresence::Buffering;
            self.emit_state(Vec::new()).await;
            result = loop {
                tokio::select! {
                    r = &mut backfill_fut => break Some(r),
                    cmd = self.commands.recv() => {
                        let Some(cmd) = cmd else { return Lifecycle::Close };
                        if let Some(next) = self.apply_command(cmd) {
                            // A newer seek or a close supersedes this one.
                            return next;
                        }
                    }
                }
            };
        }

        let messages = match result {
            Some(Ok(messages)) => messages,
            Some(Err(err)) if err.is_retryable() => {
                self.problems.add(Problem::warn("seek-backfill", err.to_string()));
                Vec::new()
            }
            Some(Err(err)) => return self.fatal(err.to_string()).await,
            None => Vec::new(),
        };

        self.current_time = target;
        let parsed = self.parse(messages);
        self.presence = PlayerPresence::Present;
        self.emit_state(parsed).await;
        Lifecycle::ResetIterator
    }

    /// Rebuild the playback iterator just past the cursor.
    fn reset_iterator(&mut self) -> Lifecycle {
        self.pending_message = None;
        self.iterator = Some(self.source.message_iterator(MessageIteratorArgs {
            topics: self.subscriptions.playback_selection(),
            start: Some(self.current_time.add_nanos(1)),
            end: Some(self.end),
        }));
        self.after_motion()
    }

    /// Fatal errors park the task here; only close gets it out.
    async fn terminal(&mut self) -> Lifecycle {
        loop {
            match self.commands.recv().await {
                None | Some(Command::Close) => return Lifecycle::Close,
                Some(_) => {}
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("player closing");
        if let Some(loader) = self.loader.take() {
            loader.stop();
        }
        self.shared_loader.lock().take();
        if let Some(task) = self.block_task.take() {
            let _ = task.await;
        }
        self.iterator = None;
        self.is_playing = false;
        self.presence = PlayerPresence::NotPresent;
        self.emit_state(Vec::new()).await;
        self.done.cancel();
    }

    fn after_motion(&self) -> Lifecycle {
        if self.is_playing { Lifecycle::Play } else { Lifecycle::Idle }
    }

    async fn fatal(&mut self, message: String) -> Lifecycle {
        self.problems.add(Problem::error("global-error", message));
        self.presence = PlayerPresence::Error;
        self.is_playing = false;
        self.emit_state(Vec::new()).await;
        Lifecycle::Terminal
    }

    /// Commands that change lifecycle state return the next state; the rest
    /// adjust playback fields in place.
    fn apply_command(&mut self, cmd: Command) -> Option<Lifecycle> {
        match cmd {
            Command::Close => Some(Lifecycle::Close),
            Command::Seek(time) => {
                let time = time.clamp_to(self.start, self.end);
                if self.seek_target == Some(time) {
                    return None;
                }
                if self.seek_target.is_none()
                    && time == self.current_time
                    && self.presence == PlayerPresence::Present
                {
                    return None;
                }
                self.seek_target = Some(time);
                Some(Lifecycle::SeekBackfill)
            }
            Command::SubscriptionsChanged => {
                if let Some(loader) = &self.loader {
                    loader.set_topics(self.subscriptions.preload_selection());
                }
                // Refetch current values so new subscribers are not stuck
                // waiting for the next message on their topics.
                self.seek_target = Some(self.current_time);
                Some(Lifecycle::SeekBackfill)
            }
            Command::Play => {
                self.is_playing = true;
                self.until_time = None;
                None
            }
            Command::PlayUntil(time) => {
                self.is_playing = true;
                self.until_time = Some(time);
                None
            }
            Command::Pause => {
                self.is_playing = false;
                self.until_time = None;
                None
            }
            Command::SetSpeed(speed) => {
                self.speed = clamp_speed(speed);
                None
            }
            Command::Start(listener) => {
                if listener.is_some() {
                    self.listener = listener;
                }
                None
            }
        }
    }

    /// Pre-initialization command handling: remember intent, transition
    /// nothing.
    fn stash_command(&mut self, cmd: Command) {
        match cmd {
            Command::Seek(time) => self.seek_target = Some(time),
            Command::Play => self.is_playing = true,
            Command::Pause => self.is_playing = false,
            Command::PlayUntil(time) => {
                self.is_playing = true;
                self.until_time = Some(time);
            }
            Command::SetSpeed(speed) => self.speed = clamp_speed(speed),
            Command::Start(listener) => {
                if listener.is_some() {
                    self.listener = listener;
                }
            }
            Command::Close | Command::SubscriptionsChanged => {}
        }
    }

    /// Read forward until the cursor reaches `target`, returning the
    /// messages whose time falls inside the tick. `Err` carries the next
    /// lifecycle state when a command or a fatal error interrupts the read.
    async fn read_range(
        &mut self,
        target: Time,
    ) -> std::result::Result<Vec<Arc<MessageEvent>>, Lifecycle> {
        let mut out = Vec::new();

        if let Some(msg) = self.pending_message.take() {
            if msg.receive_time <= target {
                out.push(msg);
            } else {
                self.pending_message = Some(msg);
                self.current_time = target;
                return Ok(out);
            }
        }

        let Some(mut iterator) = self.iterator.take() else {
            self.current_time = target;
            return Ok(out);
        };

        // Where a rebuilt iterator resumes after a reconnect; messages
        // already pushed this tick must not be read again.
        let mut last_delivered = out.last().map(|msg| msg.receive_time);
        let mut transition = None;
        let mut stalled = false;
        loop {
            enum Event {
                Command(Option<Command>),
                Item(std::result::Result<Option<crate::Result<SourceItem>>, tokio::time::error::Elapsed>),
            }

            let event = tokio::select! {
                cmd = self.commands.recv() => Event::Command(cmd),
                item = tokio::time::timeout(TICK_STALL, iterator.next()) => Event::Item(item),
            };

            match event {
                Event::Command(None) => {
                    transition = Some(Lifecycle::Close);
                    break;
                }
                Event::Command(Some(cmd)) => {
                    if let Some(next) = self.apply_command(cmd) {
                        transition = Some(next);
                        break;
                    }
                }
                Event::Item(Err(_elapsed)) => {
                    // Source stalled mid-tick. Tell the UI and keep waiting.
                    if !stalled {
                        stalled = true;
                        self.presence = PlayerPresence::Buffering;
                        self.emit_state(Vec::new()).await;
                    }
                }
                Event::Item(Ok(Some(Ok(SourceItem::Message(msg))))) => {
                    self.note_read_success(&mut stalled).await;
                    if msg.receive_time > target {
                        self.pending_message = Some(msg);
                        self.current_time = target;
                        break;
                    }
                    last_delivered = Some(msg.receive_time);
                    out.push(msg);
                }
                Event::Item(Ok(Some(Ok(SourceItem::Stamp(stamp))))) => {
                    self.note_read_success(&mut stalled).await;
                    if stamp >= target {
                        self.current_time = target;
                        break;
                    }
                }
                Event::Item(Ok(Some(Ok(SourceItem::Problem(problem))))) => {
                    self.problems.add(problem);
                }
                Event::Item(Ok(Some(Err(err)))) if err.is_retryable() => {
                    self.read_errors += 1;
                    if self.read_errors >= MAX_ERRORS {
                        drop(iterator);
                        self.iterator = None;
                        return Err(self.fatal(err.to_string()).await);
                    }
                    warn!(error = %err, attempt = self.read_errors, "read failed, reconnecting");
                    self.problems.add(Problem::warn("source-read", err.to_string()));
                    self.presence = PlayerPresence::Reconnecting;
                    self.emit_state(Vec::new()).await;
                    tokio::time::sleep(backoff(self.read_errors)).await;
                    let resume = last_delivered.unwrap_or(self.current_time);
                    iterator = self.source.message_iterator(MessageIteratorArgs {
                        topics: self.subscriptions.playback_selection(),
                        start: Some(resume.add_nanos(1)),
                        end: Some(self.end),
                    });
                }
                Event::Item(Ok(Some(Err(err)))) => {
                    drop(iterator);
                    self.iterator = None;
                    return Err(self.fatal(err.to_string()).await);
                }
                Event::Item(Ok(None)) => {
                    // Source exhausted; the cursor still advances to target.
                    self.current_time = target;
                    break;
                }
            }
        }

        self.iterator = Some(iterator);
        match transition {
            Some(next) => Err(next),
            None => Ok(out),
        }
    }

    async fn note_read_success(&mut self, stalled: &mut bool) {
        if self.read_errors > 0 {
            self.read_errors = 0;
            self.problems.remove("source-read");
        }
        if *stalled {
            *stalled = false;
            self.presence = PlayerPresence::Present;
            self.emit_state(Vec::new()).await;
        }
    }

    fn parse(&self, messages: Vec<Arc<MessageEvent>>) -> Vec<Arc<MessageEvent>> {
        let Some(factory) = self.decoder_factory.as_ref() else {
            return messages;
        };
        let decoders = &self.decoders;
        let schema_by_topic = &self.schema_by_topic;
        self.parsed_cache.parse_messages(
            &messages,
            |topic| {
                let schema = schema_by_topic.get(topic)?;
                let schema_name = &self
                    .topics
                    .iter()
                    .find(|t| t.name == topic)?
                    .schema_name;
                decoders
                    .get_decoder(schema_name, schema.hash, &schema.text, factory.as_ref())
                    .ok()
            },
            &self.problems,
        )
    }

    async fn emit_state(&mut self, messages: Vec<Arc<MessageEvent>>) {
        let progress = self
            .progress_rx
            .as_mut()
            .map(|rx| rx.borrow_and_update().clone())
            .unwrap_or_default();
        let active_data = self.initialized.then(|| ActiveData {
            messages,
            start_time: self.start,
            end_time: self.end,
            current_time: self.current_time,
            is_playing: self.is_playing,
            speed: self.speed,
            topics: self.topics.clone(),
            topic_stats: self.topic_stats.clone(),
        });
        let state = PlayerState {
            presence: self.presence,
            active_data,
            progress,
            problems: self.problems.problems(),
        };
        self.state_tx.send_replace(state.clone());
        if let Some(listener) = self.listener.as_mut() {
            listener(state).await;
        }
    }
}

fn clamp_speed(speed: f64) -> f64 {
    if speed.is_finite() { speed.clamp(0.01, 100.0) } else { 1.0 }
}

async fn progress_changed(progress_rx: &mut Option<watch::Receiver<Progress>>) {
    match progress_rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
        None => futures::future::pending::<()>().await,
    }
}
