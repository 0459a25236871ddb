//! Application coordinator
//!
//! Single-instance state machine composing the audio pipeline, the
//! protocol session, the upgrade flow and the collaborator boundaries.
//! Constructed explicitly by the host and shared as `Arc<Application>`;
//! every public method is safe to call from any thread.

pub mod action;
pub mod background;
pub mod events;
pub mod state;

pub use action::{ActionRunner, MotionDriver};
pub use background::BackgroundTask;
pub use events::{EventBus, MainEvent};
pub use state::{ActionState, DeviceState};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::{AudioDriver, FrameAssembler, WakeWordDetector};
use crate::codec::{OpusDecoder, OpusEncoder, StreamResampler};
use crate::config::AppConfig;
use crate::display::FaceDisplay;
use crate::error::{CodecError, Error, Result};
use crate::ota::{NewVersion, OtaUpdater};
use crate::protocol::{AbortReason, ListenMode, ProtocolClient, ProtocolListener};

/// A deferred callback consumed exactly once by the main loop
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Everything the coordinator drives but does not implement
pub struct Collaborators {
    pub driver: Box<dyn AudioDriver>,
    pub protocol: Arc<dyn ProtocolClient>,
    pub display: Arc<dyn FaceDisplay>,
    pub ota: Arc<dyn OtaUpdater>,
    pub motion: Arc<dyn MotionDriver>,
    pub wake_word: Option<Arc<dyn WakeWordDetector>>,
}

/// State guarded by the one coordinator mutex
struct Shared {
    device_state: DeviceState,
    action_state: ActionState,
    keep_listening: bool,
    aborted: bool,
    tasks: VecDeque<ScheduledTask>,
}

/// Microphone-side conversion, touched only by the main loop
struct InputStage {
    resampler: Option<StreamResampler>,
    assembler: FrameAssembler,
}

impl InputStage {
    fn new(device_rate: u32, network_rate: u32) -> std::result::Result<Self, CodecError> {
        let resampler = if device_rate != network_rate {
            Some(StreamResampler::new(device_rate, network_rate)?)
        } else {
            None
        };
        Ok(Self {
            resampler,
            assembler: FrameAssembler::new(crate::constants::frame_samples(network_rate)),
        })
    }

    /// Resample one device frame and re-block into network-rate frames
    fn process(&mut self, samples: &[f32]) -> std::result::Result<Vec<Vec<f32>>, CodecError> {
        match self.resampler.as_mut() {
            Some(resampler) => {
                let converted = resampler.process(samples)?;
                Ok(self.assembler.push(&converted))
            }
            None => Ok(self.assembler.push(samples)),
        }
    }

    fn clear(&mut self) {
        self.assembler.clear();
    }
}

/// Speaker-side conversion, touched only by the background worker and
/// the (serialized) reset path
struct OutputStage {
    decoder: OpusDecoder,
    resampler: Option<StreamResampler>,
    sample_rate: u32,
    device_rate: u32,
}

impl OutputStage {
    fn new(sample_rate: u32, device_rate: u32) -> std::result::Result<Self, CodecError> {
        Ok(Self {
            decoder: OpusDecoder::new(sample_rate, crate::constants::CHANNELS)?,
            resampler: Self::make_resampler(sample_rate, device_rate)?,
            sample_rate,
            device_rate,
        })
    }

    fn make_resampler(
        sample_rate: u32,
        device_rate: u32,
    ) -> std::result::Result<Option<StreamResampler>, CodecError> {
        if sample_rate != device_rate {
            Ok(Some(StreamResampler::new(sample_rate, device_rate)?))
        } else {
            Ok(None)
        }
    }

    /// Rebuild decoder and resampler for a newly negotiated rate
    fn set_sample_rate(&mut self, sample_rate: u32) -> std::result::Result<(), CodecError> {
        self.decoder = OpusDecoder::new(sample_rate, crate::constants::CHANNELS)?;
        self.resampler = Self::make_resampler(sample_rate, self.device_rate)?;
        self.sample_rate = sample_rate;
        Ok(())
    }

    /// Fresh codec state at the current rate
    fn reset(&mut self) -> std::result::Result<(), CodecError> {
        self.decoder.reset()?;
        self.resampler = Self::make_resampler(self.sample_rate, self.device_rate)?;
        Ok(())
    }

    /// Decode one packet and convert to the device rate
    fn decode(&mut self, packet: &[u8]) -> std::result::Result<Vec<f32>, CodecError> {
        let pcm = self.decoder.decode(packet)?;
        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&pcm),
            None => Ok(pcm),
        }
    }
}

/// The device coordinator
pub struct Application {
    weak: Weak<Application>,
    audio_config: crate::config::AudioConfig,
    ota_config: crate::config::OtaConfig,

    shared: Mutex<Shared>,
    voice_detected: AtomicBool,

    events: EventBus,
    events_rx: Mutex<Option<Receiver<MainEvent>>>,
    background: BackgroundTask,

    decode_queue: Mutex<VecDeque<Bytes>>,
    input_stage: Mutex<InputStage>,
    /// Separate filter state for the idle-path audio handed to the
    /// wake-word front end
    reference_stage: Mutex<InputStage>,
    encoder: Arc<Mutex<OpusEncoder>>,
    output_stage: Arc<Mutex<OutputStage>>,
    last_output: Mutex<Instant>,

    driver: Arc<Mutex<Box<dyn AudioDriver>>>,
    protocol: Arc<dyn ProtocolClient>,
    display: Arc<dyn FaceDisplay>,
    ota: Arc<dyn OtaUpdater>,
    motion: Arc<dyn MotionDriver>,
    wake_word: Option<Arc<dyn WakeWordDetector>>,

    action: Mutex<Option<ActionRunner>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl Application {
    /// Build the coordinator; nothing runs until [`Application::start`]
    pub fn new(config: &AppConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        let device_rate = collaborators.driver.sample_rate();
        let network_rate = config.audio.network_sample_rate;

        let encoder = OpusEncoder::voice(network_rate, config.audio.channels)
            .map_err(Error::Codec)?;
        let input_stage = InputStage::new(device_rate, network_rate).map_err(Error::Codec)?;
        let reference_stage = InputStage::new(device_rate, network_rate).map_err(Error::Codec)?;
        // Decode rate starts at the network rate until the server says
        // otherwise in its hello
        let output_stage = OutputStage::new(network_rate, device_rate).map_err(Error::Codec)?;

        let (events, events_rx) = EventBus::channel();

        Ok(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            audio_config: config.audio.clone(),
            ota_config: config.ota.clone(),
            shared: Mutex::new(Shared {
                device_state: DeviceState::Unknown,
                action_state: ActionState::Sleep,
                keep_listening: false,
                aborted: false,
                tasks: VecDeque::new(),
            }),
            voice_detected: AtomicBool::new(false),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            background: BackgroundTask::new(),
            decode_queue: Mutex::new(VecDeque::new()),
            input_stage: Mutex::new(input_stage),
            reference_stage: Mutex::new(reference_stage),
            encoder: Arc::new(Mutex::new(encoder)),
            output_stage: Arc::new(Mutex::new(output_stage)),
            last_output: Mutex::new(Instant::now()),
            driver: Arc::new(Mutex::new(collaborators.driver)),
            protocol: collaborators.protocol,
            display: collaborators.display,
            ota: collaborators.ota,
            motion: collaborators.motion,
            wake_word: collaborators.wake_word,
            action: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        }))
    }

    /// Start the driver, the session and all coordinator threads
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.set_device_state(DeviceState::Starting);

        let driver_started = self.driver.lock().start(self.events.clone());
        if let Err(e) = driver_started {
            self.fatal_error(&format!("audio driver failed: {}", e));
            return Err(Error::Audio(e));
        }

        let listener: Arc<dyn ProtocolListener> = self.clone();
        self.protocol.start(listener).map_err(Error::Protocol)?;

        *self.action.lock() = Some(ActionRunner::start(self.motion.clone()));

        let Some(rx) = self.events_rx.lock().take() else {
            return Err(Error::Config("application cannot be restarted".to_string()));
        };
        let main = {
            let app = self.clone();
            thread::Builder::new()
                .name("main-loop".to_string())
                .spawn(move || app.main_loop(rx))
                .map_err(|e| Error::Config(e.to_string()))?
        };
        self.threads.lock().push(main);

        self.set_device_state(DeviceState::Idle);

        if self.ota_config.enabled {
            let app = self.clone();
            let ota = thread::Builder::new()
                .name("ota-check".to_string())
                .spawn(move || app.ota_loop())
                .map_err(|e| Error::Config(e.to_string()))?;
            self.threads.lock().push(ota);
        }

        Ok(())
    }

    /// Stop all coordinator threads and quiesce audio
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.events.shutdown();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
        if let Some(mut runner) = self.action.lock().take() {
            runner.stop();
        }
        self.background.wait_for_idle();
        self.driver.lock().stop();
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    fn main_loop(self: Arc<Self>, rx: Receiver<MainEvent>) {
        tracing::debug!("main loop running");
        loop {
            let Ok(first) = rx.recv() else { break };

            // Wake on any, inspect all pending; duplicates collapse into
            // one flag per kind
            let mut schedule_ready = false;
            let mut input_ready = false;
            let mut output_ready = false;
            let mut shutdown = false;
            for event in std::iter::once(first).chain(rx.try_iter()) {
                match event {
                    MainEvent::ScheduleReady => schedule_ready = true,
                    MainEvent::AudioInputReady => input_ready = true,
                    MainEvent::AudioOutputReady => output_ready = true,
                    MainEvent::Shutdown => shutdown = true,
                }
            }
            if shutdown {
                break;
            }

            // Scheduled tasks run before audio so state transitions stay
            // timely relative to audio routing
            if schedule_ready {
                self.drain_scheduled_tasks();
            }
            if input_ready {
                self.input_audio();
            }
            if output_ready {
                self.output_audio();
            }
        }
        tracing::debug!("main loop exited");
    }

    fn drain_scheduled_tasks(&self) {
        // Swap the queue out so the lock is not held during execution;
        // tasks scheduled from within a task land on the next drain
        let tasks: VecDeque<ScheduledTask> = {
            let mut shared = self.shared.lock();
            std::mem::take(&mut shared.tasks)
        };
        for task in tasks {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::error!("scheduled task panicked, main loop continues");
            }
        }
    }

    /// Defer a callback onto the main loop (FIFO, exactly once)
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.lock().tasks.push_back(Box::new(task));
        self.events.notify_schedule();
    }

    // ------------------------------------------------------------------
    // Device state machine
    // ------------------------------------------------------------------

    pub fn device_state(&self) -> DeviceState {
        self.shared.lock().device_state
    }

    pub fn action_state(&self) -> ActionState {
        self.shared.lock().action_state
    }

    pub fn is_voice_detected(&self) -> bool {
        self.voice_detected.load(Ordering::Acquire)
    }

    /// Flag from the audio front end; the display reads it back
    pub fn set_voice_detected(&self, detected: bool) {
        self.voice_detected.store(detected, Ordering::Release);
    }

    /// Transition the device state machine
    ///
    /// Idempotent no-op when the state is unchanged. Safe from any
    /// thread; exit and entry side effects run without the state lock.
    pub fn set_device_state(&self, new_state: DeviceState) {
        let previous = {
            let mut shared = self.shared.lock();
            if shared.device_state == new_state {
                return;
            }
            let previous = shared.device_state;
            shared.device_state = new_state;
            previous
        };
        tracing::info!(from = %previous, to = %new_state, "device state");

        // Exit side effects
        if previous == DeviceState::Listening {
            // A partial frame must not leak into the next turn
            self.input_stage.lock().clear();
        }

        // Entry side effects
        self.display.on_device_state(new_state);
        match new_state {
            DeviceState::Starting => self.display.set_status("starting..."),
            DeviceState::WifiConfiguring => self.display.set_status("configure wifi"),
            DeviceState::Idle => {
                self.display.set_status("standby");
                self.display.set_emotion("neutral");
            }
            DeviceState::Connecting => self.display.set_status("connecting..."),
            DeviceState::Listening => {
                self.display.set_status("listening...");
                let encoder = self.encoder.clone();
                self.background.schedule(move || {
                    if let Err(e) = encoder.lock().reset() {
                        tracing::warn!("encoder reset failed: {}", e);
                    }
                });
            }
            DeviceState::Speaking => {
                self.display.set_status("speaking...");
                self.reset_decoder();
                // First frame plays immediately instead of one period in
                let frame_duration = self.frame_duration();
                let mut last = self.last_output.lock();
                *last = Instant::now()
                    .checked_sub(frame_duration)
                    .unwrap_or_else(Instant::now);
            }
            DeviceState::Upgrading => self.display.set_status("upgrading..."),
            DeviceState::FatalError => self.display.set_status("error"),
            DeviceState::Unknown => {}
        }
    }

    /// Record a gesture change and signal the action runner
    pub fn set_action_state(&self, action: ActionState) {
        {
            let mut shared = self.shared.lock();
            if shared.action_state == action {
                return;
            }
            shared.action_state = action;
        }
        self.display.on_action_state(action);
        if let Some(runner) = self.action.lock().as_ref() {
            runner.signal(action);
        }
    }

    /// Log a problem and surface it on the face
    pub fn alert(&self, title: &str, message: &str) {
        tracing::warn!(title, message, "alert");
        self.display.alert(title, message);
    }

    fn fatal_error(&self, message: &str) {
        self.set_device_state(DeviceState::FatalError);
        self.alert("fatal error", message);
        self.driver.lock().stop();
    }

    // ------------------------------------------------------------------
    // Chat intents
    // ------------------------------------------------------------------

    /// Flip between idle and listening; interrupts speech
    pub fn toggle_chat_state(&self) {
        let Some(app) = self.weak.upgrade() else { return };
        self.schedule(move || match app.device_state() {
            DeviceState::Idle | DeviceState::Starting => {
                app.shared.lock().keep_listening = true;
                app.start_listening_now();
            }
            DeviceState::Speaking => app.abort_speaking(AbortReason::None),
            DeviceState::Listening => app.close_chat(),
            other => tracing::debug!(state = %other, "toggle ignored"),
        });
    }

    /// Enter the listening state (idempotent)
    pub fn start_listening(&self) {
        let Some(app) = self.weak.upgrade() else { return };
        self.schedule(move || app.start_listening_now());
    }

    /// Leave the listening state (idempotent)
    pub fn stop_listening(&self) {
        let Some(app) = self.weak.upgrade() else { return };
        self.schedule(move || app.stop_listening_now());
    }

    /// Wake-word hit from the audio front end
    pub fn on_wake_word_detected(&self, word: &str) {
        let Some(app) = self.weak.upgrade() else { return };
        let word = word.to_string();
        self.schedule(move || {
            tracing::info!(word = %word, "wake word detected");
            match app.device_state() {
                DeviceState::Idle => {
                    app.shared.lock().keep_listening = true;
                    app.start_listening_now();
                }
                DeviceState::Speaking => app.abort_speaking(AbortReason::WakeWord),
                _ => {}
            }
        });
    }

    fn start_listening_now(&self) {
        match self.device_state() {
            DeviceState::Listening => {}
            DeviceState::Idle | DeviceState::Starting => {
                if !self.ensure_audio_channel() {
                    return;
                }
                let mode = if self.shared.lock().keep_listening {
                    ListenMode::AlwaysOn
                } else {
                    ListenMode::AutoStop
                };
                if let Err(e) = self.protocol.send_start_listening(mode) {
                    tracing::warn!("start listening failed: {}", e);
                    return;
                }
                self.set_device_state(DeviceState::Listening);
            }
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::None);
                if self.device_state() != DeviceState::Listening {
                    if self.ensure_audio_channel()
                        && self
                            .protocol
                            .send_start_listening(ListenMode::AutoStop)
                            .is_ok()
                    {
                        self.set_device_state(DeviceState::Listening);
                    }
                }
            }
            other => tracing::debug!(state = %other, "start listening ignored"),
        }
    }

    fn stop_listening_now(&self) {
        if self.device_state() != DeviceState::Listening {
            return;
        }
        if let Err(e) = self.protocol.send_stop_listening() {
            tracing::warn!("stop listening failed: {}", e);
        }
        self.set_device_state(DeviceState::Idle);
    }

    fn close_chat(&self) {
        self.shared.lock().keep_listening = false;
        self.protocol.close_audio_channel();
        self.set_device_state(DeviceState::Idle);
    }

    /// Open the audio channel, showing progress through Connecting
    fn ensure_audio_channel(&self) -> bool {
        if self.protocol.is_audio_channel_opened() {
            return true;
        }
        self.set_device_state(DeviceState::Connecting);
        match self.protocol.open_audio_channel() {
            Ok(()) => true,
            Err(e) => {
                self.alert("connection failed", &e.to_string());
                self.set_device_state(DeviceState::Idle);
                false
            }
        }
    }

    /// Cancel an in-progress speaking turn
    ///
    /// Clears pending decode work, flushes playback, tells the server,
    /// and lands in Listening or Idle depending on `keep_listening`.
    pub fn abort_speaking(&self, reason: AbortReason) {
        if self.device_state() != DeviceState::Speaking {
            return;
        }
        tracing::info!(?reason, "abort speaking");

        self.shared.lock().aborted = true;
        self.decode_queue.lock().clear();
        self.driver.lock().flush_output();
        if let Err(e) = self.protocol.send_abort_speaking(reason) {
            tracing::warn!("abort notify failed: {}", e);
        }

        let keep = self.shared.lock().keep_listening;
        if keep {
            if let Err(e) = self.protocol.send_start_listening(ListenMode::AlwaysOn) {
                tracing::warn!("start listening failed: {}", e);
            }
            self.set_device_state(DeviceState::Listening);
        } else {
            self.set_device_state(DeviceState::Idle);
        }
    }

    // ------------------------------------------------------------------
    // Audio pipeline
    // ------------------------------------------------------------------

    fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.audio_config.frame_duration_ms as u64)
    }

    /// One microphone frame per wake: resample, then encode and send on
    /// the background worker
    fn input_audio(&self) {
        let frame = self.driver.lock().read();
        let Some(frame) = frame else { return };

        if self.device_state() != DeviceState::Listening {
            if let Some(wake_word) = &self.wake_word {
                // The front end runs at the network rate
                match self.reference_stage.lock().process(&frame.samples) {
                    Ok(frames) => {
                        for pcm in frames {
                            wake_word.feed(&pcm);
                        }
                    }
                    Err(e) => tracing::debug!("reference resample failed: {}", e),
                }
            }
            return;
        }

        let frames = match self.input_stage.lock().process(&frame.samples) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!("input resample failed, frame dropped: {}", e);
                return;
            }
        };

        for pcm in frames {
            let encoder = self.encoder.clone();
            let protocol = self.protocol.clone();
            self.background.schedule(move || {
                match encoder.lock().encode(&pcm) {
                    Ok(encoded) => {
                        if let Err(e) = protocol.send_audio(encoded) {
                            tracing::warn!("audio send failed, frame dropped: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("encode failed, frame dropped: {}", e),
                }
            });
        }
    }

    /// One playback frame per wake, paced on the steady clock; an empty
    /// decode queue is silence, never a block
    fn output_audio(&self) {
        {
            let last = self.last_output.lock();
            if last.elapsed() < self.frame_duration() {
                return;
            }
        }
        if self.device_state() != DeviceState::Speaking {
            return;
        }

        let Some(packet) = self.decode_queue.lock().pop_front() else {
            return;
        };
        *self.last_output.lock() = Instant::now();

        let stage = self.output_stage.clone();
        let driver = self.driver.clone();
        self.background.schedule(move || {
            let decoded = { stage.lock().decode(&packet) };
            match decoded {
                Ok(pcm) if !pcm.is_empty() => {
                    if let Err(e) = driver.lock().write(&pcm) {
                        tracing::warn!("playback write failed: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("decode failed, frame dropped: {}", e),
            }
        });
    }

    /// Discard queued frames and rebuild decoder state at the current
    /// rate. Queue first, then idle-wait, then swap: no stale frame can
    /// reach the fresh decoder.
    pub fn reset_decoder(&self) {
        self.decode_queue.lock().clear();
        self.background.wait_for_idle();
        if let Err(e) = self.output_stage.lock().reset() {
            tracing::warn!("decoder reset failed: {}", e);
        }
    }

    /// Adopt a newly negotiated decode rate, discarding frames encoded
    /// for the old one
    pub fn set_decode_sample_rate(&self, sample_rate: u32) {
        if self.output_stage.lock().sample_rate == sample_rate {
            return;
        }
        tracing::info!(sample_rate, "decode sample rate changed");

        self.decode_queue.lock().clear();
        self.background.wait_for_idle();
        if let Err(e) = self.output_stage.lock().set_sample_rate(sample_rate) {
            // A decoder that cannot be rebuilt leaves no playback path
            self.fatal_error(&format!("decoder rebuild failed: {}", e));
        }
    }

    /// Frames waiting to be decoded
    pub fn decode_queue_len(&self) -> usize {
        self.decode_queue.lock().len()
    }

    // ------------------------------------------------------------------
    // Upgrade flow
    // ------------------------------------------------------------------

    fn ota_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.ota_config.check_interval_secs);
        let mut validated = false;
        while self.running.load(Ordering::SeqCst) {
            match self.ota.check_new_version() {
                Ok(Some(version)) => {
                    let app = self.clone();
                    self.schedule(move || app.begin_upgrade(&version));
                    return;
                }
                Ok(None) => {
                    if !validated {
                        self.ota.mark_current_version_valid();
                        validated = true;
                    }
                }
                Err(e) => {
                    tracing::warn!("version check failed: {}", e);
                    self.display.show_notification("update check failed");
                }
            }

            let deadline = Instant::now() + interval;
            while Instant::now() < deadline && self.running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(200));
            }
        }
    }

    /// Quiesce audio and hand control to the OTA collaborator
    ///
    /// Runs on the main loop. Success reboots the device inside
    /// `upgrade`; failure must land back in a safe state, never stuck in
    /// Upgrading.
    fn begin_upgrade(&self, version: &NewVersion) {
        tracing::info!(version = %version.version, "starting upgrade");
        self.display.show_notification("new version available");

        self.set_device_state(DeviceState::Upgrading);
        self.protocol.close_audio_channel();
        self.background.wait_for_idle();
        self.driver.lock().stop();

        match self.ota.upgrade(version) {
            Ok(()) => tracing::info!("upgrade applied, awaiting reboot"),
            Err(e) => {
                self.alert("upgrade failed", &e.to_string());
                let restarted = self.driver.lock().start(self.events.clone());
                match restarted {
                    Ok(()) => self.set_device_state(DeviceState::Idle),
                    Err(audio_err) => self.fatal_error(&audio_err.to_string()),
                }
            }
        }
    }
}

impl ProtocolListener for Application {
    fn on_incoming_audio(&self, frame: Bytes) {
        let accept = {
            let shared = self.shared.lock();
            shared.device_state == DeviceState::Speaking && !shared.aborted
        };
        if accept {
            self.decode_queue.lock().push_back(frame);
        }
    }

    fn on_incoming_json(&self, payload: Value) {
        let Some(app) = self.weak.upgrade() else { return };
        match payload["type"].as_str().unwrap_or("") {
            "hello" => {
                if let Some(rate) = payload["audio_params"]["sample_rate"].as_u64() {
                    self.schedule(move || app.set_decode_sample_rate(rate as u32));
                }
            }
            "tts" => {
                let state = payload["state"].as_str().unwrap_or("").to_string();
                let text = payload["text"].as_str().map(str::to_string);
                self.schedule(move || app.handle_tts_event(&state, text.as_deref()));
            }
            "stt" => {
                if let Some(text) = payload["text"].as_str() {
                    self.display.set_chat_message("user", text);
                }
            }
            "llm" => {
                if let Some(emotion) = payload["emotion"].as_str() {
                    self.display.set_emotion(emotion);
                }
            }
            "goodbye" => {
                self.schedule(move || app.protocol.close_audio_channel());
            }
            other => tracing::debug!(kind = other, "unhandled server message"),
        }
    }

    fn on_audio_channel_closed(&self) {
        let Some(app) = self.weak.upgrade() else { return };
        self.schedule(move || {
            if !matches!(
                app.device_state(),
                DeviceState::Upgrading | DeviceState::FatalError
            ) {
                app.set_device_state(DeviceState::Idle);
            }
        });
    }
}

impl Application {
    fn handle_tts_event(&self, state: &str, text: Option<&str>) {
        match state {
            "start" => {
                self.shared.lock().aborted = false;
                if matches!(
                    self.device_state(),
                    DeviceState::Idle | DeviceState::Listening
                ) {
                    self.set_device_state(DeviceState::Speaking);
                }
            }
            "stop" => {
                if self.device_state() == DeviceState::Speaking {
                    let keep = self.shared.lock().keep_listening;
                    if keep {
                        if let Err(e) = self.protocol.send_start_listening(ListenMode::AlwaysOn) {
                            tracing::warn!("start listening failed: {}", e);
                        }
                        self.set_device_state(DeviceState::Listening);
                    } else {
                        self.set_device_state(DeviceState::Idle);
                    }
                }
            }
            "sentence_start" => {
                if let Some(text) = text {
                    self.display.set_chat_message("assistant", text);
                }
            }
            other => tracing::debug!(state = other, "unhandled tts event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::AudioFrame;
    use crate::error::{AudioError, OtaError};
    use crate::ota::DisabledOta;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    // ---- mock collaborators ----

    #[derive(Default)]
    struct DriverShared {
        input: Mutex<VecDeque<AudioFrame>>,
        written: Mutex<Vec<f32>>,
        flushes: AtomicUsize,
        events: Mutex<Option<EventBus>>,
        fail_start: AtomicBool,
        started: AtomicBool,
    }

    impl DriverShared {
        fn feed_frame(&self, samples: Vec<f32>) {
            self.input
                .lock()
                .push_back(AudioFrame::new(samples, 16_000));
            if let Some(events) = self.events.lock().as_ref() {
                events.notify_audio_input_ready();
            }
        }
    }

    struct TestDriver {
        shared: Arc<DriverShared>,
    }

    impl AudioDriver for TestDriver {
        fn start(&mut self, events: EventBus) -> std::result::Result<(), AudioError> {
            if self.shared.fail_start.load(Ordering::SeqCst) {
                return Err(AudioError::DeviceNotFound("test".to_string()));
            }
            self.shared.started.store(true, Ordering::SeqCst);
            *self.shared.events.lock() = Some(events);
            Ok(())
        }

        fn read(&mut self) -> Option<AudioFrame> {
            self.shared.input.lock().pop_front()
        }

        fn write(&mut self, samples: &[f32]) -> std::result::Result<(), AudioError> {
            self.shared.written.lock().extend_from_slice(samples);
            Ok(())
        }

        fn flush_output(&mut self) {
            self.shared.flushes.fetch_add(1, Ordering::SeqCst);
        }

        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn stop(&mut self) {
            self.shared.started.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct TestProtocol {
        opened: AtomicBool,
        open_calls: AtomicUsize,
        sent_audio: Mutex<Vec<Bytes>>,
        start_listening_calls: AtomicUsize,
        stop_listening_calls: AtomicUsize,
        aborts: Mutex<Vec<AbortReason>>,
        listener: Mutex<Option<Arc<dyn ProtocolListener>>>,
    }

    impl TestProtocol {
        fn listener(&self) -> Arc<dyn ProtocolListener> {
            self.listener.lock().clone().expect("protocol not started")
        }
    }

    impl ProtocolClient for TestProtocol {
        fn start(
            &self,
            listener: Arc<dyn ProtocolListener>,
        ) -> std::result::Result<(), crate::error::ProtocolError> {
            *self.listener.lock() = Some(listener);
            Ok(())
        }

        fn open_audio_channel(&self) -> std::result::Result<(), crate::error::ProtocolError> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            self.opened.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn close_audio_channel(&self) {
            if self.opened.swap(false, Ordering::SeqCst) {
                if let Some(listener) = self.listener.lock().clone() {
                    listener.on_audio_channel_closed();
                }
            }
        }

        fn is_audio_channel_opened(&self) -> bool {
            self.opened.load(Ordering::SeqCst)
        }

        fn send_audio(&self, frame: Bytes) -> std::result::Result<(), crate::error::ProtocolError> {
            self.sent_audio.lock().push(frame);
            Ok(())
        }

        fn send_start_listening(
            &self,
            _mode: ListenMode,
        ) -> std::result::Result<(), crate::error::ProtocolError> {
            self.start_listening_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn send_stop_listening(&self) -> std::result::Result<(), crate::error::ProtocolError> {
            self.stop_listening_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn send_abort_speaking(
            &self,
            reason: AbortReason,
        ) -> std::result::Result<(), crate::error::ProtocolError> {
            self.aborts.lock().push(reason);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestDisplay {
        states: Mutex<Vec<DeviceState>>,
        alerts: Mutex<Vec<String>>,
    }

    impl FaceDisplay for TestDisplay {
        fn on_device_state(&self, state: DeviceState) {
            self.states.lock().push(state);
        }

        fn on_action_state(&self, _action: ActionState) {}
        fn set_status(&self, _text: &str) {}
        fn set_chat_message(&self, _role: &str, _text: &str) {}
        fn set_emotion(&self, _emotion: &str) {}
        fn show_notification(&self, _text: &str) {}

        fn alert(&self, title: &str, _message: &str) {
            self.alerts.lock().push(title.to_string());
        }
    }

    struct NoMotion;

    impl MotionDriver for NoMotion {
        fn perform(&self, _action: ActionState) {}
        fn halt(&self) {}
    }

    struct TestOta {
        version: Option<NewVersion>,
        upgrades: AtomicUsize,
    }

    impl OtaUpdater for TestOta {
        fn check_new_version(&self) -> std::result::Result<Option<NewVersion>, OtaError> {
            Ok(self.version.clone())
        }

        fn mark_current_version_valid(&self) {}

        fn upgrade(&self, _version: &NewVersion) -> std::result::Result<(), OtaError> {
            self.upgrades.fetch_add(1, Ordering::SeqCst);
            Err(OtaError::FlashFailed("test".to_string()))
        }
    }

    struct Fixture {
        app: Arc<Application>,
        driver: Arc<DriverShared>,
        protocol: Arc<TestProtocol>,
        display: Arc<TestDisplay>,
    }

    fn fixture_with(ota: Arc<dyn OtaUpdater>, ota_enabled: bool, fail_start: bool) -> Fixture {
        let mut config = AppConfig::default();
        config.audio.device_sample_rate = 16_000;
        config.audio.network_sample_rate = 16_000;
        config.ota.enabled = ota_enabled;

        let driver = Arc::new(DriverShared::default());
        driver.fail_start.store(fail_start, Ordering::SeqCst);
        let protocol = Arc::new(TestProtocol::default());
        let display = Arc::new(TestDisplay::default());

        let app = Application::new(
            &config,
            Collaborators {
                driver: Box::new(TestDriver {
                    shared: driver.clone(),
                }),
                protocol: protocol.clone(),
                display: display.clone(),
                ota,
                motion: Arc::new(NoMotion),
                wake_word: None,
            },
        )
        .unwrap();

        Fixture {
            app,
            driver,
            protocol,
            display,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(DisabledOta), false, false)
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    // ---- state machine ----

    #[test]
    fn test_set_device_state_idempotent() {
        let f = fixture();

        f.app.set_device_state(DeviceState::Idle);
        f.app.set_device_state(DeviceState::Idle);
        f.app.set_device_state(DeviceState::Idle);
        assert_eq!(*f.display.states.lock(), vec![DeviceState::Idle]);

        f.app.set_device_state(DeviceState::Connecting);
        assert_eq!(f.app.device_state(), DeviceState::Connecting);
        assert_eq!(
            *f.display.states.lock(),
            vec![DeviceState::Idle, DeviceState::Connecting]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_state_is_last_write(indices in proptest::collection::vec(0usize..8, 1..16)) {
            let states = [
                DeviceState::Starting,
                DeviceState::WifiConfiguring,
                DeviceState::Idle,
                DeviceState::Connecting,
                DeviceState::Listening,
                DeviceState::Speaking,
                DeviceState::Upgrading,
                DeviceState::FatalError,
            ];
            let f = fixture();
            for &i in &indices {
                f.app.set_device_state(states[i]);
                prop_assert_eq!(f.app.device_state(), states[i]);
            }
            prop_assert_eq!(f.app.device_state(), states[*indices.last().unwrap()]);
        }
    }

    // ---- scheduled tasks ----

    #[test]
    fn test_scheduled_tasks_fifo_exactly_once() {
        let f = fixture();
        f.app.start().unwrap();

        let order: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            let app = f.app.clone();
            let reentrant = i == 3;
            f.app.schedule(move || {
                order.lock().push(i);
                if reentrant {
                    let order = order.clone();
                    app.schedule(move || order.lock().push(100));
                }
            });
        }

        assert!(wait_until(|| order.lock().len() == 11));
        thread::sleep(Duration::from_millis(50));
        let recorded = order.lock().clone();
        assert_eq!(recorded.len(), 11, "each task runs exactly once");

        // Submission order is preserved among the original tasks, and
        // the re-entrant task lands on a later drain than its parent
        let positions: Vec<usize> = (0..10)
            .map(|i| recorded.iter().position(|&x| x == i).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        let nested = recorded.iter().position(|&x| x == 100).unwrap();
        assert!(nested > positions[3]);

        f.app.stop();
    }

    #[test]
    fn test_panicking_task_does_not_kill_loop() {
        let f = fixture();
        f.app.start().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        f.app.schedule(|| panic!("boom"));
        let flag = ran.clone();
        f.app.schedule(move || flag.store(true, Ordering::SeqCst));

        assert!(wait_until(|| ran.load(Ordering::SeqCst)));
        f.app.stop();
    }

    // ---- audio pipeline ----

    #[test]
    fn test_output_audio_empty_queue_is_noop() {
        let f = fixture();

        f.app.set_device_state(DeviceState::Speaking);
        f.app.output_audio();
        f.app.background.wait_for_idle();

        assert!(f.driver.written.lock().is_empty());
        assert_eq!(f.app.decode_queue_len(), 0);
    }

    #[test]
    fn test_decode_rate_change_discards_stale_frames() {
        let f = fixture();

        f.app.set_device_state(DeviceState::Speaking);
        for _ in 0..3 {
            f.app.on_incoming_audio(Bytes::from_static(b"stale"));
        }
        assert_eq!(f.app.decode_queue_len(), 3);

        f.app.set_decode_sample_rate(24_000);
        assert_eq!(f.app.decode_queue_len(), 0);
        assert_eq!(f.app.output_stage.lock().sample_rate, 24_000);

        // Nothing stale left for the fresh decoder
        f.app.output_audio();
        f.app.background.wait_for_idle();
        assert!(f.driver.written.lock().is_empty());
    }

    #[test]
    fn test_abort_speaking_clears_queue_and_goes_idle() {
        let f = fixture();

        f.app.set_device_state(DeviceState::Speaking);
        for _ in 0..3 {
            f.app.on_incoming_audio(Bytes::from_static(b"frame"));
        }
        assert_eq!(f.app.decode_queue_len(), 3);

        f.app.abort_speaking(AbortReason::User);

        assert_eq!(f.app.decode_queue_len(), 0);
        assert_eq!(f.app.device_state(), DeviceState::Idle);
        assert_eq!(*f.protocol.aborts.lock(), vec![AbortReason::User]);
        assert!(f.driver.flushes.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_abort_speaking_keeps_listening() {
        let f = fixture();

        f.app.shared.lock().keep_listening = true;
        f.app.set_device_state(DeviceState::Speaking);
        f.app.on_incoming_audio(Bytes::from_static(b"frame"));

        f.app.abort_speaking(AbortReason::WakeWord);

        assert_eq!(f.app.device_state(), DeviceState::Listening);
        assert_eq!(f.app.decode_queue_len(), 0);
        assert_eq!(f.protocol.start_listening_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abort_outside_speaking_is_noop() {
        let f = fixture();
        f.app.set_device_state(DeviceState::Idle);

        f.app.abort_speaking(AbortReason::User);

        assert_eq!(f.app.device_state(), DeviceState::Idle);
        assert!(f.protocol.aborts.lock().is_empty());
    }

    #[test]
    fn test_start_listening_encodes_and_sends_one_frame() {
        let f = fixture();
        f.app.start().unwrap();

        f.app.start_listening();
        assert!(wait_until(|| f.app.device_state() == DeviceState::Listening));
        assert_eq!(f.protocol.open_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.protocol.start_listening_calls.load(Ordering::SeqCst), 1);

        // One synthetic 60 ms frame at the (equal) device/network rate
        f.driver.feed_frame(vec![0.01f32; 960]);
        assert!(wait_until(|| f.protocol.sent_audio.lock().len() == 1));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(f.protocol.sent_audio.lock().len(), 1, "sent exactly once");

        f.app.stop();
    }

    #[test]
    fn test_frames_discarded_when_not_listening() {
        let f = fixture();
        f.app.start().unwrap();

        assert_eq!(f.app.device_state(), DeviceState::Idle);
        f.driver.feed_frame(vec![0.01f32; 960]);

        thread::sleep(Duration::from_millis(100));
        assert!(f.protocol.sent_audio.lock().is_empty());

        f.app.stop();
    }

    #[test]
    fn test_toggle_chat_roundtrip() {
        let f = fixture();
        f.app.start().unwrap();

        f.app.toggle_chat_state();
        assert!(wait_until(|| f.app.device_state() == DeviceState::Listening));
        assert!(f.protocol.is_audio_channel_opened());

        f.app.toggle_chat_state();
        assert!(wait_until(|| f.app.device_state() == DeviceState::Idle));
        assert!(!f.protocol.is_audio_channel_opened());

        f.app.stop();
    }

    #[test]
    fn test_stop_listening_is_idempotent() {
        let f = fixture();
        f.app.start().unwrap();

        f.app.start_listening();
        assert!(wait_until(|| f.app.device_state() == DeviceState::Listening));

        f.app.stop_listening();
        assert!(wait_until(|| f.app.device_state() == DeviceState::Idle));
        assert_eq!(f.protocol.stop_listening_calls.load(Ordering::SeqCst), 1);

        // A second stop is a no-op
        f.app.stop_listening();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(f.protocol.stop_listening_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.app.device_state(), DeviceState::Idle);

        f.app.stop();
    }

    #[test]
    fn test_tts_events_drive_speaking_turn() {
        let f = fixture();
        f.app.start().unwrap();

        f.app.toggle_chat_state();
        assert!(wait_until(|| f.app.device_state() == DeviceState::Listening));

        let listener = f.protocol.listener();
        listener.on_incoming_json(serde_json::json!({"type": "tts", "state": "start"}));
        assert!(wait_until(|| f.app.device_state() == DeviceState::Speaking));

        listener.on_incoming_audio(Bytes::from_static(b"frame"));
        assert!(wait_until(|| f.app.decode_queue_len() == 1));

        // keep_listening was set by the toggle, so the turn ends back in
        // Listening
        listener.on_incoming_json(serde_json::json!({"type": "tts", "state": "stop"}));
        assert!(wait_until(|| f.app.device_state() == DeviceState::Listening));

        f.app.stop();
    }

    #[test]
    fn test_hello_negotiates_decode_rate() {
        let f = fixture();
        f.app.start().unwrap();

        f.protocol.listener().on_incoming_json(serde_json::json!({
            "type": "hello",
            "audio_params": {"sample_rate": 24_000},
        }));

        assert!(wait_until(|| f.app.output_stage.lock().sample_rate == 24_000));
        f.app.stop();
    }

    #[test]
    fn test_idle_frames_reach_wake_word_front_end() {
        struct RecordingWake {
            fed: Mutex<Vec<usize>>,
        }

        impl WakeWordDetector for RecordingWake {
            fn feed(&self, samples: &[f32]) {
                self.fed.lock().push(samples.len());
            }
        }

        let mut config = AppConfig::default();
        config.audio.device_sample_rate = 16_000;
        config.audio.network_sample_rate = 16_000;
        config.ota.enabled = false;

        let driver = Arc::new(DriverShared::default());
        let wake = Arc::new(RecordingWake {
            fed: Mutex::new(Vec::new()),
        });
        let app = Application::new(
            &config,
            Collaborators {
                driver: Box::new(TestDriver {
                    shared: driver.clone(),
                }),
                protocol: Arc::new(TestProtocol::default()),
                display: Arc::new(TestDisplay::default()),
                ota: Arc::new(DisabledOta),
                motion: Arc::new(NoMotion),
                wake_word: Some(wake.clone()),
            },
        )
        .unwrap();
        app.start().unwrap();

        driver.feed_frame(vec![0.01f32; 960]);
        assert!(wait_until(|| !wake.fed.lock().is_empty()));
        assert_eq!(wake.fed.lock()[0], 960);

        app.stop();
    }

    #[test]
    fn test_wake_word_aborts_speaking() {
        let f = fixture();
        f.app.start().unwrap();

        f.app.set_device_state(DeviceState::Speaking);
        f.app.on_wake_word_detected("hey pet");

        assert!(wait_until(|| f.app.device_state() == DeviceState::Idle));
        assert_eq!(*f.protocol.aborts.lock(), vec![AbortReason::WakeWord]);

        f.app.stop();
    }

    // ---- faults ----

    #[test]
    fn test_driver_start_failure_is_fatal() {
        let f = fixture_with(Arc::new(DisabledOta), false, true);

        assert!(f.app.start().is_err());
        assert_eq!(f.app.device_state(), DeviceState::FatalError);
        assert!(!f.display.alerts.lock().is_empty());
    }

    #[test]
    fn test_failed_upgrade_returns_to_idle() {
        let ota = Arc::new(TestOta {
            version: Some(NewVersion {
                version: "2.0.0".to_string(),
                url: "http://updates/2.0.0".to_string(),
            }),
            upgrades: AtomicUsize::new(0),
        });
        let f = fixture_with(ota.clone(), true, false);
        f.app.start().unwrap();

        assert!(wait_until(|| {
            ota.upgrades.load(Ordering::SeqCst) == 1
                && f.app.device_state() == DeviceState::Idle
        }));
        assert!(f
            .display
            .alerts
            .lock()
            .iter()
            .any(|title| title == "upgrade failed"));
        // Audio came back after the failed attempt
        assert!(f.driver.started.load(Ordering::SeqCst));

        f.app.stop();
    }
}
