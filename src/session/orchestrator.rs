//! The interview state machine.
//!
//! `SessionOrchestrator` is the only writer of session records. Transport
//! activity reaches it as `TransportEvent`s and capture frames on channels it
//! drains in `process_next`/`drain_pending`; nothing mutates its state from
//! another task.

use crate::audio::pcm::PcmFrame;
use crate::audio::player::AudioSink;
use crate::audio::recorder::{CaptureSource, FrameCallback};
use crate::config::{OverlapPolicy, SessionConfig};
use crate::error::{ReflectaError, Result};
use crate::fallback::client::{QaPair, QuestionGenerator};
use crate::prompt;
use crate::session::model::{
    ContentItem, ContentPatch, ContentStatus, Exchange, Session, SessionPatch,
};
use crate::session::store::RecordStore;
use crate::transport::connection::{
    ConnectionManager, ConnectionState, Credentials, TransportEvent, TransportEventKind,
};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    /// A reply has been requested and has not finalized yet.
    Thinking,
    Completed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Active => "active",
            SessionState::Thinking => "thinking",
            SessionState::Completed => "completed",
        };
        f.write_str(label)
    }
}

/// How questions reach the user for the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Streaming,
    Fallback,
}

/// The two record stores the orchestrator writes to.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn RecordStore<Session>>,
    pub contents: Arc<dyn RecordStore<ContentItem>>,
}

impl Stores {
    pub fn new(
        sessions: Arc<dyn RecordStore<Session>>,
        contents: Arc<dyn RecordStore<ContentItem>>,
    ) -> Self {
        Self { sessions, contents }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSessionInput {
    pub content_id: String,
    /// Capture the microphone while streaming.
    pub voice_input: bool,
}

impl StartSessionInput {
    pub fn new(content_id: &str) -> Self {
        Self {
            content_id: content_id.to_string(),
            voice_input: false,
        }
    }

    pub fn with_voice(mut self) -> Self {
        self.voice_input = true;
        self
    }
}

/// Per-session bookkeeping that only exists while a session runs.
struct RunState {
    content: ContentItem,
    previous_status: ContentStatus,
    mode: DeliveryMode,
    /// Epoch of the connection this session listens to.
    connection: Option<u64>,
    awaiting_reply: bool,
    history: Vec<QaPair>,
    last_question: Option<String>,
    voice_input: bool,
    /// Transcribed speech not yet recorded as an answer.
    spoken: String,
    /// Cleared after the first playback failure until the stream is reopened.
    playback_available: bool,
}

enum Input {
    Event(TransportEvent),
    Frame(PcmFrame),
}

pub struct SessionOrchestrator {
    config: SessionConfig,
    realtime: bool,
    credentials: Option<Credentials>,
    stores: Stores,
    connection: ConnectionManager,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    questions: Arc<dyn QuestionGenerator>,
    capture: Option<Box<dyn CaptureSource>>,
    playback: Option<Box<dyn AudioSink>>,
    frames_tx: mpsc::UnboundedSender<PcmFrame>,
    frames_rx: mpsc::UnboundedReceiver<PcmFrame>,
    session: Option<Session>,
    run: Option<RunState>,
}

impl SessionOrchestrator {
    /// `events` must be the receiver returned alongside `connection`.
    pub fn new(
        config: SessionConfig,
        stores: Stores,
        connection: ConnectionManager,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        questions: Arc<dyn QuestionGenerator>,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        Self {
            config,
            realtime: true,
            credentials: None,
            stores,
            connection,
            events,
            questions,
            capture: None,
            playback: None,
            frames_tx,
            frames_rx,
            session: None,
            run: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials.filter(|c| !c.is_empty());
        self
    }

    /// Disable to always use fallback questions.
    pub fn with_realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    pub fn with_capture(mut self, capture: Box<dyn CaptureSource>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_playback(mut self, playback: Box<dyn AudioSink>) -> Self {
        self.playback = Some(playback);
        self
    }

    // ── Observers ───────────────────────────────────────────────────────

    /// The running session, or the last completed one.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn state(&self) -> SessionState {
        match (&self.run, &self.session) {
            (Some(run), _) if run.awaiting_reply => SessionState::Thinking,
            (Some(_), _) => SessionState::Active,
            (None, Some(session)) if session.is_completed() => SessionState::Completed,
            (None, _) => SessionState::Idle,
        }
    }

    pub fn exchanges(&self) -> &[Exchange] {
        self.session
            .as_ref()
            .map(|s| s.exchanges.as_slice())
            .unwrap_or(&[])
    }

    pub fn insights(&self) -> &[String] {
        self.session
            .as_ref()
            .map(|s| s.insights.as_slice())
            .unwrap_or(&[])
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// `None` when no session is running.
    pub fn delivery_mode(&self) -> Option<DeliveryMode> {
        self.run.as_ref().map(|run| run.mode)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start an interview about `input.content_id` and return the session id.
    ///
    /// A running session is first ended, cancelled or kept according to
    /// `SessionConfig::on_overlap`. In fallback mode the opening question is
    /// in the transcript when this returns; in streaming mode it arrives as
    /// a reply event.
    pub async fn start_session(&mut self, input: StartSessionInput) -> Result<String> {
        if let Some(active) = self.run.as_ref().and(self.session.as_ref()) {
            let active_id = active.id.clone();
            match self.config.on_overlap {
                OverlapPolicy::Reject => {
                    return Err(ReflectaError::SessionAlreadyActive { id: active_id });
                }
                OverlapPolicy::EndPrevious => {
                    info!(session_id = %active_id, "ending running session before starting another");
                    self.end_session().await?;
                }
                OverlapPolicy::CancelPrevious => {
                    info!(session_id = %active_id, "cancelling running session before starting another");
                    self.cancel_session().await?;
                }
            }
        }

        let content = self
            .stores
            .contents
            .get(&input.content_id)
            .await?
            .ok_or_else(|| ReflectaError::ContentNotFound {
                id: input.content_id.clone(),
            })?;

        self.session = None;
        self.discard_pending();

        let session = Session::new(&content.id);
        self.stores.sessions.add(session.clone()).await?;
        if let Err(e) = self
            .stores
            .contents
            .update(&content.id, ContentPatch::status(ContentStatus::Learning))
            .await
        {
            if let Err(rollback) = self.stores.sessions.delete(&session.id).await {
                warn!(session_id = %session.id, error = %rollback, "failed to remove session after content update failed");
            }
            return Err(e);
        }

        let session_id = session.id.clone();
        info!(session_id = %session_id, content_id = %content.id, "session started");

        let previous_status = content.status;
        let mut content = content;
        content.status = ContentStatus::Learning;

        self.session = Some(session);
        self.run = Some(RunState {
            content,
            previous_status,
            mode: DeliveryMode::Fallback,
            connection: None,
            awaiting_reply: false,
            history: Vec::new(),
            last_question: None,
            voice_input: input.voice_input,
            spoken: String::new(),
            playback_available: true,
        });

        if !self.realtime {
            info!(session_id = %session_id, "real-time mode disabled, using fallback questions");
        } else if self.credentials.is_none() {
            info!(session_id = %session_id, "no API key, using fallback questions");
        } else {
            match self.open_stream().await {
                Ok(()) => {
                    let kickoff = self.config.kickoff_message.clone();
                    self.send_streaming_text(&kickoff).await?;
                    return Ok(session_id);
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "streaming unavailable, using fallback questions");
                }
            }
        }

        self.ask_first_question().await?;
        Ok(session_id)
    }

    /// Finish the running session: persist the transcript and insights, mark
    /// the content completed, and release the transport and audio devices.
    ///
    /// If the session record cannot be written the session stays running on
    /// fallback questions, so the call can be retried.
    pub async fn end_session(&mut self) -> Result<Session> {
        if self.run.is_none() {
            return Err(ReflectaError::NoActiveSession);
        }
        self.record_spoken_answer().await?;
        let mut run = self.run.take().ok_or(ReflectaError::NoActiveSession)?;
        self.teardown().await;

        let mut finished = self
            .session
            .clone()
            .ok_or(ReflectaError::NoActiveSession)?;
        let completed_at = Utc::now();
        finished.completed_at = Some(completed_at);

        if let Err(e) = self
            .stores
            .sessions
            .update(
                &finished.id,
                SessionPatch {
                    exchanges: Some(finished.exchanges.clone()),
                    insights: Some(finished.insights.clone()),
                    completed_at: Some(completed_at),
                },
            )
            .await
        {
            warn!(session_id = %finished.id, error = %e, "session not completed, record write failed");
            run.mode = DeliveryMode::Fallback;
            run.connection = None;
            run.awaiting_reply = false;
            self.run = Some(run);
            return Err(e);
        }
        if let Some(session) = self.session.as_mut() {
            session.completed_at = Some(completed_at);
        }

        let mut summary = match self.stores.contents.get(&run.content.id).await? {
            Some(current) => current.summary,
            None => run.content.summary.clone(),
        };
        summary.key_insights.extend(finished.insights.iter().cloned());
        summary.last_session_id = Some(finished.id.clone());
        summary.last_reviewed_at = Some(completed_at);

        self.stores
            .contents
            .update(
                &run.content.id,
                ContentPatch {
                    status: Some(ContentStatus::Completed),
                    summary: Some(summary),
                },
            )
            .await?;

        info!(
            session_id = %finished.id,
            exchanges = finished.exchanges.len(),
            insights = finished.insights.len(),
            "session completed"
        );
        Ok(finished)
    }

    /// Abandon the running session as if it never happened: the record is
    /// deleted and the content status restored. No-op when idle.
    pub async fn cancel_session(&mut self) -> Result<()> {
        let Some(run) = self.run.take() else {
            debug!("cancel requested with no running session");
            return Ok(());
        };
        self.teardown().await;

        if let Some(session) = self.session.take() {
            self.stores.sessions.delete(&session.id).await?;
            info!(session_id = %session.id, "session cancelled and discarded");
        }

        self.stores
            .contents
            .update(&run.content.id, ContentPatch::status(run.previous_status))
            .await
    }

    /// Try the streaming channel again for the running session.
    ///
    /// On failure the session stays on fallback questions and the error is
    /// returned.
    pub async fn reconnect_ai(&mut self) -> Result<()> {
        if self.run.is_none() {
            return Err(ReflectaError::NoActiveSession);
        }
        self.open_stream().await?;
        info!(epoch = self.connection.epoch(), "streaming channel restored");

        if self.session.as_ref().is_some_and(|s| s.question_count() == 0) {
            let kickoff = self.config.kickoff_message.clone();
            self.send_streaming_text(&kickoff).await?;
        }
        Ok(())
    }

    // ── Caller turns ────────────────────────────────────────────────────

    /// Record the user's answer and request the next question.
    ///
    /// The answer is appended before anything is sent. In fallback mode the
    /// next question is in the transcript when this returns.
    pub async fn send_message(&mut self, text: &str) -> Result<()> {
        if self.run.is_none() {
            return Err(ReflectaError::NoActiveSession);
        }
        if text.trim().is_empty() {
            debug!("ignoring empty message");
            return Ok(());
        }

        // Observe a dropped channel before choosing the route
        self.drain_pending().await?;

        self.record_spoken_answer().await?;
        self.record_answer(text).await?;
        let (_, run) = self.running_mut()?;
        let mode = run.mode;

        match mode {
            DeliveryMode::Streaming => self.send_streaming_text(text).await,
            DeliveryMode::Fallback => self.ask_follow_up().await,
        }
    }

    /// Append an insight to the running session and persist the list.
    pub async fn add_insight(&mut self, text: &str) -> Result<()> {
        let (session, _) = self.running_mut()?;
        session.insights.push(text.to_string());
        let id = session.id.clone();
        let insights = session.insights.clone();

        self.stores
            .sessions
            .update(
                &id,
                SessionPatch {
                    insights: Some(insights),
                    ..SessionPatch::default()
                },
            )
            .await
    }

    // ── Event pump ──────────────────────────────────────────────────────

    /// Wait for and handle one transport event or capture frame.
    ///
    /// Returns false if both inputs are closed.
    pub async fn process_next(&mut self) -> Result<bool> {
        let input = tokio::select! {
            biased;
            event = self.events.recv() => event.map(Input::Event),
            frame = self.frames_rx.recv() => frame.map(Input::Frame),
        };
        match input {
            Some(Input::Event(event)) => self.handle_event(event).await?,
            Some(Input::Frame(frame)) => self.forward_frame(frame),
            None => return Ok(false),
        }
        Ok(true)
    }

    /// Handle everything already queued without waiting. Returns the count.
    pub async fn drain_pending(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.events.try_recv() {
                self.handle_event(event).await?;
            } else if let Ok(frame) = self.frames_rx.try_recv() {
                self.forward_frame(frame);
            } else {
                return Ok(handled);
            }
            handled += 1;
        }
    }

    /// Pump events until no reply is pending or `timeout` elapses.
    ///
    /// Returns true if the session is no longer thinking.
    pub async fn wait_for_reply(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.state() == SessionState::Thinking {
            match tokio::time::timeout_at(deadline, self.process_next()).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return Ok(false),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn handle_event(&mut self, event: TransportEvent) -> Result<()> {
        let Some(run) = self.run.as_ref() else {
            debug!(epoch = event.connection, "transport event with no running session");
            return Ok(());
        };
        if run.connection != Some(event.connection) {
            debug!(epoch = event.connection, "ignoring event from a previous connection");
            return Ok(());
        }
        let awaiting_reply = run.awaiting_reply;

        match event.kind {
            TransportEventKind::Reply(text) => {
                if text.trim().is_empty() {
                    debug!("ignoring empty reply");
                } else {
                    self.record_spoken_answer().await?;
                    self.append_question(&text).await?;
                }
            }
            TransportEventKind::Transcript(text) => {
                if let Some(run) = self.run.as_mut() {
                    if !text.trim().is_empty() {
                        run.awaiting_reply = true;
                    }
                    run.spoken.push_str(&text);
                }
            }
            TransportEventKind::Audio(frame) => self.play(frame),
            TransportEventKind::Interrupted => {
                debug!("backend interrupted, clearing playback");
                self.stop_playback();
            }
            TransportEventKind::StateChanged(
                state @ (ConnectionState::Error | ConnectionState::Disconnected),
            ) => {
                self.degrade(&format!("connection {}", state)).await;
                self.record_spoken_answer().await?;
                if awaiting_reply {
                    self.ask_pending_question().await?;
                }
            }
            TransportEventKind::StateChanged(state) => {
                debug!(%state, "connection state observed");
            }
            TransportEventKind::Error(message) => {
                warn!(error = %message, "streaming channel reported an error");
            }
        }
        Ok(())
    }

    /// Frames never become exchanges themselves; the backend's transcript
    /// of them does.
    fn forward_frame(&mut self, frame: PcmFrame) {
        if self
            .run
            .as_ref()
            .is_none_or(|run| run.mode != DeliveryMode::Streaming)
        {
            return;
        }
        if let Err(e) = self.connection.send_audio(frame) {
            debug!(error = %e, "dropping capture frame");
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn running_mut(&mut self) -> Result<(&mut Session, &mut RunState)> {
        match (self.session.as_mut(), self.run.as_mut()) {
            (Some(session), Some(run)) => Ok((session, run)),
            _ => Err(ReflectaError::NoActiveSession),
        }
    }

    async fn open_stream(&mut self) -> Result<()> {
        let instruction = {
            let run = self.run.as_ref().ok_or(ReflectaError::NoActiveSession)?;
            prompt::system_instruction(&run.content, &run.history)
        };

        if let Err(e) = self
            .connection
            .connect(self.credentials.as_ref(), Some(&instruction))
            .await
        {
            self.enter_fallback(&e.to_string());
            return Err(e);
        }

        let epoch = self.connection.epoch();
        let voice_input = match self.run.as_mut() {
            Some(run) => {
                run.mode = DeliveryMode::Streaming;
                run.connection = Some(epoch);
                run.playback_available = true;
                run.voice_input
            }
            None => false,
        };
        info!(epoch, "using streaming channel");

        if voice_input {
            self.start_capture();
        }
        Ok(())
    }

    async fn send_streaming_text(&mut self, text: &str) -> Result<()> {
        match self.connection.send_text(text) {
            Ok(()) => {
                if let Some(run) = self.run.as_mut() {
                    run.awaiting_reply = true;
                }
                Ok(())
            }
            Err(e) => {
                self.degrade(&e.to_string()).await;
                self.ask_pending_question().await
            }
        }
    }

    /// Switch the running session to fallback questions for good.
    async fn degrade(&mut self, reason: &str) {
        if self
            .run
            .as_ref()
            .is_some_and(|run| run.mode == DeliveryMode::Streaming)
        {
            self.enter_fallback(reason);
            self.connection.disconnect().await;
        }
    }

    fn enter_fallback(&mut self, reason: &str) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.mode == DeliveryMode::Streaming {
            warn!(reason, "streaming channel lost, switching to fallback questions");
        }
        run.mode = DeliveryMode::Fallback;
        run.connection = None;
        self.stop_capture();
        self.stop_playback();
    }

    async fn ask_pending_question(&mut self) -> Result<()> {
        let has_question = self.session.as_ref().is_some_and(|s| s.question_count() > 0);
        if has_question {
            self.ask_follow_up().await
        } else {
            self.ask_first_question().await
        }
    }

    async fn ask_first_question(&mut self) -> Result<()> {
        let content = {
            let (_, run) = self.running_mut()?;
            run.awaiting_reply = true;
            run.content.clone()
        };
        let question = match self.questions.generate_first_question(&content).await {
            Ok(question) if !question.trim().is_empty() => question.trim().to_string(),
            Ok(_) => {
                warn!(generator = self.questions.name(), "empty opening question, using default");
                self.config.default_question.clone()
            }
            Err(e) => {
                warn!(generator = self.questions.name(), error = %e, "opening question failed, using default");
                self.config.default_question.clone()
            }
        };
        self.append_question(&question).await
    }

    async fn ask_follow_up(&mut self) -> Result<()> {
        let (content, history) = {
            let (_, run) = self.running_mut()?;
            run.awaiting_reply = true;
            (run.content.clone(), run.history.clone())
        };
        let question = match self.questions.generate_follow_up(&content, &history).await {
            Ok(question) if !question.trim().is_empty() => question.trim().to_string(),
            Ok(_) => {
                warn!(generator = self.questions.name(), "empty follow-up, using default");
                self.config.default_follow_up.clone()
            }
            Err(e) => {
                warn!(generator = self.questions.name(), error = %e, "follow-up failed, using default");
                self.config.default_follow_up.clone()
            }
        };
        self.append_question(&question).await
    }

    async fn record_answer(&mut self, text: &str) -> Result<()> {
        let (session, run) = self.running_mut()?;
        session.exchanges.push(Exchange::answer(text));
        let question = run.last_question.clone().unwrap_or_default();
        run.history.push(QaPair::new(&question, text));
        self.persist_exchanges().await
    }

    /// Record buffered speech as the answer to the last question.
    async fn record_spoken_answer(&mut self) -> Result<()> {
        let spoken = match self.run.as_mut() {
            Some(run) => std::mem::take(&mut run.spoken),
            None => return Ok(()),
        };
        if spoken.trim().is_empty() {
            return Ok(());
        }
        self.record_answer(&spoken).await
    }

    async fn append_question(&mut self, text: &str) -> Result<()> {
        let (session, run) = self.running_mut()?;
        session.exchanges.push(Exchange::question(text));
        run.last_question = Some(text.to_string());
        run.awaiting_reply = false;
        debug!(session_id = %session.id, count = session.exchanges.len(), "question appended");
        self.persist_exchanges().await
    }

    /// Write the whole exchange list, so a later write always wins.
    async fn persist_exchanges(&self) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        self.stores
            .sessions
            .update(
                &session.id,
                SessionPatch {
                    exchanges: Some(session.exchanges.clone()),
                    ..SessionPatch::default()
                },
            )
            .await
    }

    fn start_capture(&mut self) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        if capture.is_recording() {
            return;
        }
        let frames = self.frames_tx.clone();
        let on_frame: FrameCallback = Box::new(move |frame| {
            if frames.send(frame).is_err() {
                // Orchestrator dropped - nowhere to deliver
            }
        });
        match capture.start(on_frame) {
            Ok(()) => info!("voice input started"),
            Err(e) if e.is_device_error() => {
                warn!(error = %e, "voice input unavailable, continuing with text only")
            }
            Err(e) => warn!(error = %e, "failed to start voice input, continuing with text only"),
        }
    }

    fn stop_capture(&mut self) {
        if let Some(capture) = self.capture.as_mut()
            && let Err(e) = capture.stop()
        {
            warn!(error = %e, "failed to stop voice input");
        }
    }

    fn play(&mut self, frame: PcmFrame) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if !run.playback_available {
            return;
        }
        if let Some(playback) = self.playback.as_mut()
            && let Err(e) = playback.play(frame)
        {
            run.playback_available = false;
            warn!(
                error = %e,
                device = e.is_device_error(),
                "speaker unavailable, replies continue as text only"
            );
        }
    }

    fn stop_playback(&mut self) {
        if let Some(playback) = self.playback.as_mut()
            && let Err(e) = playback.stop()
        {
            warn!(error = %e, "failed to stop playback");
        }
    }

    async fn teardown(&mut self) {
        self.stop_capture();
        self.stop_playback();
        self.connection.disconnect().await;
        self.discard_pending();
    }

    /// Drop queued events and frames so none cross into another session.
    fn discard_pending(&mut self) {
        while self.events.try_recv().is_ok() {}
        while self.frames_rx.try_recv().is_ok() {}
    }
}
