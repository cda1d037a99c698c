//! Per-request session state machine and status banner.
//!
//! A [`StreamSession`] moves from [`Phase::Pending`] to [`Phase::Active`] on the first status
//! event and ends in exactly one of [`Phase::Complete`], [`Phase::Errored`] or
//! [`Phase::Cancelled`].  Once a terminal phase is reached nothing changes it.  The
//! [`SessionDriver`] feeds a decoded event stream through a session, runs the long-wait and
//! banner-clear timers, and reports every change to a [`SessionObserver`].

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::event_logger::EventLogger;
use crate::observability::{
    SESSION_CANCELLED, SESSION_COMPLETED, SESSION_DUPLICATE_STEPS, SESSION_DURATION,
    SESSION_ERRORED,
};
use crate::observer::SessionObserver;
use crate::{Banner, BannerKind, Result, StatusStep, StreamEvent};

/// Placeholder shown once a request has been active for the long-wait delay.
pub const LONG_WAIT_LABEL: &str = "Still working on it. This is taking longer than usual…";

/// Placeholder shown after the caller cancels a request.
pub const CANCELLED_NOTICE: &str = "Request cancelled.";

/// Cause recorded when the stream ends before a terminal event.
pub const UNEXPECTED_END: &str = "the reply stream ended before the reply was complete";

/// Delay after activation before the placeholder is relabelled.
pub const DEFAULT_LONG_WAIT: Duration = Duration::from_secs(20);

/// How long the banner of a completed request stays visible.
pub const DEFAULT_CLEAR_DELAY: Duration = Duration::from_secs(2);

const ESCALATION_MARKERS: &[&str] = &["retrying with", "stronger model", "escalat"];

/////////////////////////////////////////////// Phase //////////////////////////////////////////////

/// Lifecycle phase of one streaming request.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// Request sent; nothing received yet.
    Pending,
    /// Status events are arriving.
    Active {
        /// Transient label describing what is happening right now.
        placeholder: String,
        /// Durable, deduplicated progress steps.
        banner: Banner,
        /// When the first status event arrived.
        started_at: OffsetDateTime,
    },
    /// The reply is finished.
    Complete {
        /// Final response document.
        result: Value,
        /// Steps that led here; cleared shortly after completion.
        banner: Banner,
    },
    /// The request failed.
    Errored {
        /// Human-readable cause.
        cause: String,
    },
    /// The caller cancelled the request.
    Cancelled {
        /// Notice that replaces the placeholder.
        notice: String,
    },
}

impl Phase {
    /// Returns the phase's name.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Active { .. } => "active",
            Phase::Complete { .. } => "complete",
            Phase::Errored { .. } => "errored",
            Phase::Cancelled { .. } => "cancelled",
        }
    }

    /// Returns true for phases that are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Complete { .. } | Phase::Errored { .. } | Phase::Cancelled { .. }
        )
    }
}

/// What applying an input did to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The session is terminal or the input carried nothing new.
    Ignored,
    /// `Pending` became `Active`.
    Activated,
    /// Only the placeholder changed.
    Relabelled,
    /// A new step joined the banner (and the placeholder changed).
    StepAdded,
    /// The status repeated an existing step and was dropped.
    DuplicateStep,
    /// The session completed.
    Completed,
    /// The session failed.
    Errored,
    /// The session was cancelled.
    Cancelled,
}

/// Returns true for the two statuses that only relabel the placeholder.
pub fn is_thinking_label(message: &str) -> bool {
    let normalized = message
        .trim()
        .trim_end_matches(['.', '…'])
        .trim()
        .to_lowercase();
    normalized == "thinking" || normalized == "thinking longer"
}

/// Classifies a step: escalation if it reports a retry against a stronger model.
pub fn classify(message: &str) -> BannerKind {
    let lower = message.to_lowercase();
    if ESCALATION_MARKERS.iter().any(|marker| lower.contains(marker)) {
        BannerKind::Escalation
    } else {
        BannerKind::Info
    }
}

/////////////////////////////////////////// StreamSession //////////////////////////////////////////

/// State of one streaming request.
#[derive(Debug, Clone)]
pub struct StreamSession {
    phase: Phase,
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSession {
    /// Creates a pending session.
    pub fn new() -> Self {
        Self {
            phase: Phase::Pending,
        }
    }

    /// Returns the current phase.
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Returns true once the session has settled.
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Returns the text to show in place of the reply, if any.
    pub fn placeholder(&self) -> Option<&str> {
        match &self.phase {
            Phase::Active { placeholder, .. } => Some(placeholder),
            Phase::Cancelled { notice } => Some(notice),
            _ => None,
        }
    }

    /// Returns the banner, while there is one to show.
    pub fn banner(&self) -> Option<&Banner> {
        match &self.phase {
            Phase::Active { banner, .. } | Phase::Complete { banner, .. } => Some(banner),
            _ => None,
        }
    }

    /// Applies one decoded event received at `now`.
    pub fn apply(&mut self, event: StreamEvent, now: OffsetDateTime) -> Transition {
        if self.is_terminal() {
            tracing::debug!(phase = self.phase.name(), "ignoring event for settled session");
            return Transition::Ignored;
        }
        match event {
            StreamEvent::Status {
                message,
                model_name,
            } => self.on_status(message, model_name, now),
            StreamEvent::Complete { result } => {
                let banner = self.take_banner();
                self.phase = Phase::Complete { result, banner };
                tracing::debug!("session complete");
                Transition::Completed
            }
            event @ StreamEvent::Error { .. } => {
                let cause = event
                    .error_text()
                    .unwrap_or_else(|| "unknown error".to_string());
                self.fail(cause)
            }
        }
    }

    fn on_status(
        &mut self,
        message: String,
        model_tag: Option<String>,
        now: OffsetDateTime,
    ) -> Transition {
        let activated = matches!(self.phase, Phase::Pending);
        if activated {
            self.phase = Phase::Active {
                placeholder: String::new(),
                banner: Banner::default(),
                started_at: now,
            };
            tracing::debug!("session active");
        }
        let Phase::Active {
            placeholder,
            banner,
            ..
        } = &mut self.phase
        else {
            return Transition::Ignored;
        };

        if is_thinking_label(&message) {
            *placeholder = message;
            return if activated {
                Transition::Activated
            } else {
                Transition::Relabelled
            };
        }

        if banner
            .steps
            .iter()
            .any(|step| step.same_step(&message, model_tag.as_deref()))
        {
            SESSION_DUPLICATE_STEPS.click();
            tracing::debug!(message = %message, "dropping duplicate status step");
            return Transition::DuplicateStep;
        }

        *placeholder = message.clone();
        banner.steps.push(StatusStep {
            kind: classify(&message),
            message,
            model_tag,
            received_at: now,
        });
        if activated {
            Transition::Activated
        } else {
            Transition::StepAdded
        }
    }

    /// Relabels the placeholder of an active session to signal a long wait.
    pub fn relabel_long_wait(&mut self) -> Transition {
        match &mut self.phase {
            Phase::Active { placeholder, .. } => {
                *placeholder = LONG_WAIT_LABEL.to_string();
                Transition::Relabelled
            }
            _ => Transition::Ignored,
        }
    }

    /// Fails the session with `cause`.
    pub fn fail(&mut self, cause: impl Into<String>) -> Transition {
        if self.is_terminal() {
            return Transition::Ignored;
        }
        let cause = cause.into();
        tracing::debug!(cause = %cause, "session errored");
        self.phase = Phase::Errored { cause };
        Transition::Errored
    }

    /// Cancels the session.  Every later input is ignored.
    pub fn cancel(&mut self) -> Transition {
        if self.is_terminal() {
            return Transition::Ignored;
        }
        tracing::debug!("session cancelled");
        self.phase = Phase::Cancelled {
            notice: CANCELLED_NOTICE.to_string(),
        };
        Transition::Cancelled
    }

    /// Drops the banner a completed session kept for display.
    pub fn clear_banner(&mut self) -> bool {
        match &mut self.phase {
            Phase::Complete { banner, .. } if !banner.is_empty() => {
                banner.steps.clear();
                true
            }
            _ => false,
        }
    }

    fn take_banner(&mut self) -> Banner {
        match &mut self.phase {
            Phase::Active { banner, .. } => std::mem::take(banner),
            _ => Banner::default(),
        }
    }
}

/////////////////////////////////////////// SessionDriver //////////////////////////////////////////

/// Timer settings for a [`SessionDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Delay after activation before the placeholder is relabelled.
    pub long_wait: Duration,
    /// How long a completed banner stays visible.
    pub clear_delay: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            long_wait: DEFAULT_LONG_WAIT,
            clear_delay: DEFAULT_CLEAR_DELAY,
        }
    }
}

/// Runs one [`StreamSession`] to a terminal phase.
pub struct SessionDriver {
    session: StreamSession,
    observer: Arc<dyn SessionObserver>,
    logger: Option<Arc<dyn EventLogger>>,
    clock: Arc<dyn Clock>,
    timings: SessionTimings,
}

impl SessionDriver {
    /// Creates a driver for a fresh session.
    pub fn new(observer: Arc<dyn SessionObserver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            session: StreamSession::new(),
            observer,
            logger: None,
            clock,
            timings: SessionTimings::default(),
        }
    }

    /// Sets the timer settings.
    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Reports every decoded event and the final phase to `logger`.
    pub fn with_logger(mut self, logger: Option<Arc<dyn EventLogger>>) -> Self {
        self.logger = logger;
        self
    }

    /// Returns the session being driven.
    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Consumes `events` until the session settles, then returns the terminal phase.
    ///
    /// A read error fails the session; an [`Error::Abort`](crate::Error::Abort) or `cancel`
    /// cancels it.  `events` is dropped before this returns.
    pub async fn run<S>(mut self, events: S, cancel: &CancellationToken) -> Phase
    where
        S: Stream<Item = Result<StreamEvent>> + Unpin,
    {
        let started = tokio::time::Instant::now();
        let mut events = events;
        let long_wait = tokio::time::sleep(self.timings.long_wait);
        tokio::pin!(long_wait);
        let mut waiting = false;

        while !self.session.is_terminal() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let transition = self.session.cancel();
                    self.notify(transition);
                }
                () = &mut long_wait, if waiting => {
                    waiting = false;
                    tracing::debug!("request is taking a while; relabelling placeholder");
                    let transition = self.session.relabel_long_wait();
                    self.notify(transition);
                }
                next = events.next() => {
                    let transition = match next {
                        Some(Ok(event)) => {
                            if let Some(logger) = &self.logger {
                                logger.log_stream_event(&event);
                            }
                            self.session.apply(event, self.clock.now())
                        }
                        Some(Err(err)) if err.is_abort() => self.session.cancel(),
                        Some(Err(err)) => self.session.fail(err.to_string()),
                        None => self.session.fail(UNEXPECTED_END),
                    };
                    if transition == Transition::Activated {
                        long_wait
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.timings.long_wait);
                        waiting = true;
                    }
                    self.notify(transition);
                }
            }
        }
        drop(events);
        SESSION_DURATION.add(started.elapsed().as_secs_f64());
        self.finish()
    }

    /// Completes the session directly with `result`, as for a plain JSON reply.
    pub fn complete(mut self, result: Value) -> Phase {
        let transition = self
            .session
            .apply(StreamEvent::Complete { result }, self.clock.now());
        self.notify(transition);
        self.finish()
    }

    /// Fails the session directly with `cause`.
    pub fn fail(mut self, cause: impl Into<String>) -> Phase {
        let transition = self.session.fail(cause);
        self.notify(transition);
        self.finish()
    }

    /// Cancels the session directly.
    pub fn cancel(mut self) -> Phase {
        let transition = self.session.cancel();
        self.notify(transition);
        self.finish()
    }

    fn notify(&self, transition: Transition) {
        let observer = &self.observer;
        match transition {
            Transition::Ignored | Transition::DuplicateStep => {}
            Transition::Activated => {
                observer.on_phase(self.session.phase());
                self.notify_placeholder();
                self.notify_banner();
            }
            Transition::Relabelled => self.notify_placeholder(),
            Transition::StepAdded => {
                self.notify_placeholder();
                self.notify_banner();
            }
            Transition::Completed | Transition::Errored => {
                observer.on_phase(self.session.phase());
            }
            Transition::Cancelled => {
                self.notify_placeholder();
                observer.on_phase(self.session.phase());
            }
        }
    }

    fn notify_placeholder(&self) {
        if let Some(placeholder) = self.session.placeholder() {
            self.observer.on_placeholder(placeholder);
        }
    }

    fn notify_banner(&self) {
        if let Some(banner) = self.session.banner() {
            self.observer.on_banner(banner);
        }
    }

    fn finish(self) -> Phase {
        let phase = self.session.phase().clone();
        match &phase {
            Phase::Complete { .. } => SESSION_COMPLETED.click(),
            Phase::Errored { .. } => SESSION_ERRORED.click(),
            Phase::Cancelled { .. } => SESSION_CANCELLED.click(),
            Phase::Pending | Phase::Active { .. } => {}
        }
        if let Some(logger) = &self.logger {
            logger.log_session_end(&phase);
        }

        if let Phase::Complete { banner, .. } = &phase {
            if !banner.is_empty() {
                let SessionDriver {
                    mut session,
                    observer,
                    timings,
                    ..
                } = self;
                tokio::spawn(async move {
                    tokio::time::sleep(timings.clear_delay).await;
                    if session.clear_banner() {
                        observer.on_banner(&Banner::default());
                    }
                });
            }
        }
        phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use futures::channel::mpsc;
    use futures::stream;
    use serde_json::json;
    use time::macros::datetime;

    use crate::clock::ManualClock;
    use crate::Error;

    const NOW: OffsetDateTime = datetime!(2025-05-01 9:00:00 UTC);

    fn status(message: &str) -> StreamEvent {
        StreamEvent::status(message, None)
    }

    fn messages(session: &StreamSession) -> Vec<String> {
        session
            .banner()
            .map(|banner| banner.steps.iter().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut session = StreamSession::new();
        assert_eq!(session.apply(status("Classifying"), NOW), Transition::Activated);
        assert_eq!(
            session.apply(status("Classifying"), NOW),
            Transition::DuplicateStep
        );
        assert_eq!(session.apply(status("Finding"), NOW), Transition::StepAdded);
        assert_eq!(messages(&session), vec!["Classifying", "Finding"]);
    }

    #[test]
    fn identity_includes_model_tag() {
        let mut session = StreamSession::new();
        session.apply(StreamEvent::status("Drafting", Some("small".into())), NOW);
        session.apply(StreamEvent::status("Drafting", Some("large".into())), NOW);
        session.apply(StreamEvent::status("Drafting", Some("small".into())), NOW);
        let steps = &session.banner().unwrap().steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].model_tag.as_deref(), Some("large"));
    }

    #[test]
    fn earlier_step_is_still_a_duplicate() {
        let mut session = StreamSession::new();
        for message in ["A", "B", "A", "C", "B"] {
            session.apply(status(message), NOW);
        }
        assert_eq!(messages(&session), vec!["A", "B", "C"]);
    }

    #[test]
    fn thinking_only_relabels() {
        let mut session = StreamSession::new();
        assert_eq!(session.apply(status("Thinking..."), NOW), Transition::Activated);
        assert_eq!(session.placeholder(), Some("Thinking..."));
        assert_eq!(
            session.apply(status("thinking longer…"), NOW),
            Transition::Relabelled
        );
        assert_eq!(session.placeholder(), Some("thinking longer…"));
        assert!(session.banner().unwrap().is_empty());

        session.apply(status("Searching"), NOW);
        assert_eq!(session.placeholder(), Some("Searching"));
        assert_eq!(messages(&session), vec!["Searching"]);
    }

    #[test]
    fn escalation_is_classified() {
        let mut session = StreamSession::new();
        session.apply(status("Classifying"), NOW);
        assert_eq!(session.banner().unwrap().kind(), BannerKind::Info);
        session.apply(status("Retrying with a stronger model"), NOW);
        let banner = session.banner().unwrap();
        assert_eq!(banner.kind(), BannerKind::Escalation);
        assert_eq!(banner.steps[0].kind, BannerKind::Info);
        assert_eq!(banner.steps[1].kind, BannerKind::Escalation);
    }

    #[test]
    fn completion_keeps_steps_until_cleared() {
        let mut session = StreamSession::new();
        session.apply(status("Classifying"), NOW);
        assert_eq!(
            session.apply(StreamEvent::Complete { result: json!({"answer": 42}) }, NOW),
            Transition::Completed
        );
        assert_eq!(messages(&session), vec!["Classifying"]);
        assert!(session.clear_banner());
        assert!(session.banner().unwrap().is_empty());
        assert!(matches!(
            session.phase(),
            Phase::Complete { result, .. } if result == &json!({"answer": 42})
        ));
    }

    #[test]
    fn error_event_carries_cause() {
        let mut session = StreamSession::new();
        session.apply(status("Classifying"), NOW);
        session.apply(
            StreamEvent::Error {
                error: json!({"message": "model overloaded"}),
            },
            NOW,
        );
        assert_eq!(
            session.phase(),
            &Phase::Errored {
                cause: "model overloaded".to_string()
            }
        );
        assert_eq!(session.placeholder(), None);
    }

    #[test]
    fn terminal_phases_are_final() {
        let mut session = StreamSession::new();
        session.apply(status("Classifying"), NOW);
        assert_eq!(session.cancel(), Transition::Cancelled);
        assert_eq!(session.placeholder(), Some(CANCELLED_NOTICE));

        assert_eq!(session.apply(status("Finding"), NOW), Transition::Ignored);
        assert_eq!(
            session.apply(StreamEvent::Complete { result: json!({}) }, NOW),
            Transition::Ignored
        );
        assert_eq!(session.fail("late"), Transition::Ignored);
        assert_eq!(session.relabel_long_wait(), Transition::Ignored);
        assert_eq!(session.phase().name(), "cancelled");
    }

    #[test]
    fn terminal_event_straight_from_pending() {
        let mut session = StreamSession::new();
        assert_eq!(
            session.apply(StreamEvent::error("nope"), NOW),
            Transition::Errored
        );
        let mut session = StreamSession::new();
        assert_eq!(
            session.apply(StreamEvent::Complete { result: json!(1) }, NOW),
            Transition::Completed
        );
        assert!(session.banner().unwrap().is_empty());
    }

    #[test]
    fn thinking_labels() {
        assert!(is_thinking_label("Thinking"));
        assert!(is_thinking_label("  thinking longer... "));
        assert!(!is_thinking_label("Thinking about sources"));
    }

    //////////////////////////////////////////// Driver ////////////////////////////////////////////

    #[derive(Default)]
    struct RecordingObserver {
        placeholders: Mutex<Vec<String>>,
        banners: Mutex<Vec<usize>>,
        phases: Mutex<Vec<&'static str>>,
    }

    impl SessionObserver for RecordingObserver {
        fn on_placeholder(&self, text: &str) {
            self.placeholders.lock().unwrap().push(text.to_string());
        }

        fn on_banner(&self, banner: &Banner) {
            self.banners.lock().unwrap().push(banner.steps.len());
        }

        fn on_phase(&self, phase: &Phase) {
            self.phases.lock().unwrap().push(phase.name());
        }
    }

    fn driver(observer: &Arc<RecordingObserver>) -> SessionDriver {
        let observer: Arc<dyn SessionObserver> = observer.clone();
        SessionDriver::new(observer, Arc::new(ManualClock::new(NOW)))
    }

    #[tokio::test(start_paused = true)]
    async fn driver_runs_to_completion_and_clears_banner() {
        let observer = Arc::new(RecordingObserver::default());
        let events = stream::iter(vec![
            Ok(status("Classifying")),
            Ok(status("Classifying")),
            Ok(status("Finding")),
            Ok(StreamEvent::Complete {
                result: json!({"text": "hi"}),
            }),
            Ok(status("late")),
        ]);
        let phase = driver(&observer).run(events, &CancellationToken::new()).await;

        let Phase::Complete { banner, result } = phase else {
            panic!("expected completion");
        };
        assert_eq!(banner.steps.len(), 2);
        assert_eq!(result, json!({"text": "hi"}));
        assert_eq!(*observer.phases.lock().unwrap(), vec!["active", "complete"]);
        assert_eq!(*observer.banners.lock().unwrap(), vec![1, 2]);

        tokio::time::sleep(DEFAULT_CLEAR_DELAY + Duration::from_millis(1)).await;
        assert_eq!(*observer.banners.lock().unwrap(), vec![1, 2, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn long_wait_relabels_without_changing_phase() {
        let observer = Arc::new(RecordingObserver::default());
        let (tx, rx) = mpsc::unbounded::<Result<StreamEvent>>();
        tx.unbounded_send(Ok(status("Classifying"))).unwrap();
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let driver = driver(&observer);
            let cancel = cancel.clone();
            async move { driver.run(rx, &cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert_eq!(*observer.placeholders.lock().unwrap(), vec!["Classifying"]);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            *observer.placeholders.lock().unwrap(),
            vec!["Classifying", LONG_WAIT_LABEL]
        );
        assert_eq!(*observer.phases.lock().unwrap(), vec!["active"]);

        tx.unbounded_send(Ok(StreamEvent::Complete { result: json!({}) }))
            .unwrap();
        assert!(matches!(run.await.unwrap(), Phase::Complete { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn no_relabel_after_completion() {
        let observer = Arc::new(RecordingObserver::default());
        let events = stream::iter(vec![
            Ok(status("Classifying")),
            Ok(StreamEvent::Complete { result: json!({}) }),
        ]);
        driver(&observer).run(events, &CancellationToken::new()).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*observer.placeholders.lock().unwrap(), vec!["Classifying"]);
    }

    #[tokio::test]
    async fn cancellation_settles_session() {
        let observer = Arc::new(RecordingObserver::default());
        let (tx, rx) = mpsc::unbounded::<Result<StreamEvent>>();
        tx.unbounded_send(Ok(status("Classifying"))).unwrap();
        let cancel = CancellationToken::new();

        let run = driver(&observer).run(rx, &cancel);
        let trigger = async {
            while observer.phases.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
            cancel.cancel();
        };
        let (phase, ()) = tokio::join!(run, trigger);

        assert_eq!(
            phase,
            Phase::Cancelled {
                notice: CANCELLED_NOTICE.to_string()
            }
        );
        assert!(tx.is_closed());
        assert!(tx.unbounded_send(Ok(status("Finding"))).is_err());
        assert_eq!(*observer.phases.lock().unwrap(), vec!["active", "cancelled"]);
        assert_eq!(
            observer.placeholders.lock().unwrap().last().map(String::as_str),
            Some(CANCELLED_NOTICE)
        );
    }

    #[tokio::test]
    async fn read_failure_errors_session() {
        let observer = Arc::new(RecordingObserver::default());
        let events = stream::iter(vec![
            Ok(status("Classifying")),
            Err(Error::connection("reset by peer", None)),
        ]);
        let phase = driver(&observer).run(events, &CancellationToken::new()).await;
        assert_eq!(
            phase,
            Phase::Errored {
                cause: "Connection error: reset by peer".to_string()
            }
        );
    }

    #[tokio::test]
    async fn abort_from_reader_cancels_session() {
        let observer = Arc::new(RecordingObserver::default());
        let events = stream::iter(vec![Err(Error::abort("stream cancelled"))]);
        let phase = driver(&observer).run(events, &CancellationToken::new()).await;
        assert_eq!(phase.name(), "cancelled");
    }

    #[tokio::test]
    async fn early_end_of_stream_is_an_error() {
        let observer = Arc::new(RecordingObserver::default());
        let events = stream::iter(vec![Ok(status("Classifying"))]);
        let phase = driver(&observer).run(events, &CancellationToken::new()).await;
        assert_eq!(
            phase,
            Phase::Errored {
                cause: UNEXPECTED_END.to_string()
            }
        );
    }

    #[tokio::test]
    async fn direct_completion() {
        let observer = Arc::new(RecordingObserver::default());
        let phase = driver(&observer).complete(json!({"text": "hi"}));
        assert_eq!(phase.name(), "complete");
        assert_eq!(*observer.phases.lock().unwrap(), vec!["complete"]);
    }
}
