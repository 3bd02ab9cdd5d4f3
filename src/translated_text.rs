//! Reactive binding of one UI string to its translation.
//!
//! A mounted `TranslatedText` owns a driver task that follows the bound text
//! and the active language. For a non-source language it waits a staggered
//! delay, asks the scheduler, and publishes the result; the source text is
//! shown meanwhile and whenever translation gives up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancellation::{GenerationGuard, TaskGeneration};
use crate::metrics::metric_names;
use crate::scheduler::{Scheduler, DEFAULT_PRIORITY};
use crate::state_machine::{TextState, TextStateMachine};
use crate::translate::SOURCE_LANGUAGE;

pub const MAX_ATTEMPTS: u32 = 3;
pub const STAGGER_STEP_MS: u64 = 20;
pub const STAGGER_SLOTS: u64 = 10;
/// Characters per extra millisecond of stagger.
pub const CHARS_PER_MS: usize = 10;
pub const LENGTH_DELAY_CAP_MS: u64 = 50;
pub const JITTER_MAX_MS: u64 = 30;
pub const MAX_STAGGER_MS: u64 = 200;
pub const RETRY_DELAY_MS: u64 = 1_000;

/// Mount order across the process; spreads simultaneous mounts over stagger slots.
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct TextConfig {
    pub priority: i32,
    pub max_attempts: u32,
    /// Always show the source text (brand names, VINs, prices).
    pub skip_translation: bool,
    pub stagger_step: Duration,
    pub stagger_slots: u64,
    pub length_delay_cap: Duration,
    pub jitter_max: Duration,
    pub max_stagger: Duration,
    /// Wait before attempt `n + 1` is `retry_delay * n`.
    pub retry_delay: Duration,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            max_attempts: MAX_ATTEMPTS,
            skip_translation: false,
            stagger_step: Duration::from_millis(STAGGER_STEP_MS),
            stagger_slots: STAGGER_SLOTS,
            length_delay_cap: Duration::from_millis(LENGTH_DELAY_CAP_MS),
            jitter_max: Duration::from_millis(JITTER_MAX_MS),
            max_stagger: Duration::from_millis(MAX_STAGGER_MS),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

/// Delay before the first attempt: mount slot, plus text length, plus jitter,
/// clamped to `max_stagger`.
pub fn stagger_delay(instance: u64, text_chars: usize, config: &TextConfig) -> Duration {
    let slot = instance % config.stagger_slots.max(1);
    let base = config.stagger_step * slot as u32;
    let length = Duration::from_millis((text_chars / CHARS_PER_MS) as u64).min(config.length_delay_cap);
    let jitter_ms = config.jitter_max.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    };
    (base + length + jitter).min(config.max_stagger)
}

pub struct TranslatedText {
    text_tx: watch::Sender<String>,
    display_rx: watch::Receiver<String>,
    state: Arc<TextStateMachine>,
    unmount: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TranslatedText {
    /// Bind `text` to the language published on `language` and start translating.
    pub fn mount(
        scheduler: Scheduler,
        text: impl Into<String>,
        language: watch::Receiver<String>,
        config: TextConfig,
    ) -> Self {
        let text = text.into();
        let instance = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let (text_tx, text_rx) = watch::channel(text.clone());
        let (display_tx, display_rx) = watch::channel(text);
        let state = Arc::new(TextStateMachine::new());
        let unmount = CancellationToken::new();

        let driver = Driver {
            scheduler,
            config,
            instance,
            state: Arc::clone(&state),
            display_tx,
            generations: TaskGeneration::new(),
        };
        let task = tokio::spawn(driver.run(text_rx, language, unmount.clone()));

        Self {
            text_tx,
            display_rx,
            state,
            unmount,
            task: Some(task),
        }
    }

    /// Rebind to new source text. No-op if unchanged.
    pub fn set_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.text_tx.send_if_modified(|current| {
            if *current == text {
                false
            } else {
                *current = text;
                true
            }
        });
    }

    /// What the UI should show right now.
    pub fn display(&self) -> String {
        self.display_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.display_rx.clone()
    }

    pub fn state(&self) -> TextState {
        self.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TextState> {
        self.state.subscribe()
    }

    /// Stop the driver and wait for it to exit.
    pub async fn unmount(mut self) {
        self.unmount.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TranslatedText {
    fn drop(&mut self) {
        self.unmount.cancel();
    }
}

struct Driver {
    scheduler: Scheduler,
    config: TextConfig,
    instance: u64,
    state: Arc<TextStateMachine>,
    display_tx: watch::Sender<String>,
    generations: TaskGeneration,
}

impl Driver {
    async fn run(
        self,
        mut text_rx: watch::Receiver<String>,
        mut lang_rx: watch::Receiver<String>,
        unmount: CancellationToken,
    ) {
        loop {
            let text = text_rx.borrow_and_update().clone();
            let lang = lang_rx.borrow_and_update().clone();
            let guard = self.generations.cancel_and_advance();
            self.state.reset();
            self.display_tx.send_replace(text.clone());

            let keep_going = {
                let work = self.translate(&text, &lang, &guard);
                tokio::pin!(work);
                let mut work_done = false;
                loop {
                    tokio::select! {
                        biased;
                        _ = unmount.cancelled() => break false,
                        changed = text_rx.changed() => break changed.is_ok(),
                        changed = lang_rx.changed() => break changed.is_ok(),
                        _ = &mut work, if !work_done => { work_done = true; }
                    }
                }
            };

            if !keep_going {
                self.generations.cancel_all();
                debug!(instance = self.instance, "translated text unmounted");
                break;
            }
        }
    }

    async fn translate(&self, text: &str, lang: &str, guard: &GenerationGuard) {
        if lang == SOURCE_LANGUAGE || self.config.skip_translation || text.is_empty() {
            return;
        }

        let _ = self.state.transition(TextState::StaggeredWait);
        let delay = stagger_delay(self.instance, text.chars().count(), &self.config);
        tokio::time::sleep(delay).await;

        let started = Instant::now();
        for attempt in 1..=self.config.max_attempts {
            if !guard.should_continue() {
                return;
            }
            let _ = self.state.transition(TextState::Attempting);

            match self.scheduler.schedule(text, lang, self.config.priority).await {
                Ok(translated) if translated != text => {
                    if guard.should_continue() {
                        self.display_tx.send_replace(translated);
                        let _ = self.state.transition(TextState::Resolved);
                        self.scheduler.metrics().record(
                            metric_names::TEXT_RESOLVED,
                            started.elapsed().as_micros() as f64,
                        );
                    }
                    return;
                }
                // Indistinguishable from a genuinely identical translation
                // (model names, brands); counted as a failed attempt.
                Ok(_) => debug!(attempt, lang, "translation came back unchanged"),
                Err(e) => warn!(attempt, lang, error = %e, "translation attempt failed"),
            }

            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
        }

        if guard.should_continue() {
            let _ = self.state.transition(TextState::Failed);
            info!(lang, attempts = self.config.max_attempts, "giving up on translation, showing source text");
        }
    }
}
