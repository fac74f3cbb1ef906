//! Interaction hooks for the marking view: each turns raw gestures into a
//! named [`ViewEvent`] pushed to an [`EventSink`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub const DEFAULT_AUTOSAVE_IDLE: Duration = Duration::from_millis(2000);
pub const HIGHLIGHT: &[&str] = &["ring-2", "ring-blue-400"];
pub const TEXT_PLAIN: &str = "text/plain";

/// Serialised as `{"event": "<name>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ViewEvent {
    AutoSave {},
    Save {},
    Finalise {},
    Deselect {},
    InsertComment { id: String },
}

impl ViewEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ViewEvent::AutoSave {} => "auto_save",
            ViewEvent::Save {} => "save",
            ViewEvent::Finalise {} => "finalise",
            ViewEvent::Deselect {} => "deselect",
            ViewEvent::InsertComment { .. } => "insert_comment",
        }
    }
}

pub trait EventSink: Send + Sync + 'static {
    fn push_event(&self, event: ViewEvent);
}

impl EventSink for mpsc::UnboundedSender<ViewEvent> {
    fn push_event(&self, event: ViewEvent) {
        let name = event.name();
        if self.send(event).is_err() {
            tracing::debug!("View closed; dropped '{}' event", name);
        }
    }
}

/// An element's CSS classes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassList(BTreeSet<String>);

impl ClassList {
    pub fn add(&mut self, classes: &[&str]) {
        self.0.extend(classes.iter().map(|c| c.to_string()));
    }

    pub fn remove(&mut self, classes: &[&str]) {
        for class in classes {
            self.0.remove(*class);
        }
    }

    pub fn contains(&self, class: &str) -> bool {
        self.0.contains(class)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClassList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.0.iter().map(String::as_str).collect();
        f.write_str(&joined.join(" "))
    }
}

/// At most one pending task; scheduling a new one aborts the old.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Must be called from inside a tokio runtime.
    pub fn schedule<F>(&mut self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        // the deadline is fixed now, not when the task is first polled
        let wait = tokio::time::sleep(self.delay);
        self.pending = Some(tokio::spawn(async move {
            wait.await;
            action.await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Pushes `auto_save` once typing has paused for the idle period.
pub struct AutoSaveHook<S: EventSink + Clone> {
    sink: S,
    debouncer: Debouncer,
}

impl<S: EventSink + Clone> AutoSaveHook<S> {
    pub fn mount(sink: S) -> Self {
        Self::with_idle(sink, DEFAULT_AUTOSAVE_IDLE)
    }

    pub fn with_idle(sink: S, idle: Duration) -> Self {
        Self {
            sink,
            debouncer: Debouncer::new(idle),
        }
    }

    pub fn on_input(&mut self) {
        let sink = self.sink.clone();
        self.debouncer.schedule(async move {
            sink.push_event(ViewEvent::AutoSave {});
        });
    }

    pub fn is_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Same as dropping the hook.
    pub fn destroyed(self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub ctrl: bool,
    pub meta: bool,
}

impl KeyEvent {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ctrl: false,
            meta: false,
        }
    }

    pub fn with_ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn with_meta(mut self) -> Self {
        self.meta = true;
        self
    }

    fn command(&self) -> bool {
        self.ctrl || self.meta
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyOutcome {
    pub event: Option<ViewEvent>,
    pub prevent_default: bool,
}

/// Ctrl/Cmd+S saves, Ctrl/Cmd+Enter finalises, Escape deselects.
#[derive(Clone)]
pub struct KeyboardShortcuts<S: EventSink + Clone> {
    sink: S,
}

impl<S: EventSink + Clone> KeyboardShortcuts<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn handle_key(&self, key: &KeyEvent) -> KeyOutcome {
        let outcome = match key.key.as_str() {
            "s" if key.command() => KeyOutcome {
                event: Some(ViewEvent::Save {}),
                prevent_default: true,
            },
            "Enter" if key.command() => KeyOutcome {
                event: Some(ViewEvent::Finalise {}),
                prevent_default: true,
            },
            "Escape" => KeyOutcome {
                event: Some(ViewEvent::Deselect {}),
                prevent_default: false,
            },
            _ => KeyOutcome::default(),
        };
        if let Some(event) = &outcome.event {
            self.sink.push_event(event.clone());
        }
        outcome
    }

    /// Listens to a document-wide key stream until the returned
    /// subscription is dropped.
    pub fn mount(self, mut keys: broadcast::Receiver<KeyEvent>) -> Subscription {
        let task = tokio::spawn(async move {
            loop {
                match keys.recv().await {
                    Ok(key) => {
                        self.handle_key(&key);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("⚠️ Keyboard listener missed {} key events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }
}

/// Dropping it removes the listener.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropEffect {
    None,
    Copy,
}

/// The payload carried by a drag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTransfer {
    data: HashMap<String, String>,
    pub effect_allowed: DropEffect,
    pub drop_effect: DropEffect,
}

impl Default for DataTransfer {
    fn default() -> Self {
        Self {
            data: HashMap::new(),
            effect_allowed: DropEffect::None,
            drop_effect: DropEffect::None,
        }
    }
}

impl DataTransfer {
    pub fn set_data(&mut self, format: &str, value: &str) {
        self.data.insert(format.to_string(), value.to_string());
    }

    /// Empty when nothing was set for `format`.
    pub fn get_data(&self, format: &str) -> &str {
        self.data.get(format).map(String::as_str).unwrap_or("")
    }
}

/// A comment-bank entry that can be dragged onto the feedback area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragSource {
    comment_id: String,
}

impl DragSource {
    pub fn new(comment_id: impl Into<String>) -> Self {
        Self {
            comment_id: comment_id.into(),
        }
    }

    pub fn draggable(&self) -> bool {
        true
    }

    pub fn on_drag_start(&self) -> DataTransfer {
        let mut transfer = DataTransfer::default();
        transfer.set_data(TEXT_PLAIN, &self.comment_id);
        transfer.effect_allowed = DropEffect::Copy;
        transfer
    }
}

pub struct DropZone<S: EventSink> {
    sink: S,
    classes: ClassList,
}

impl<S: EventSink> DropZone<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            classes: ClassList::default(),
        }
    }

    pub fn classes(&self) -> &ClassList {
        &self.classes
    }

    pub fn is_highlighted(&self) -> bool {
        HIGHLIGHT.iter().all(|c| self.classes.contains(c))
    }

    /// Returns whether the default action is prevented, which it always is.
    pub fn on_drag_over(&mut self, transfer: &mut DataTransfer) -> bool {
        transfer.drop_effect = DropEffect::Copy;
        self.classes.add(HIGHLIGHT);
        true
    }

    pub fn on_drag_leave(&mut self) {
        self.classes.remove(HIGHLIGHT);
    }

    pub fn on_drop(&mut self, transfer: &DataTransfer) -> bool {
        self.classes.remove(HIGHLIGHT);
        let id = transfer.get_data(TEXT_PLAIN);
        if !id.is_empty() {
            self.sink.push_event(ViewEvent::InsertComment { id: id.to_string() });
        }
        true
    }
}
