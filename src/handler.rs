//! Application-facing handler facade.
//!
//! A [`Handler`] translates `post*`, `send*Message*`, and `remove*` calls into
//! keyed tasks on its looper's scheduler. Every task it queues carries a
//! [`TaskKey`] naming the handler, so removal and `has_*` queries only ever
//! see this handler's work.

use crate::error::Result;
use crate::key::{CallbackId, HandlerId, MessageId, TaskKey, Token};
use crate::looper::Looper;
use crate::scheduler::PendingTask;
use std::fmt;
use std::rc::Rc;

/// A reusable unit of work. Clones share identity.
#[derive(Clone)]
pub struct Runnable {
    id: CallbackId,
    action: Rc<dyn Fn()>,
}

impl Runnable {
    pub fn new(action: impl Fn() + 'static) -> Self {
        Self {
            id: CallbackId::fresh(),
            action: Rc::new(action),
        }
    }

    #[must_use]
    pub const fn id(&self) -> CallbackId {
        self.id
    }

    pub fn run(&self) {
        (self.action)();
    }
}

impl PartialEq for Runnable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Runnable {}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runnable")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A message dispatched to a handler's callback.
///
/// Clones keep the message id: re-sending a clone of a still-queued message
/// replaces the queued copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    pub what: i32,
    pub arg1: i32,
    pub arg2: i32,
    pub obj: Option<Token>,
    when: u64,
}

impl Message {
    #[must_use]
    pub fn new(what: i32) -> Self {
        Self {
            id: MessageId::fresh(),
            what,
            arg1: 0,
            arg2: 0,
            obj: None,
            when: 0,
        }
    }

    #[must_use]
    pub const fn with_args(mut self, arg1: i32, arg2: i32) -> Self {
        self.arg1 = arg1;
        self.arg2 = arg2;
        self
    }

    #[must_use]
    pub fn with_obj(mut self, obj: impl Into<Token>) -> Self {
        self.obj = Some(obj.into());
        self
    }

    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// Virtual time the message was scheduled for; 0 until it is sent.
    #[must_use]
    pub const fn when(&self) -> u64 {
        self.when
    }
}

type MessageCallback = Rc<dyn Fn(&Message)>;

/// Posts runnables and messages to one looper.
#[derive(Clone)]
pub struct Handler {
    id: HandlerId,
    looper: Looper,
    callback: Option<MessageCallback>,
}

impl Handler {
    /// A handler whose messages are dropped on dispatch.
    #[must_use]
    pub fn new(looper: Looper) -> Self {
        Self {
            id: HandlerId::fresh(),
            looper,
            callback: None,
        }
    }

    /// A handler that dispatches messages to `callback`.
    pub fn with_callback(looper: Looper, callback: impl Fn(&Message) + 'static) -> Self {
        Self {
            id: HandlerId::fresh(),
            looper,
            callback: Some(Rc::new(callback)),
        }
    }

    #[must_use]
    pub const fn id(&self) -> HandlerId {
        self.id
    }

    #[must_use]
    pub const fn looper(&self) -> &Looper {
        &self.looper
    }

    fn callback_key(&self, runnable: &Runnable, token: Option<Token>) -> TaskKey {
        TaskKey::Callback {
            handler: self.id,
            callback: runnable.id,
            token,
        }
    }

    fn queue_runnable(&self, runnable: &Runnable, token: Option<Token>, task: impl FnOnce(PendingTask) -> PendingTask) -> Result<bool> {
        let key = self.callback_key(runnable, token);
        let runnable = runnable.clone();
        let pending = task(PendingTask::new(move || runnable.run()).keyed(key));
        Ok(self.looper.enqueue(pending)?.is_some())
    }

    pub fn post(&self, runnable: &Runnable) -> bool {
        self.queue_runnable(runnable, None, |task| task)
            .unwrap_or(false)
    }

    pub fn post_delayed(&self, runnable: &Runnable, delay_ms: i64) -> Result<bool> {
        self.queue_runnable(runnable, None, |task| task.delayed(delay_ms))
    }

    /// Post to run at an absolute virtual time on this looper's clock.
    pub fn post_at_time(&self, runnable: &Runnable, uptime_ms: u64) -> bool {
        self.queue_runnable(runnable, None, |task| task.at(uptime_ms))
            .unwrap_or(false)
    }

    pub fn post_at_time_with_token(
        &self,
        runnable: &Runnable,
        token: impl Into<Token>,
        uptime_ms: u64,
    ) -> bool {
        self.queue_runnable(runnable, Some(token.into()), |task| task.at(uptime_ms))
            .unwrap_or(false)
    }

    pub fn post_at_front_of_queue(&self, runnable: &Runnable) -> bool {
        self.queue_runnable(runnable, None, PendingTask::at_front)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn obtain_message(&self, what: i32) -> Message {
        Message::new(what)
    }

    fn queue_message(&self, message: &Message, when: impl FnOnce(PendingTask) -> PendingTask) -> Result<bool> {
        if self.looper.has_quit() {
            tracing::trace!(
                event = "handler.send.dropped",
                handler = %self.id,
                message = %message.id,
                "Dropping message sent to quit looper"
            );
            return Ok(false);
        }

        let scheduler = self.looper.scheduler();
        let (handler, id) = (self.id, message.id);
        scheduler.remove_matching(|key| {
            matches!(key, TaskKey::Message { handler: h, message: m, .. } if *h == handler && *m == id)
        });

        let key = TaskKey::Message {
            handler: self.id,
            message: message.id,
            what: message.what,
            obj: message.obj.clone(),
        };
        let mut dispatched = message.clone();
        let callback = self.callback.clone();
        let clock = scheduler.downgrade();
        let pending = when(PendingTask::new(move || {
            dispatched.when = clock.upgrade().map_or(0, |s| s.current_time());
            tracing::trace!(
                event = "handler.dispatch",
                handler = %handler,
                message = %dispatched.id,
                what = dispatched.what,
                "Dispatching message"
            );
            if let Some(callback) = callback {
                callback(&dispatched);
            }
        }))
        .keyed(key);
        Ok(self.looper.enqueue(pending)?.is_some())
    }

    pub fn send_message(&self, message: &Message) -> bool {
        self.queue_message(message, |task| task).unwrap_or(false)
    }

    pub fn send_message_delayed(&self, message: &Message, delay_ms: i64) -> Result<bool> {
        self.queue_message(message, |task| task.delayed(delay_ms))
    }

    pub fn send_message_at_time(&self, message: &Message, uptime_ms: u64) -> bool {
        self.queue_message(message, |task| task.at(uptime_ms))
            .unwrap_or(false)
    }

    pub fn send_message_at_front_of_queue(&self, message: &Message) -> bool {
        self.queue_message(message, PendingTask::at_front)
            .unwrap_or(false)
    }

    pub fn send_empty_message(&self, what: i32) -> bool {
        self.send_message(&Message::new(what))
    }

    pub fn send_empty_message_delayed(&self, what: i32, delay_ms: i64) -> Result<bool> {
        self.send_message_delayed(&Message::new(what), delay_ms)
    }

    fn is_own_message(&self, key: &TaskKey, what: i32, obj: Option<&Token>) -> bool {
        match key {
            TaskKey::Message {
                handler,
                what: queued_what,
                obj: queued_obj,
                ..
            } => {
                *handler == self.id
                    && *queued_what == what
                    && obj.is_none_or(|obj| queued_obj.as_ref() == Some(obj))
            }
            _ => false,
        }
    }

    fn is_own_callback(&self, key: &TaskKey, runnable: &Runnable, token: Option<&Token>) -> bool {
        match key {
            TaskKey::Callback {
                handler,
                callback,
                token: queued_token,
            } => {
                *handler == self.id
                    && *callback == runnable.id
                    && token.is_none_or(|token| queued_token.as_ref() == Some(token))
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn has_messages(&self, what: i32) -> bool {
        self.looper
            .scheduler()
            .has_matching(|key| self.is_own_message(key, what, None))
    }

    #[must_use]
    pub fn has_messages_with_object(&self, what: i32, obj: &Token) -> bool {
        self.looper
            .scheduler()
            .has_matching(|key| self.is_own_message(key, what, Some(obj)))
    }

    #[must_use]
    pub fn has_callbacks(&self, runnable: &Runnable) -> bool {
        self.looper
            .scheduler()
            .has_matching(|key| self.is_own_callback(key, runnable, None))
    }

    pub fn remove_messages(&self, what: i32) -> usize {
        self.looper
            .scheduler()
            .remove_matching(|key| self.is_own_message(key, what, None))
    }

    pub fn remove_messages_with_object(&self, what: i32, obj: &Token) -> usize {
        self.looper
            .scheduler()
            .remove_matching(|key| self.is_own_message(key, what, Some(obj)))
    }

    /// Remove every queued post of `runnable`, whatever its token.
    pub fn remove_callbacks(&self, runnable: &Runnable) -> usize {
        self.looper
            .scheduler()
            .remove_matching(|key| self.is_own_callback(key, runnable, None))
    }

    pub fn remove_callbacks_with_token(&self, runnable: &Runnable, token: &Token) -> usize {
        self.looper
            .scheduler()
            .remove_matching(|key| self.is_own_callback(key, runnable, Some(token)))
    }

    /// Remove this handler's callbacks and messages whose token/obj equals
    /// `token`, or all of them when `token` is `None`.
    pub fn remove_callbacks_and_messages(&self, token: Option<&Token>) -> usize {
        self.looper.scheduler().remove_matching(|key| {
            key.handler() == Some(self.id) && token.is_none_or(|token| key.token() == Some(token))
        })
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("looper", &self.looper)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
