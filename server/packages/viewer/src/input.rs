use std::collections::HashSet;

use render_gateway_protocol::input::remap_browser_button;
use render_gateway_protocol::script::add_remote_events;
use render_gateway_protocol::InputEvent;

/// Queues input between flushes. A key that is already down does not queue
/// another key-down until its key-up arrives.
#[derive(Debug, Default)]
pub struct InputBatcher {
    queue: Vec<InputEvent>,
    held_keys: HashSet<u32>,
}

impl InputBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the event was suppressed as a key repeat.
    pub fn push(&mut self, event: InputEvent) -> bool {
        match &event {
            InputEvent::KeyDown { key } => {
                if !self.held_keys.insert(*key) {
                    return false;
                }
            }
            InputEvent::KeyUp { key } => {
                self.held_keys.remove(key);
            }
            _ => {}
        }
        self.queue.push(event);
        true
    }

    /// Mouse button event numbered the way browsers number them.
    pub fn push_browser_button(&mut self, down: bool, button: u8) {
        let button = remap_browser_button(button);
        let event = if down {
            InputEvent::MouseDown { button }
        } else {
            InputEvent::MouseUp { button }
        };
        self.push(event);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn take(&mut self) -> Vec<InputEvent> {
        std::mem::take(&mut self.queue)
    }

    /// Drains the queue into one `add_remote_events` script, if anything is
    /// queued.
    pub fn flush_script(&mut self, namespace: &str) -> Result<Option<String>, serde_json::Error> {
        if self.queue.is_empty() {
            return Ok(None);
        }
        let events = self.take();
        add_remote_events(namespace, &events).map(Some)
    }
}
