//! The editing surface seam.
//!
//! The host UI owns rendering, the caret and focus. The engine only reads
//! and writes the surface's value and selection through [`EditingSurface`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cursor::Selection;

/// What the engine needs from the visual host.
///
/// Offsets are `char` offsets into [`EditingSurface::value`].
pub trait EditingSurface: Send + 'static {
    fn value(&self) -> String;

    /// Replace the whole value. Hosts typically move the caret to the end.
    fn set_value(&mut self, text: &str);

    fn selection(&self) -> Selection;

    fn set_selection(&mut self, selection: Selection);

    fn has_focus(&self) -> bool;

    /// Read-only observers never count as the local user editing.
    fn is_read_only(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct SurfaceState {
    text: String,
    selection: Selection,
    focused: bool,
    read_only: bool,
    /// Number of `set_value` calls, to observe remote swaps.
    remote_writes: u64,
}

/// Headless surface for tests and the demo binary.
///
/// Cloning yields another handle to the same buffer, so one clone can be
/// given to a session while the caller keeps typing into the other.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    inner: Arc<Mutex<SurfaceState>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        let surface = Self::new();
        {
            let mut state = surface.lock();
            state.text = text.into();
            state.selection = Selection::caret(state.text.chars().count());
        }
        surface
    }

    fn lock(&self) -> MutexGuard<'_, SurfaceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn text(&self) -> String {
        self.lock().text.clone()
    }

    pub fn focus(&self) {
        self.lock().focused = true;
    }

    pub fn blur(&self) {
        self.lock().focused = false;
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.lock().read_only = read_only;
    }

    pub fn select(&self, selection: Selection) {
        self.lock().selection = selection;
    }

    /// Insert `s` at the caret, replacing any selection, as a keystroke
    /// would. Returns the new value.
    pub fn type_text(&self, s: &str) -> String {
        let mut state = self.lock();
        let start = state.selection.start();
        let end = state.selection.end();
        let byte_start = byte_offset(&state.text, start);
        let byte_end = byte_offset(&state.text, end);
        state.text.replace_range(byte_start..byte_end, s);
        state.selection = Selection::caret(start + s.chars().count());
        state.text.clone()
    }

    pub fn remote_writes(&self) -> u64 {
        self.lock().remote_writes
    }
}

fn byte_offset(text: &str, char_offset: usize) -> usize {
    text.char_indices()
        .nth(char_offset)
        .map_or(text.len(), |(idx, _)| idx)
}

impl EditingSurface for MemorySurface {
    fn value(&self) -> String {
        self.text()
    }

    fn set_value(&mut self, text: &str) {
        let mut state = self.lock();
        state.text = text.to_string();
        state.selection = Selection::caret(text.chars().count());
        state.remote_writes += 1;
    }

    fn selection(&self) -> Selection {
        self.lock().selection
    }

    fn set_selection(&mut self, selection: Selection) {
        self.lock().selection = selection;
    }

    fn has_focus(&self) -> bool {
        self.lock().focused
    }

    fn is_read_only(&self) -> bool {
        self.lock().read_only
    }
}
