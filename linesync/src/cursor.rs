//! Caret preservation across content swaps the user did not initiate.
//!
//! Offsets are counted in `char`s, the same unit [`crate::surface`] uses.

/// Caret or selection on the editing surface.
///
/// `anchor` is where the selection started, `head` where the caret is.
/// A backwards selection has `head < anchor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    /// Collapsed selection (plain caret).
    pub fn caret(offset: usize) -> Self {
        Self { anchor: offset, head: offset }
    }

    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    pub fn start(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn end(&self) -> usize {
        self.anchor.max(self.head)
    }
}

/// Clamp a single offset into `[0, new_len]`.
#[inline]
pub fn clamp_offset(offset: usize, new_len: usize) -> usize {
    offset.min(new_len)
}

/// Map a selection onto content of length `new_len`.
///
/// Both ends are clamped independently. A collapsed selection stays
/// collapsed; anything past the end lands on end-of-document.
pub fn clamp(selection: Selection, new_len: usize) -> Selection {
    if selection.is_collapsed() {
        return Selection::caret(clamp_offset(selection.head, new_len));
    }
    Selection {
        anchor: clamp_offset(selection.anchor, new_len),
        head: clamp_offset(selection.head, new_len),
    }
}
