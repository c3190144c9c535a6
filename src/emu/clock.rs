//! Clocked state for the compute pipeline.
//!
//! Every pipeline stage is modeled as registered logic: during a tick a
//! component reads the *committed* outputs of its registers, computes, and
//! assigns new inputs. Nothing becomes visible until [`Clocked::update`] is
//! called at the clock edge, so a value assigned in tick `T` is read in tick
//! `T + 1`.
//!
//! ```text
//!   tick T                       edge                tick T+1
//!   ┌──────────────────────┐      │      ┌──────────────────────┐
//!   │ output() -> old data │      │      │ output() -> new data │
//!   │ assign(new data)     │ ───► update │                      │
//!   └──────────────────────┘      │      └──────────────────────┘
//! ```

use std::fmt::Debug;

/// Interface to clocked components.
pub trait Clocked {
    /// Simulate a clock edge, committing all pending register inputs.
    fn update(&mut self);
}

/// Double-buffered storage element.
///
/// A register that is not assigned during a tick holds its value across the
/// edge.
#[derive(Debug, Clone, Default)]
pub struct Register<T: Clone + Debug> {
    data: T,
    input: Option<T>,
}

impl<T: Clone + Debug> Register<T> {
    /// Create a register holding `init`.
    pub fn new(init: T) -> Self {
        Self {
            data: init,
            input: None,
        }
    }

    /// Current committed output.
    #[inline]
    pub fn output(&self) -> &T {
        &self.data
    }

    /// Latch a value to be committed at the next edge.
    #[inline]
    pub fn assign(&mut self, data: T) {
        self.input = Some(data);
    }

    /// True if a value is waiting for the next edge.
    pub fn has_pending(&self) -> bool {
        self.input.is_some()
    }

    /// Force both the committed and pending values (used by reset).
    pub fn force(&mut self, data: T) {
        self.data = data;
        self.input = None;
    }
}

impl<T: Clone + Debug> Clocked for Register<T> {
    fn update(&mut self) {
        if let Some(data) = self.input.take() {
            self.data = data;
        }
    }
}
