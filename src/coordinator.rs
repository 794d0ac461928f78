//! Multi-layer read coordination.
//!
//! Several logical layers share one forward pass over the upstream
//! stream. The coordinator is the explicit state machine deciding, for
//! each pull, whether the requested layer may produce, whether another
//! layer must be drained first, whether more upstream data is needed, or
//! whether the stream is exhausted. It sees only a snapshot of buffered
//! queue lengths, which keeps every transition unit-testable.

use log::debug;

/// How pulls traverse the upstream stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// One layer is drained completely before the next; each layer
    /// re-reads the stream from the start.
    #[default]
    Sequential,
    /// All layers are populated from a single pass; the current layer
    /// switches explicitly.
    Interleaved,
}

/// Buffer state of one layer, as the coordinator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerLoad {
    /// Buffered feature count.
    pub buffered: usize,
    /// True when the layer exceeds its soft threshold and should be
    /// drained before more input is consumed.
    pub overfull: bool,
}

/// Outcome of one coordinator transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The requested layer may dequeue one buffered feature.
    Deliver,
    /// Another layer owns the stream; dispatch the pull there.
    Refused {
        /// The owning layer.
        current: usize,
    },
    /// Ownership moved to the given layer; retry the pull there.
    Switch(usize),
    /// Pull one more chunk from the upstream parser, then ask again.
    Parse,
    /// Nothing buffered anywhere and the upstream is exhausted.
    EndOfStream,
}

/// State machine over `mode` and the current layer.
#[derive(Debug)]
pub struct ReadCoordinator {
    mode: ReadMode,
    current: Option<usize>,
}

impl ReadCoordinator {
    /// Start with no current layer.
    pub const fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            current: None,
        }
    }

    /// Configured traversal mode.
    pub const fn mode(&self) -> ReadMode {
        self.mode
    }

    /// The layer currently owning the stream, in interleaved mode.
    pub const fn current(&self) -> Option<usize> {
        self.current
    }

    /// Forget the current layer (used when reading restarts).
    pub fn clear_current(&mut self) {
        self.current = None;
    }

    /// First transition of a pull for `requested`, before any upstream
    /// input is consumed.
    pub fn begin_pull(&mut self, requested: usize, load: &[LayerLoad]) -> Step {
        match self.mode {
            ReadMode::Sequential => {
                if buffered(load, requested) > 0 {
                    Step::Deliver
                } else {
                    Step::Parse
                }
            }
            ReadMode::Interleaved => self.begin_pull_interleaved(requested, load),
        }
    }

    /// Transition after one upstream chunk was consumed on behalf of
    /// `requested`. `has_more` reports whether the upstream may still
    /// produce data; only sequential mode consults it.
    pub fn after_parse(&mut self, requested: usize, load: &[LayerLoad], has_more: bool) -> Step {
        if buffered(load, requested) > 0 {
            return Step::Deliver;
        }
        match self.mode {
            ReadMode::Sequential => {
                if has_more {
                    Step::Parse
                } else {
                    Step::EndOfStream
                }
            }
            ReadMode::Interleaved => {
                if let Some(other) = find_other(load, requested, |l| l.buffered > 0) {
                    debug!("switching to layer {other}: no more features in layer {requested}");
                    self.current = Some(other);
                    return Step::Switch(other);
                }
                self.current = None;
                Step::EndOfStream
            }
        }
    }

    fn begin_pull_interleaved(&mut self, requested: usize, load: &[LayerLoad]) -> Step {
        match self.current {
            None => self.current = Some(requested),
            Some(current) if current != requested => {
                return Step::Refused { current };
            }
            Some(_) => {}
        }
        if buffered(load, requested) == 0 {
            if let Some(other) = find_other(load, requested, |l| l.overfull) {
                debug!(
                    "switching to layer {other}: too many buffered features while \
                     layer {requested} is empty"
                );
                self.current = Some(other);
                return Step::Switch(other);
            }
            return Step::Parse;
        }
        Step::Deliver
    }
}

fn buffered(load: &[LayerLoad], index: usize) -> usize {
    load.get(index).map_or(0, |l| l.buffered)
}

fn find_other<F>(load: &[LayerLoad], requested: usize, predicate: F) -> Option<usize>
where
    F: Fn(&LayerLoad) -> bool,
{
    load.iter()
        .enumerate()
        .find(|(index, l)| *index != requested && predicate(l))
        .map(|(index, _)| index)
}
