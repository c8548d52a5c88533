//! Ordered stack of byte-stream layers.
//!
//! The stack owns its layers top-down: each layer boxes the one below it,
//! and the stack keeps the top plus a label table for by-name access. I/O on
//! the stack goes to the top layer; terminate, sync-write and flush-read
//! cascade top-down, and a failing terminate does not prevent lower layers
//! from being finalized.

use crate::error::{Error, Result};
use crate::layer::{Layer, Mode, SkipDirection};

/// Labels the engine gives its own layers, bottom to top. Operations use
/// them to reach a specific layer mid-stack: the tape-mark layer to emit
/// marks, the compression layer to suspend and resume it, and the layer
/// below the tape marks to place the trailer and terminator.
pub mod labels {
    pub const SLICER: &str = "slicer";
    pub const CIPHER: &str = "cipher";
    pub const CACHE: &str = "cache";
    pub const ESCAPE: &str = "escape";
    pub const COMPRESSOR: &str = "compressor";
}

pub struct Stack {
    top: Option<Box<dyn Layer>>,
    /// Labels indexed from the bottom of the stack.
    labels: Vec<Option<String>>,
}

impl Stack {
    pub fn new() -> Self {
        Self {
            top: None,
            labels: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Pushes a layer built over the current top.
    ///
    /// `build` receives the current top (`None` for the first layer) and
    /// returns the new top, which must use a mode compatible with what it
    /// sits on.
    pub fn push<F>(&mut self, label: Option<&str>, build: F) -> Result<()>
    where
        F: FnOnce(Option<Box<dyn Layer>>) -> Result<Box<dyn Layer>>,
    {
        if let Some(label) = label {
            if self.labels.iter().flatten().any(|l| l == label) {
                return Err(Error::Libcall(format!(
                    "layer label `{label}` already in use"
                )));
            }
        }
        let below_mode = self.top.as_ref().map(|t| t.mode());
        let new_top = build(self.top.take())?;
        if let Some(below) = below_mode {
            if !new_top.mode().compatible_over(below) {
                return Err(Error::Libcall(
                    "layer mode incompatible with the layer below".into(),
                ));
            }
        }
        self.top = Some(new_top);
        self.labels.push(label.map(str::to_owned));
        Ok(())
    }

    /// Detaches and returns the top layer. Its former lower neighbour
    /// becomes the new top.
    pub fn pop(&mut self) -> Option<Box<dyn Layer>> {
        let mut popped = self.top.take()?;
        self.top = popped.take_below();
        self.labels.pop();
        Some(popped)
    }

    pub fn top_mut(&mut self) -> Result<&mut dyn Layer> {
        match self.top.as_deref_mut() {
            Some(top) => Ok(top),
            None => Err(Error::Libcall("empty layer stack".into())),
        }
    }

    /// Depth (0 = top) of the layer carrying `label`.
    fn depth_of(&self, label: &str) -> Option<usize> {
        let idx = self
            .labels
            .iter()
            .position(|l| l.as_deref() == Some(label))?;
        Some(self.labels.len() - 1 - idx)
    }

    fn layer_at(&mut self, depth: usize) -> Result<&mut dyn Layer> {
        let mut current = self.top_mut()?;
        for _ in 0..depth {
            current = current
                .below_mut()
                .ok_or_else(|| Error::Libcall("stack depth out of range".into()))?;
        }
        Ok(current)
    }

    /// Finds a layer by the label given at push time.
    pub fn get_by_label(&mut self, label: &str) -> Result<&mut dyn Layer> {
        let depth = self
            .depth_of(label)
            .ok_or_else(|| Error::Libcall(format!("no layer labelled `{label}`")))?;
        self.layer_at(depth)
    }

    /// The layer directly below the labelled one.
    pub fn below_of(&mut self, label: &str) -> Result<&mut dyn Layer> {
        let depth = self
            .depth_of(label)
            .ok_or_else(|| Error::Libcall(format!("no layer labelled `{label}`")))?;
        self.layer_at(depth + 1)
    }

    /// The layer directly above the labelled one, if any.
    pub fn above_of(&mut self, label: &str) -> Result<Option<&mut dyn Layer>> {
        let depth = self
            .depth_of(label)
            .ok_or_else(|| Error::Libcall(format!("no layer labelled `{label}`")))?;
        if depth == 0 {
            Ok(None)
        } else {
            self.layer_at(depth - 1).map(Some)
        }
    }

    /// Terminates every layer top-down. The first error is kept but lower
    /// layers are still finalized.
    pub fn terminate(&mut self) -> Result<()> {
        let mut first_err = None;
        for depth in 0..self.len() {
            let outcome = self.layer_at(depth).and_then(|l| l.terminate());
            if let Err(e) = outcome {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    log::warn!("further error while finalizing layer stack: {e}");
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for Stack {
    fn mode(&self) -> Mode {
        self.top.as_ref().map(|t| t.mode()).unwrap_or(Mode::Read)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.top_mut()?.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.top_mut()?.write_all(buf)
    }

    fn skip(&mut self, pos: u64) -> Result<bool> {
        self.top_mut()?.skip(pos)
    }

    fn skip_to_eof(&mut self) -> Result<u64> {
        self.top_mut()?.skip_to_eof()
    }

    fn skippable(&self, direction: SkipDirection, amount: u64) -> bool {
        match self.top.as_ref() {
            Some(top) => top.skippable(direction, amount),
            None => false,
        }
    }

    fn position(&mut self) -> Result<u64> {
        self.top_mut()?.position()
    }

    fn sync_write(&mut self) -> Result<()> {
        for depth in 0..self.len() {
            self.layer_at(depth)?.sync_write()?;
        }
        Ok(())
    }

    fn flush_read(&mut self) -> Result<()> {
        for depth in 0..self.len() {
            self.layer_at(depth)?.flush_read()?;
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        Stack::terminate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::MemoryLayer;

    /// Pass-through layer used to exercise stacking.
    struct Plain {
        below: Option<Box<dyn Layer>>,
        mode: Mode,
    }

    impl Layer for Plain {
        fn mode(&self) -> Mode {
            self.mode
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.below.as_mut().unwrap().read(buf)
        }
        fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.below.as_mut().unwrap().write_all(buf)
        }
        fn skip(&mut self, pos: u64) -> Result<bool> {
            self.below.as_mut().unwrap().skip(pos)
        }
        fn skip_to_eof(&mut self) -> Result<u64> {
            self.below.as_mut().unwrap().skip_to_eof()
        }
        fn skippable(&self, d: SkipDirection, n: u64) -> bool {
            self.below.as_ref().unwrap().skippable(d, n)
        }
        fn position(&mut self) -> Result<u64> {
            self.below.as_mut().unwrap().position()
        }
        fn sync_write(&mut self) -> Result<()> {
            Ok(())
        }
        fn flush_read(&mut self) -> Result<()> {
            Ok(())
        }
        fn terminate(&mut self) -> Result<()> {
            Ok(())
        }
        fn below_mut(&mut self) -> Option<&mut dyn Layer> {
            match &mut self.below {
                Some(b) => Some(b.as_mut()),
                None => None,
            }
        }
        fn take_below(&mut self) -> Option<Box<dyn Layer>> {
            self.below.take()
        }
    }

    fn plain(mode: Mode) -> impl FnOnce(Option<Box<dyn Layer>>) -> Result<Box<dyn Layer>> {
        move |below| Ok(Box::new(Plain { below, mode }) as Box<dyn Layer>)
    }

    #[test]
    fn push_pop_and_labels() {
        let mut stack = Stack::new();
        stack
            .push(Some("base"), |_| {
                Ok(Box::new(MemoryLayer::new(Mode::ReadWrite)))
            })
            .unwrap();
        stack.push(Some("mid"), plain(Mode::ReadWrite)).unwrap();
        stack.push(None, plain(Mode::ReadWrite)).unwrap();
        assert_eq!(stack.len(), 3);

        stack.write_all(b"abc").unwrap();
        assert!(stack.get_by_label("mid").is_ok());
        assert!(stack.below_of("mid").is_ok());
        assert!(stack.above_of("mid").unwrap().is_some());
        assert!(stack.above_of("base").unwrap().is_some());
        assert!(stack.get_by_label("nope").is_err());

        stack.pop().unwrap();
        stack.pop().unwrap();
        assert_eq!(stack.len(), 1);
        // the memory layer is the top again and retained the bytes
        stack.skip(0).unwrap();
        let mut buf = [0u8; 3];
        stack.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn duplicate_label_rejected() {
        let mut stack = Stack::new();
        stack
            .push(Some("x"), |_| {
                Ok(Box::new(MemoryLayer::new(Mode::ReadWrite)))
            })
            .unwrap();
        assert!(stack.push(Some("x"), plain(Mode::ReadWrite)).is_err());
    }

    #[test]
    fn incompatible_mode_rejected() {
        let mut stack = Stack::new();
        stack
            .push(None, |_| Ok(Box::new(MemoryLayer::new(Mode::Read))))
            .unwrap();
        assert!(stack.push(None, plain(Mode::Write)).is_err());
    }
}
