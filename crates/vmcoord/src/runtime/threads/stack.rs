//! Managed call stack of a thread.
//!
//! Frames are stored bottom to top. Walks visit them top first and never mutate
//! through the visitor: the visitor inspects a [`FrameDescriptor`] and returns a
//! [`FrameAction`] that the walker applies.

use bitflags::bitflags;

use crate::runtime::{
    class_linker::MethodId,
    code::{CodeAddr, MethodHeader},
};

bitflags! {
    /// Deoptimization bits stored in the "should deoptimize" slot of an optimized frame.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct DeoptFlags: u8 {
        /// On return, check whether the caller must be deoptimized.
        const CHECK_CALLER_FOR_DEOPT = 0x1;
        /// The method was redefined; the frame must deoptimize unconditionally.
        const FORCE_DEOPT_FOR_REDEFINITION = 0x2;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameKind {
    /// Interpreter frame.
    Shadow { notify_dex_pc_move: bool },
    /// Frame of compiled code. `header` is `None` for stubs without metadata.
    Quick { header: Option<MethodHeader> },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Frame {
    /// `None` for runtime transition frames.
    pub method: Option<MethodId>,
    pub kind: FrameKind,
    pub deopt_flags: DeoptFlags,
    pub pc: CodeAddr,
}

impl Frame {
    pub fn interpreted(method: MethodId) -> Self {
        Self {
            method: Some(method),
            kind: FrameKind::Shadow {
                notify_dex_pc_move: false,
            },
            deopt_flags: DeoptFlags::empty(),
            pc: CodeAddr(0),
        }
    }

    pub fn compiled(method: MethodId, pc: CodeAddr, header: MethodHeader) -> Self {
        Self {
            method: Some(method),
            kind: FrameKind::Quick {
                header: Some(header),
            },
            deopt_flags: DeoptFlags::empty(),
            pc,
        }
    }

    pub fn runtime() -> Self {
        Self {
            method: None,
            kind: FrameKind::Quick { header: None },
            deopt_flags: DeoptFlags::empty(),
            pc: CodeAddr(0),
        }
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self.kind, FrameKind::Shadow { .. })
    }

    pub fn header(&self) -> Option<MethodHeader> {
        match self.kind {
            FrameKind::Quick { header } => header,
            FrameKind::Shadow { .. } => None,
        }
    }

    /// Optimized frames that carry a deoptimization slot.
    pub fn has_should_deoptimize_flag(&self) -> bool {
        self.header()
            .is_some_and(|header| header.has_should_deoptimize_flag)
    }
}

/// Read-only view of a frame handed to stack visitors.
#[derive(Clone, Copy, Debug)]
pub struct FrameDescriptor<'a> {
    /// 0 for the innermost frame.
    pub depth: usize,
    pub frame: &'a Frame,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameAction {
    Continue,
    /// Set deoptimization bits on the frame.
    Mark(DeoptFlags),
    /// Clear deoptimization bits on the frame.
    Clear(DeoptFlags),
    /// Toggle dex pc notifications of an interpreter frame.
    SetDexPcEvents(bool),
    Stop,
}

#[derive(Default, Debug, Clone)]
pub struct ManagedStack {
    frames: Vec<Frame>,
}

impl ManagedStack {
    pub const fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// The frame below the innermost one.
    pub fn caller(&self) -> Option<&Frame> {
        self.frames.iter().rev().nth(1)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames from the innermost outwards.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().rev()
    }

    /// Visit frames innermost first, applying the returned actions. Returns the
    /// number of frames visited.
    pub fn walk(&mut self, mut visitor: impl FnMut(FrameDescriptor<'_>) -> FrameAction) -> usize {
        let mut visited = 0;
        for (depth, index) in (0..self.frames.len()).rev().enumerate() {
            visited += 1;
            let action = visitor(FrameDescriptor {
                depth,
                frame: &self.frames[index],
            });

            let frame = &mut self.frames[index];
            match action {
                FrameAction::Continue => (),
                FrameAction::Mark(flags) => frame.deopt_flags |= flags,
                FrameAction::Clear(flags) => frame.deopt_flags &= !flags,
                FrameAction::SetDexPcEvents(enabled) => {
                    if let FrameKind::Shadow { notify_dex_pc_move } = &mut frame.kind {
                        *notify_dex_pc_move = enabled;
                    }
                }
                FrameAction::Stop => break,
            }
        }
        visited
    }
}
