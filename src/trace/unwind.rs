//! Producing the current thread's return-address program counters.
//!
//! Three interchangeable implementations, chosen at compile time:
//! glibc's `backtrace()` (default), the `backtrace` crate's cursor
//! (`generic-unwind`), and a manual frame-pointer walk (`fast-unwind`).
//! Only the manual walk knows the frame pointers, so only it feeds the
//! variable decoder.

use crate::trace::classify::SegmentCache;

#[cfg(feature = "fast-unwind")]
use crate::trace::classify::SegmentKind;

/// One unwound frame: the return-address pc, and the frame pointer when
/// the unwinder can tell (manual walk only).
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub pc: usize,
    pub fp: Option<usize>,
}

/// How many uninformative frames below main() a full trace from the
/// active unwinder ends with. The manual walk leaves less junk at the
/// bottom than backtrace().
#[cfg(feature = "fast-unwind")]
pub const BOTTOM_JUNK: usize = 1;
#[cfg(not(feature = "fast-unwind"))]
pub const BOTTOM_JUNK: usize = 2;

/// Fill `frames` with the current backtrace, innermost first, skipping the
/// unwinder's own frame. Every returned pc points into code.
pub fn capture(frames: &mut Vec<Frame>, segments: &mut SegmentCache) {
    frames.clear();
    capture_impl(frames, segments);
}

#[cfg(not(any(feature = "fast-unwind", feature = "generic-unwind")))]
fn capture_impl(frames: &mut Vec<Frame>, _segments: &mut SegmentCache) {
    // Ask for N frames and retry with a doubled buffer for as long as the
    // full N came back, which smells of truncation.
    let mut capacity = 40usize;
    loop {
        let mut buf = vec![std::ptr::null_mut::<libc::c_void>(); capacity];
        let depth = unsafe { libc::backtrace(buf.as_mut_ptr(), capacity as libc::c_int) };
        let depth = depth.max(0) as usize;
        if depth >= capacity {
            capacity *= 2;
            continue;
        }
        // buf[0] is this function.
        frames.extend(buf[1..depth].iter().map(|&pc| Frame { pc: pc as usize, fp: None }));
        return;
    }
}

#[cfg(all(feature = "generic-unwind", not(feature = "fast-unwind")))]
fn capture_impl(frames: &mut Vec<Frame>, _segments: &mut SegmentCache) {
    let mut first = true;
    backtrace::trace(|frame| {
        if first {
            // The unwinder itself.
            first = false;
            return true;
        }
        frames.push(Frame { pc: frame.ip() as usize, fp: None });
        true
    });
}

#[cfg(feature = "fast-unwind")]
fn capture_impl(frames: &mut Vec<Frame>, segments: &mut SegmentCache) {
    let mut fp = frame_address();
    let mut prev_sseg = 0usize;
    loop {
        let Some(step) = step_frame(fp, &mut prev_sseg, segments) else {
            return;
        };
        // The link register belongs to the caller, whose frame is the one
        // we just stepped to; hand that fp to the variable decoder.
        frames.push(Frame { pc: step.lr, fp: Some(step.next) });
        fp = step.next;
    }
}

#[cfg(feature = "fast-unwind")]
struct Step {
    lr: usize,
    next: usize,
}

/// The current frame pointer.
#[cfg(feature = "fast-unwind")]
fn frame_address() -> usize {
    let fp: usize;
    unsafe {
        #[cfg(target_arch = "x86_64")]
        std::arch::asm!("mov {}, rbp", out(reg) fp);
        #[cfg(target_arch = "x86")]
        std::arch::asm!("mov {}, ebp", out(reg) fp);
        #[cfg(target_arch = "arm")]
        std::arch::asm!("mov {}, r11", out(reg) fp);
    }
    fp
}

#[cfg(feature = "fast-unwind")]
unsafe fn word(addr: usize, index: isize) -> usize {
    (addr as *const usize).offset(index).read()
}

/// Extract the return address from the frame pointed to by `fp` and step to
/// the caller's frame. Every heuristic failure terminates the walk:
/// better a short backtrace than a wrong one.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[cfg(feature = "fast-unwind")]
fn step_frame(fp: usize, prev_sseg: &mut usize, segments: &mut SegmentCache) -> Option<Step> {
    if fp == 0 {
        return None;
    }

    // The frame is laid out as { prev_fp, return_ip } from fp upwards.
    let saved_fp = unsafe { word(fp, 0) };
    if saved_fp == 0 {
        // Reached the bottom.
        return None;
    }
    let (kind, sseg) = segments.classify(None, saved_fp);
    if kind != SegmentKind::Stack {
        return None;
    }
    // The saved fp must live in the same mapping as the previous one;
    // a change of mapping means we walked across a thread boundary.
    if *prev_sseg == 0 {
        *prev_sseg = sseg;
    } else if *prev_sseg != sseg {
        return None;
    }

    let lr = unsafe { word(fp, 1) };
    let (kind, _) = segments.classify(None, lr);
    if kind != SegmentKind::Code {
        return None;
    }

    let next = saved_fp;
    if next <= fp {
        // The stack is supposed to _grow_ down.
        return None;
    }
    Some(Step { lr, next })
}

/// On arm the prologue's PUSH decides where in the frame the caller's fp
/// was saved; decode it. Only the `PUSH {.., fp, .., lr, pc}` prologue
/// family is recognized; extend `arm_saved_fp_slot` for anything fancier.
#[cfg(target_arch = "arm")]
#[cfg(feature = "fast-unwind")]
fn step_frame(fp: usize, prev_sseg: &mut usize, segments: &mut SegmentCache) -> Option<Step> {
    if fp == 0 {
        return None;
    }

    let top = unsafe { word(fp, 0) };
    let (top_kind, _) = segments.classify(None, top);
    if top_kind != SegmentKind::Code {
        // *fp must be either lr or pc; we're probably inside a noreturn
        // function.
        return None;
    }

    let below = unsafe { word(fp, -1) };
    let (kind, sseg) = segments.classify(None, below);
    let (lr, next) = match kind {
        SegmentKind::Stack => {
            // Layout { fp|sp, lr }. Same-mapping check detects clone()
            // boundaries.
            if *prev_sseg == 0 {
                *prev_sseg = sseg;
            } else if *prev_sseg != sseg {
                return None;
            }
            let lr = top;
            let next = if below != fp + core::mem::size_of::<usize>() {
                below
            } else {
                unsafe { word(fp, -2) }
            };
            (lr, next)
        }
        SegmentKind::Code => {
            // Layout { fp, [r12, sp], lr, pc }; *fp points at the saved pc.
            let lr = below;
            let insn = unsafe { *((top - 8) as *const u32) };
            let slot = arm_saved_fp_slot(insn)?;
            let next = unsafe { word(fp, slot) };
            (lr, next)
        }
        _ => return None,
    };

    if next == fp || next < fp {
        return None;
    }
    Some(Step { lr, next })
}

/// Which slot below fp holds the caller's frame pointer, given the
/// prologue's PUSH instruction. `None` for prologues we don't recognize.
#[cfg(target_arch = "arm")]
#[cfg(feature = "fast-unwind")]
fn arm_saved_fp_slot(insn: u32) -> Option<isize> {
    const PUSH: u32 = 0xE92D0000;
    const REG_FP: u32 = 1 << 11;
    const REG_R12: u32 = 1 << 12;
    const REG_SP: u32 = 1 << 13;
    const REG_LR: u32 = 1 << 14;
    const REG_PC: u32 = 1 << 15;

    if insn & 0xFFFF0000 != PUSH {
        return None;
    }
    if insn & (REG_FP | REG_LR | REG_PC) != (REG_FP | REG_LR | REG_PC) {
        return None;
    }
    let mut slot: isize = -2;
    if insn & REG_SP != 0 {
        slot -= 1;
    }
    if insn & REG_R12 != 0 {
        slot -= 1;
    }
    Some(slot)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::trace::classify::{SegmentCache, SegmentKind};

    #[test]
    fn test_capture_yields_code_addresses() {
        let mut frames = Vec::new();
        let mut segments = SegmentCache::new();
        capture(&mut frames, &mut segments);
        assert!(!frames.is_empty(), "a test thread has frames");
        for frame in &frames {
            let (kind, _) = segments.classify(None, frame.pc);
            assert_eq!(kind, SegmentKind::Code, "pc {:#x} is not code", frame.pc);
        }
    }

    #[test]
    fn test_capture_reuses_buffer() {
        let mut frames = Vec::new();
        let mut segments = SegmentCache::new();
        capture(&mut frames, &mut segments);
        let first = frames.len();
        capture(&mut frames, &mut segments);
        assert!(!frames.is_empty());
        // A second capture from the same depth is about as deep; clearly
        // it did not append to the previous one.
        assert!(frames.len() < first * 2);
    }
}
