//! Code buffer for machine-code emission.
//!
//! Append-only byte buffer plus label management. Forward references emit
//! a 32-bit placeholder and are patched when the label binds; `finish`
//! asserts every referenced label was bound so an unresolved branch can
//! never escape into the code cache.

use std::fmt;

/// Handle to a label owned by a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(u32);

#[derive(Debug, Default)]
struct LabelState {
    /// Bound position in the buffer, once known.
    position: Option<u32>,
    /// Positions of 32-bit displacement fields awaiting the bind.
    patch_sites: Vec<u32>,
}

/// An append-only machine-code buffer.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: Vec<LabelState>,
}

impl CodeBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        CodeBuffer {
            code: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Current emission position.
    #[inline]
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    /// Emit a single byte.
    #[inline]
    pub fn emit_u8(&mut self, value: u8) {
        self.code.push(value);
    }

    /// Emit a little-endian 32-bit value.
    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a little-endian 64-bit value.
    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit raw bytes.
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Pad with `fill` until the position is a multiple of `alignment`.
    pub fn align_to(&mut self, alignment: usize, fill: u8) {
        assert!(alignment.is_power_of_two());
        while self.code.len() % alignment != 0 {
            self.code.push(fill);
        }
    }

    /// Create a fresh unbound label.
    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(LabelState::default());
        id
    }

    /// Check whether a label has been bound.
    pub fn is_bound(&self, label: LabelId) -> bool {
        self.labels[label.0 as usize].position.is_some()
    }

    /// Bind a label to the current position, patching pending references.
    pub fn bind(&mut self, label: LabelId) {
        let target = self.code.len() as u32;
        let state = &mut self.labels[label.0 as usize];
        assert!(
            state.position.is_none(),
            "label {:?} bound twice",
            label
        );
        state.position = Some(target);
        let sites = std::mem::take(&mut state.patch_sites);
        for site in sites {
            let disp = target.wrapping_sub(site + 4) as i32;
            self.code[site as usize..site as usize + 4]
                .copy_from_slice(&disp.to_le_bytes());
        }
    }

    /// Emit a 32-bit displacement to `label`, relative to the end of the
    /// field (the x64 rel32 convention). Forward references are patched on
    /// bind.
    pub fn emit_disp32(&mut self, label: LabelId) {
        let site = self.code.len() as u32;
        match self.labels[label.0 as usize].position {
            Some(target) => {
                let disp = target.wrapping_sub(site + 4) as i32;
                self.emit_u32(disp as u32);
            }
            None => {
                self.labels[label.0 as usize].patch_sites.push(site);
                self.emit_u32(0);
            }
        }
    }

    /// Finish emission, asserting no unresolved references remain.
    pub fn finish(self) -> Vec<u8> {
        for (i, label) in self.labels.iter().enumerate() {
            assert!(
                label.patch_sites.is_empty(),
                "label {} referenced but never bound",
                i
            );
        }
        self.code
    }
}

impl fmt::Display for CodeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.code.iter().enumerate() {
            if i > 0 && i % 16 == 0 {
                writeln!(f)?;
            }
            write!(f, "{:02x} ", byte)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
