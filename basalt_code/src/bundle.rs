//! Bundle layout: one allocation, three arrays.
//!
//! A compiled method's storage is a single contiguous allocation holding
//! three length-prefixed arrays back-to-back: scalar literals, reference
//! literals, machine code. The literal pools precede the code so emitted
//! instructions reach them at fixed negative offsets from the code start.
//! Every array, empty ones included, gets a header so a linear scan of
//! the region sees nothing but well-formed cells.
//!
//! The layout descriptor computes all offsets up front; accessors
//! bounds-check against the offset table rather than trusting callers
//! with raw pointer arithmetic.

/// Machine word size in bytes. Cells and bundles are word-aligned.
pub const WORD_SIZE: usize = 8;

/// Size of a cell header: one word holding the payload length in bytes.
pub const CELL_HEADER_SIZE: usize = 8;

/// Round `value` up to a multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

// =============================================================================
// Array Fields
// =============================================================================

/// The three arrays of a bundle, in layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayField {
    /// Non-reference data addressed by the machine code.
    ScalarLiterals,
    /// Heap references addressed by the machine code; kept in one
    /// scannable cell so the collector can find them.
    ReferenceLiterals,
    /// The machine code itself.
    Code,
}

impl ArrayField {
    /// The fields in bundle layout order.
    pub const ALL: [ArrayField; 3] = [
        ArrayField::ScalarLiterals,
        ArrayField::ReferenceLiterals,
        ArrayField::Code,
    ];

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

// =============================================================================
// Bundle Layout
// =============================================================================

/// Byte layout of one compiled method's bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleLayout {
    lengths: [usize; 3],
    cell_offsets: [usize; 3],
    bundle_size: usize,
}

impl BundleLayout {
    /// Compute the layout for the given payload lengths (in bytes).
    pub fn new(
        code_length: usize,
        scalar_literals_length: usize,
        reference_literals_length: usize,
    ) -> Self {
        assert_eq!(
            reference_literals_length % WORD_SIZE,
            0,
            "reference literals are whole words"
        );
        let lengths = [
            scalar_literals_length,
            reference_literals_length,
            code_length,
        ];
        let mut cell_offsets = [0usize; 3];
        let mut offset = 0;
        for (i, &len) in lengths.iter().enumerate() {
            cell_offsets[i] = offset;
            offset += align_up(CELL_HEADER_SIZE + len, WORD_SIZE);
        }
        BundleLayout {
            lengths,
            cell_offsets,
            bundle_size: offset,
        }
    }

    /// Total allocation size of the bundle, word-aligned.
    #[inline]
    pub fn bundle_size(&self) -> usize {
        self.bundle_size
    }

    /// Payload length of a field in bytes.
    #[inline]
    pub fn length(&self, field: ArrayField) -> usize {
        self.lengths[field.index()]
    }

    /// Offset of a field's cell header within the bundle.
    #[inline]
    pub fn cell_offset(&self, field: ArrayField) -> usize {
        self.cell_offsets[field.index()]
    }

    /// Offset of a field's first payload byte within the bundle.
    #[inline]
    pub fn element_offset(&self, field: ArrayField) -> usize {
        self.cell_offsets[field.index()] + CELL_HEADER_SIZE
    }

    /// Size of a field's cell: header plus word-aligned payload.
    #[inline]
    pub fn cell_size(&self, field: ArrayField) -> usize {
        align_up(CELL_HEADER_SIZE + self.lengths[field.index()], WORD_SIZE)
    }

    /// Check that `offset` falls inside the payload of `field`.
    #[inline]
    pub fn contains_offset(&self, field: ArrayField, offset: usize) -> bool {
        offset < self.length(field)
    }
}

// =============================================================================
// Bundle Parts
// =============================================================================

/// The payloads to plant into a freshly allocated bundle.
///
/// Reference literals are opaque handle words; the collector learns about
/// them through the bundle's reference-literal cell, never through the
/// code bytes.
#[derive(Debug, Clone, Copy)]
pub struct BundleParts<'a> {
    pub code: &'a [u8],
    pub scalar_literals: &'a [u8],
    pub reference_literals: &'a [u64],
}

impl BundleParts<'_> {
    /// Compute the layout these parts require.
    pub fn layout(&self) -> BundleLayout {
        BundleLayout::new(
            self.code.len(),
            self.scalar_literals.len(),
            self.reference_literals.len() * WORD_SIZE,
        )
    }

    /// Check that the parts match a precomputed layout.
    pub fn matches(&self, layout: &BundleLayout) -> bool {
        layout.length(ArrayField::Code) == self.code.len()
            && layout.length(ArrayField::ScalarLiterals) == self.scalar_literals.len()
            && layout.length(ArrayField::ReferenceLiterals)
                == self.reference_literals.len() * WORD_SIZE
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(100, 16), 112);
    }

    #[test]
    fn test_layout_is_contiguous() {
        let layout = BundleLayout::new(100, 24, 16);
        let mut expected = 0;
        for field in ArrayField::ALL {
            assert_eq!(layout.cell_offset(field), expected);
            assert_eq!(
                layout.element_offset(field),
                expected + CELL_HEADER_SIZE
            );
            expected += layout.cell_size(field);
        }
        assert_eq!(layout.bundle_size(), expected);
        assert_eq!(layout.bundle_size() % WORD_SIZE, 0);
    }

    #[test]
    fn test_empty_arrays_still_get_headers() {
        // 64 code bytes, no scalars, one reference word:
        // cells are 8, 16, and 72 bytes.
        let layout = BundleLayout::new(64, 0, 8);
        assert_eq!(layout.cell_size(ArrayField::ScalarLiterals), 8);
        assert_eq!(layout.cell_size(ArrayField::ReferenceLiterals), 16);
        assert_eq!(layout.cell_size(ArrayField::Code), 72);
        assert_eq!(layout.bundle_size(), 96);

        assert_eq!(layout.cell_offset(ArrayField::ScalarLiterals), 0);
        assert_eq!(layout.cell_offset(ArrayField::ReferenceLiterals), 8);
        assert_eq!(layout.cell_offset(ArrayField::Code), 24);
        assert_eq!(layout.element_offset(ArrayField::Code), 32);
    }

    #[test]
    fn test_unaligned_code_length_pads() {
        let layout = BundleLayout::new(13, 0, 0);
        // 8 + 13 = 21, padded to 24.
        assert_eq!(layout.cell_size(ArrayField::Code), 24);
        assert_eq!(layout.length(ArrayField::Code), 13);
    }

    #[test]
    fn test_contains_offset() {
        let layout = BundleLayout::new(64, 0, 8);
        assert!(layout.contains_offset(ArrayField::Code, 0));
        assert!(layout.contains_offset(ArrayField::Code, 63));
        assert!(!layout.contains_offset(ArrayField::Code, 64));
        assert!(!layout.contains_offset(ArrayField::ScalarLiterals, 0));
    }

    #[test]
    fn test_parts_layout_round_trip() {
        let code = [0u8; 40];
        let scalars = [0u8; 12];
        let refs = [0u64; 2];
        let parts = BundleParts {
            code: &code,
            scalar_literals: &scalars,
            reference_literals: &refs,
        };
        let layout = parts.layout();
        assert!(parts.matches(&layout));
        assert_eq!(layout.length(ArrayField::ReferenceLiterals), 16);

        let other = BundleLayout::new(41, 12, 16);
        assert!(!parts.matches(&other));
    }

    #[test]
    #[should_panic(expected = "whole words")]
    fn test_partial_reference_word_rejected() {
        BundleLayout::new(0, 0, 7);
    }
}
