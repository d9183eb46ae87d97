// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token-to-angle-row position resolution.
//!
//! Maps every token of a batch to the row of the angle cache it must be
//! rotated with. Three batch shapes are supported:
//!
//! - **Padded, shared offset**: token `p` of every sequence uses row
//!   `p + offset`.
//! - **Padded, per-sequence offsets**: token `p` of sequence `b` uses row
//!   `p + offset[b]` (incremental decoding with requests at different
//!   depths).
//! - **Packed**: sequences are concatenated along one axis and delimited by
//!   cumulative lengths; the local position restarts at 0 for every run.
//!
//! A packed batch resolves to exactly the rows the same sequences would get
//! in a padded batch, with the pad rows dropped.

use crate::error::{Result, RopeError};

// ---------------------------------------------------------------------------
// Offsets
// ---------------------------------------------------------------------------

/// Position offset applied before the local token position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offsets {
    /// Same offset for every sequence in the batch.
    Scalar(usize),
    /// One offset per sequence.
    PerSequence(Vec<usize>),
}

impl Default for Offsets {
    fn default() -> Self {
        Self::Scalar(0)
    }
}

impl From<usize> for Offsets {
    fn from(offset: usize) -> Self {
        Self::Scalar(offset)
    }
}

impl From<Vec<usize>> for Offsets {
    fn from(offsets: Vec<usize>) -> Self {
        Self::PerSequence(offsets)
    }
}

impl Offsets {
    /// Check that the offsets fit a batch of `batch` sequences.
    fn check_batch(&self, batch: usize) -> Result<()> {
        match self {
            Self::PerSequence(offsets) if offsets.len() != batch => {
                Err(RopeError::ShapeMismatch(format!(
                    "{} per-sequence offsets for a batch of {batch}",
                    offsets.len()
                )))
            }
            Self::Scalar(_) | Self::PerSequence(_) => Ok(()),
        }
    }

    /// Offset of sequence `b`. Callers check the batch size first.
    fn for_sequence(&self, b: usize) -> usize {
        match self {
            Self::Scalar(offset) => *offset,
            Self::PerSequence(offsets) => offsets.get(b).copied().unwrap_or(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Packed sequence metadata
// ---------------------------------------------------------------------------

/// Boundaries of the sequences in a packed (variable-length) batch.
///
/// # Example
///
/// ```
/// use candle_rotary::PackedSequenceMeta;
///
/// let meta = PackedSequenceMeta::from_lengths(&[3, 0, 5]);
/// assert_eq!(meta.cu_seqlens(), &[0, 3, 3, 8]);
/// assert_eq!(meta.batch_size(), 3);
/// assert_eq!(meta.total_tokens(), 8);
/// assert_eq!(meta.max_seqlen(), 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedSequenceMeta {
    /// Prefix token counts, `batch + 1` entries starting at 0.
    cu_seqlens: Vec<usize>,
    /// Upper bound on any single sequence length.
    max_seqlen: usize,
}

impl PackedSequenceMeta {
    /// Create metadata from cumulative lengths.
    ///
    /// # Errors
    ///
    /// Returns [`RopeError::ShapeMismatch`] if `cu_seqlens` is empty, does
    /// not start at 0, decreases anywhere, or contains a run longer than
    /// `max_seqlen`.
    pub fn new(cu_seqlens: Vec<usize>, max_seqlen: usize) -> Result<Self> {
        if cu_seqlens.first() != Some(&0) {
            return Err(RopeError::ShapeMismatch(
                "cu_seqlens must be non-empty and start at 0".into(),
            ));
        }
        for (b, pair) in cu_seqlens.windows(2).enumerate() {
            let (start, end) = match pair {
                [start, end] => (*start, *end),
                _ => continue,
            };
            if end < start {
                return Err(RopeError::ShapeMismatch(format!(
                    "cu_seqlens decreases at sequence {b}: {start} -> {end}"
                )));
            }
            if end - start > max_seqlen {
                return Err(RopeError::ShapeMismatch(format!(
                    "sequence {b} has {} tokens, more than max_seqlen {max_seqlen}",
                    end - start
                )));
            }
        }
        Ok(Self {
            cu_seqlens,
            max_seqlen,
        })
    }

    /// Build metadata from individual sequence lengths.
    pub fn from_lengths(lengths: &[usize]) -> Self {
        let mut cu_seqlens = Vec::with_capacity(lengths.len() + 1);
        let mut total = 0;
        cu_seqlens.push(total);
        for len in lengths {
            total += len;
            cu_seqlens.push(total);
        }
        Self {
            cu_seqlens,
            max_seqlen: lengths.iter().copied().max().unwrap_or(0),
        }
    }

    /// Cumulative lengths, `batch + 1` entries.
    pub fn cu_seqlens(&self) -> &[usize] {
        &self.cu_seqlens
    }

    /// Upper bound on any single sequence length.
    pub const fn max_seqlen(&self) -> usize {
        self.max_seqlen
    }

    /// Number of sequences.
    pub fn batch_size(&self) -> usize {
        self.cu_seqlens.len().saturating_sub(1)
    }

    /// Number of tokens across all sequences.
    pub fn total_tokens(&self) -> usize {
        self.cu_seqlens.last().copied().unwrap_or(0)
    }

    /// `(start, len)` of every sequence in the packed stream.
    pub fn runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.cu_seqlens
            .windows(2)
            .filter_map(|pair| match pair {
                [start, end] => Some((*start, end - start)),
                _ => None,
            })
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Leading (token) dimensions of a tensor handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenLayout {
    /// Dense `[batch, seqlen, ...]` batch.
    Padded {
        /// Number of sequences.
        batch: usize,
        /// Tokens per sequence (including padding).
        seqlen: usize,
    },
    /// Flattened `[total_tokens, ...]` batch described by
    /// [`PackedSequenceMeta`].
    Packed {
        /// Tokens across all sequences.
        total: usize,
    },
}

impl TokenLayout {
    /// Number of token dimensions at the front of the tensor.
    pub const fn rank(&self) -> usize {
        match self {
            Self::Padded { .. } => 2,
            Self::Packed { .. } => 1,
        }
    }

    /// Total number of tokens.
    pub const fn n_tokens(&self) -> usize {
        match self {
            Self::Padded { batch, seqlen } => *batch * *seqlen,
            Self::Packed { total } => *total,
        }
    }
}

/// Angle-cache row for every token, in row-major token order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionIndex {
    /// One row per token.
    rows: Vec<u32>,
    /// `max(rows) + 1`, or 0 without tokens.
    required_len: usize,
}

impl PositionIndex {
    /// One angle row per token.
    pub fn rows(&self) -> &[u32] {
        &self.rows
    }

    /// Minimum cache length needed to serve every row.
    pub const fn required_len(&self) -> usize {
        self.required_len
    }

    /// Number of tokens resolved.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no tokens were resolved.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Resolve the angle row of every token.
///
/// # Errors
///
/// Returns [`RopeError::ShapeMismatch`] if the offsets do not match the
/// batch size, packed metadata is given for a padded batch (or missing for
/// a packed one), the packed metadata does not cover exactly `total`
/// tokens, or a row does not fit in `u32`.
pub fn resolve(
    tokens: TokenLayout,
    offsets: &Offsets,
    packed: Option<&PackedSequenceMeta>,
) -> Result<PositionIndex> {
    let mut rows = Vec::with_capacity(tokens.n_tokens());
    match (tokens, packed) {
        (TokenLayout::Padded { batch, seqlen }, None) => {
            offsets.check_batch(batch)?;
            for b in 0..batch {
                push_run(&mut rows, offsets.for_sequence(b), seqlen)?;
            }
        }
        (TokenLayout::Packed { total }, Some(meta)) => {
            if meta.total_tokens() != total {
                return Err(RopeError::ShapeMismatch(format!(
                    "cu_seqlens covers {} tokens, tensor has {total}",
                    meta.total_tokens()
                )));
            }
            offsets.check_batch(meta.batch_size())?;
            for (b, (_, len)) in meta.runs().enumerate() {
                push_run(&mut rows, offsets.for_sequence(b), len)?;
            }
        }
        (TokenLayout::Padded { .. }, Some(_)) => {
            return Err(RopeError::ShapeMismatch(
                "packed metadata given for a padded [batch, seqlen, ...] tensor".into(),
            ));
        }
        (TokenLayout::Packed { .. }, None) => {
            return Err(RopeError::ShapeMismatch(
                "packed [total_tokens, ...] tensor without cu_seqlens".into(),
            ));
        }
    }

    #[allow(clippy::as_conversions)]
    let required_len = rows.iter().max().map_or(0, |&row| row as usize + 1);
    Ok(PositionIndex { rows, required_len })
}

/// Append rows `offset..offset + len`.
fn push_run(rows: &mut Vec<u32>, offset: usize, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len)
        .and_then(|end| u32::try_from(end).ok())
        .ok_or_else(|| {
            RopeError::ShapeMismatch(format!(
                "position {offset} + {len} does not fit the angle index range"
            ))
        })?;
    // `end` fits in u32, so `offset` does too.
    let start = u32::try_from(offset).unwrap_or(end);
    rows.extend(start..end);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
