//! Fixed-window chunker and embedding batcher.
//!
//! Each formatted record is cut into consecutive windows of `chunk_size`
//! characters (the last one may be shorter) with no overlap, so the
//! windows concatenate back to the original text. Every window keeps its
//! record's reference. Windows are then grouped into ordered batches of
//! `batch_size` for the embedding service.

use crate::models::{EmbeddableChunk, FormattedRecord};

/// Split `text` into windows of at most `chunk_size` characters.
///
/// Empty text yields no windows. Splits fall on `char` boundaries, never
/// inside a multi-byte character.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<&str> {
    let chunk_size = chunk_size.max(1);
    let mut windows = Vec::with_capacity(text.len() / chunk_size + 1);
    let mut start = 0;
    let mut count = 0;

    for (offset, _) in text.char_indices() {
        if count == chunk_size {
            windows.push(&text[start..offset]);
            start = offset;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        windows.push(&text[start..]);
    }
    windows
}

/// Chunk every record and group the chunks into ordered batches.
///
/// Records with empty text are skipped.
pub fn chunk_and_batch(
    records: &[FormattedRecord],
    chunk_size: usize,
    batch_size: usize,
) -> Vec<Vec<EmbeddableChunk>> {
    let chunks: Vec<EmbeddableChunk> = records
        .iter()
        .filter(|r| !r.text.is_empty())
        .flat_map(|record| {
            chunk_text(&record.text, chunk_size)
                .into_iter()
                .map(|window| EmbeddableChunk {
                    text: window.to_string(),
                    reference: record.reference.clone(),
                })
        })
        .collect();

    chunks
        .chunks(batch_size.max(1))
        .map(|batch| batch.to_vec())
        .collect()
}
