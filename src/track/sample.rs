//! Run-length bookkeeping for timed samples.
//!
//! A sequential stream of (duration, offset, length) samples folds
//! into three independent run-length tables: duration runs (`stts`),
//! size runs (`stsz`), and file-contiguous chunks (`stsc`/`stco`).
//! Each incoming sample is offered to the most recent group of each
//! kind; the group accepts it while its invariant holds and its run
//! length stays under the 32-bit signed sample-count ceiling. The
//! three kinds are evaluated independently: a duration-run boundary
//! does not force a chunk boundary, and vice versa.

/// Run-length ceiling of every group kind.
pub(crate) const MAX_GROUP_COUNT: u64 = i32::MAX as u64;

/// One timed unit of media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Duration in media timescale units.
    pub duration: u64,
    /// Byte offset of the sample data in the output stream.
    pub offset: u64,
    /// Byte length of the sample data.
    pub length: u64,
}

/// A maximal run of consecutive samples with identical duration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeToSampleGroup {
    pub duration: u64,
    pub sample_count: u64,
}

/// A maximal run of consecutive samples with identical byte length.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SampleSizeGroup {
    pub length: u64,
    pub sample_count: u64,
}

/// A maximal run of file-contiguous samples sharing a sample
/// description.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Chunk {
    pub sample_description_id: u32,
    pub sample_count: u64,
    /// File offset of the chunk's first sample.
    pub first_offset: u64,
    /// Expected offset of the next contiguous sample.
    pub next_offset: u64,
}

/// Fold `count` consecutive samples of one duration into the duration
/// run table, exactly as if added one at a time.
pub(crate) fn fold_durations(groups: &mut Vec<TimeToSampleGroup>, duration: u64, mut count: u64) {
    if let Some(tail) = groups.last_mut() {
        if tail.duration == duration {
            let take = count.min(MAX_GROUP_COUNT - tail.sample_count);
            tail.sample_count += take;
            count -= take;
        }
    }
    while count > 0 {
        let take = count.min(MAX_GROUP_COUNT);
        groups.push(TimeToSampleGroup { duration, sample_count: take });
        count -= take;
    }
}

/// Fold `count` consecutive samples of one byte length into the size
/// run table.
pub(crate) fn fold_sizes(groups: &mut Vec<SampleSizeGroup>, length: u64, mut count: u64) {
    if let Some(tail) = groups.last_mut() {
        if tail.length == length {
            let take = count.min(MAX_GROUP_COUNT - tail.sample_count);
            tail.sample_count += take;
            count -= take;
        }
    }
    while count > 0 {
        let take = count.min(MAX_GROUP_COUNT);
        groups.push(SampleSizeGroup { length, sample_count: take });
        count -= take;
    }
}

/// Fold `count` file-contiguous samples of one byte length, starting
/// at `offset`, into the chunk table. The tail chunk continues only if
/// the first sample lands exactly at its `next_offset` and the sample
/// description matches.
pub(crate) fn fold_chunks(
    chunks: &mut Vec<Chunk>,
    sample_description_id: u32,
    mut offset: u64,
    length: u64,
    mut count: u64,
) {
    if let Some(tail) = chunks.last_mut() {
        if tail.sample_description_id == sample_description_id && tail.next_offset == offset {
            let take = count.min(MAX_GROUP_COUNT - tail.sample_count);
            tail.sample_count += take;
            tail.next_offset += take * length;
            offset += take * length;
            count -= take;
        }
    }
    while count > 0 {
        let take = count.min(MAX_GROUP_COUNT);
        chunks.push(Chunk {
            sample_description_id,
            sample_count: take,
            first_offset: offset,
            next_offset: offset + take * length,
        });
        offset += take * length;
        count -= take;
    }
}
