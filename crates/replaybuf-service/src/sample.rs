//! SampleStream: prioritized flexible-batch sampling with framed fan-out.
//!
//! Each sampled item is emitted as a sequence of entries whose chunks appear
//! exactly once, in trajectory order, with `end_of_sequence` on the last one.
//! Frames are bounded by `MAX_SAMPLE_RESPONSE_SIZE_BYTES`; chunk payloads are
//! `Bytes`, so appending one to a frame shares the buffer instead of copying.

use crate::service::ReplayService;
use crate::transport::{StreamContext, StreamReader, StreamWriter, WriteOptions};
use prost::Message;
use replaybuf_core::{Result, SampledItem, Status, Table};
use replaybuf_proto::{
    ChunkData, SampleEntry, SampleInfo, SampleStreamRequest, SampleStreamResponse,
    AUTO_SELECT_BATCH_SIZE,
};
use std::time::Duration;

/// Upper bound on one outgoing sample frame. Samples whose chunks exceed this
/// are split across multiple frames.
pub const MAX_SAMPLE_RESPONSE_SIZE_BYTES: usize = 40 * 1024 * 1024;

/// Wire size of one chunk appended to an entry's `data` field.
fn chunk_field_len(chunk: &ChunkData) -> usize {
    let len = chunk.encoded_len();
    1 + prost::length_delimiter_len(len) + len
}

impl ReplayService {
    /// Handle one SampleStream connection. The client may issue several
    /// sample requests on the same stream; the rate-limiter timeout of the
    /// initial request applies to all of them.
    pub async fn sample_stream<R, W>(
        &self,
        context: &StreamContext,
        mut requests: R,
        mut responses: W,
    ) -> Result<()>
    where
        R: StreamReader<SampleStreamRequest>,
        W: StreamWriter<SampleStreamResponse>,
    {
        let Some(mut request) = requests.recv().await? else {
            return Err(Status::internal("Could not read initial request"));
        };

        // Negative or absent means wait on the rate limiter indefinitely.
        let timeout = match request.rate_limiter_timeout_ms {
            Some(ms) if ms >= 0 => Some(Duration::from_millis(ms as u64)),
            _ => None,
        };

        loop {
            if request.num_samples <= 0 {
                return Err(Status::invalid_argument("`num_samples` must be > 0."));
            }
            if request.flexible_batch_size <= 0
                && request.flexible_batch_size != AUTO_SELECT_BATCH_SIZE
            {
                return Err(Status::invalid_argument(format!(
                    "`flexible_batch_size` must be > 0 or {} (for auto selection).",
                    AUTO_SELECT_BATCH_SIZE
                )));
            }
            let table = self.table_or_not_found(&request.table)?;
            let default_flexible_batch_size = table.default_flexible_batch_size();

            let mut count: i64 = 0;
            while !context.is_cancelled() && count != request.num_samples {
                let requested = if request.flexible_batch_size == AUTO_SELECT_BATCH_SIZE {
                    default_flexible_batch_size
                } else {
                    request.flexible_batch_size
                };
                let max_batch_size =
                    std::cmp::min(requested as i64, request.num_samples - count) as i32;

                let samples = table.sample_flexible_batch(max_batch_size, timeout).await?;
                count += samples.len() as i64;

                for sample in &samples {
                    write_sample(sample, &mut responses).await?;
                }
            }

            match requests.recv().await? {
                Some(next) => request = next,
                None => return Ok(()),
            }
        }
    }
}

/// Fan one sampled item out over as many frames as its chunks require.
async fn write_sample<W>(sample: &SampledItem, responses: &mut W) -> Result<()>
where
    W: StreamWriter<SampleStreamResponse>,
{
    let num_chunks = sample.item.chunks.len();
    if num_chunks == 0 {
        return Ok(());
    }
    let mut entry = SampleEntry::default();

    for (index, chunk) in sample.item.chunks.iter().enumerate() {
        let data = chunk.data().clone();

        // Flush before this chunk would push the frame past the bound. The
        // flushed entry never carries end_of_sequence: more chunks remain.
        if !entry.data.is_empty()
            && entry.encoded_len() + chunk_field_len(&data) > MAX_SAMPLE_RESPONSE_SIZE_BYTES
        {
            flush_entry(&mut entry, responses).await?;
        }

        // The info rides on the first entry of the sample, with priority and
        // times_sampled as of sample time.
        if index == 0 {
            let mut item = sample.item.item.clone();
            item.priority = sample.priority;
            item.times_sampled = sample.times_sampled;
            entry.info = Some(SampleInfo {
                item: Some(item),
                probability: sample.probability,
                table_size: sample.table_size,
                rate_limited: sample.rate_limited,
            });
        }

        entry.data.push(data);
        entry.end_of_sequence = index + 1 == num_chunks;
    }

    flush_entry(&mut entry, responses).await
}

async fn flush_entry<W>(entry: &mut SampleEntry, responses: &mut W) -> Result<()>
where
    W: StreamWriter<SampleStreamResponse>,
{
    let response = SampleStreamResponse {
        entries: vec![std::mem::take(entry)],
    };
    responses
        // Chunk payloads are already compressed.
        .send(response, WriteOptions::no_compression())
        .await
        .map_err(|_| Status::internal("Failed to write to Sample stream."))
}
