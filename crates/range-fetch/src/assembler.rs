//! Block assembler.
//!
//! Re-chunks an ordered stream of arbitrarily sized fragments into exactly two output
//! granularities: block 0 at the first-playable size, and storage-sized blocks after it.
//! The last block may be short. Only the block being filled is held in memory; sealed
//! blocks are handed out and forgotten.

use audio_stream_types::{AssembledBlock, DownloadFragment};
use bytes::BytesMut;

use crate::error::AssemblyError;

/// Output block sizes.
#[derive(Clone, Copy, Debug)]
pub struct AssemblerConfig {
    /// Size of block 0.
    pub first_playable_bytes: u64,
    /// Size of every later block.
    pub storage_block_bytes: u64,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            first_playable_bytes: 256 * 1024,
            storage_block_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Output of [`BlockAssembler::add_fragment`] / [`BlockAssembler::finalize`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssemblerEvent {
    Block(AssembledBlock),
    /// Emitted once, right after block 0 is sealed.
    PlaybackReady,
}

#[derive(Debug)]
struct InProgress {
    expected_total: Option<u64>,
    processed: u64,
    next_sequence: u64,
    next_index: u32,
    buffer: BytesMut,
    sources: Vec<u64>,
    ready_emitted: bool,
}

#[derive(Debug)]
pub struct BlockAssembler {
    config: AssemblerConfig,
    state: Option<InProgress>,
}

impl BlockAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self {
            config: AssemblerConfig {
                first_playable_bytes: config.first_playable_bytes.max(1),
                storage_block_bytes: config.storage_block_bytes.max(1),
            },
            state: None,
        }
    }

    /// Start a new download. `total_expected_bytes` is `None` for streams without a
    /// known length; the last block is then sealed by [`finalize`](Self::finalize).
    pub fn begin(&mut self, total_expected_bytes: Option<u64>) {
        let first = self.first_capacity(total_expected_bytes);
        self.state = Some(InProgress {
            expected_total: total_expected_bytes,
            processed: 0,
            next_sequence: 0,
            next_index: 0,
            buffer: BytesMut::with_capacity(first),
            sources: Vec::new(),
            ready_emitted: false,
        });
    }

    fn first_capacity(&self, total: Option<u64>) -> usize {
        let target = self.config.first_playable_bytes;
        total.map(|t| t.min(target)).unwrap_or(target) as usize
    }

    fn target_for(&self, index: u32) -> u64 {
        if index == 0 {
            self.config.first_playable_bytes
        } else {
            self.config.storage_block_bytes
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    /// Bytes consumed so far in the current download.
    pub fn processed_bytes(&self) -> u64 {
        self.state.as_ref().map(|s| s.processed).unwrap_or(0)
    }

    /// Consume the next fragment; fragments must arrive in sequence order.
    pub fn add_fragment(
        &mut self,
        fragment: DownloadFragment,
    ) -> Result<Vec<AssemblerEvent>, AssemblyError> {
        let config = self.config;
        let st = self.state.as_mut().ok_or(AssemblyError::NotStarted)?;

        if fragment.sequence_index < st.next_sequence {
            return Err(AssemblyError::Duplicate {
                sequence: fragment.sequence_index,
            });
        }
        if fragment.sequence_index > st.next_sequence {
            return Err(AssemblyError::OutOfOrder {
                expected: st.next_sequence,
                got: fragment.sequence_index,
            });
        }
        if fragment.byte_range.start != st.processed {
            return Err(AssemblyError::Gap {
                expected: st.processed,
                got: fragment.byte_range.start,
            });
        }
        let len = fragment.payload.len() as u64;
        if len != fragment.range_len() {
            return Err(AssemblyError::FragmentLength {
                sequence: fragment.sequence_index,
                expected: fragment.range_len(),
                got: len,
            });
        }
        if let Some(total) = st.expected_total {
            if st.processed + len > total {
                return Err(AssemblyError::Overrun {
                    total,
                    got: st.processed + len,
                });
            }
        }

        let sequence = fragment.sequence_index;
        st.next_sequence += 1;

        let mut events = Vec::new();
        let mut payload = fragment.payload;
        while !payload.is_empty() {
            if st.sources.last() != Some(&sequence) {
                st.sources.push(sequence);
            }
            let target = if st.next_index == 0 {
                config.first_playable_bytes
            } else {
                config.storage_block_bytes
            };
            let room = target.saturating_sub(st.buffer.len() as u64) as usize;
            let take = room.min(payload.len());
            st.buffer.extend_from_slice(&payload.split_to(take));
            st.processed += take as u64;

            let full = st.buffer.len() as u64 >= target;
            let last = st.expected_total == Some(st.processed);
            if full || last {
                seal(st, config, &mut events);
            }
        }
        Ok(events)
    }

    /// Flush the in-progress block (even if undersized) and retire the download state.
    ///
    /// Fails with `Incomplete` if a known total was not reached.
    pub fn finalize(&mut self) -> Result<Vec<AssemblerEvent>, AssemblyError> {
        let config = self.config;
        let mut st = self.state.take().ok_or(AssemblyError::NotStarted)?;
        if let Some(total) = st.expected_total {
            if st.processed < total {
                return Err(AssemblyError::Incomplete {
                    expected: total,
                    got: st.processed,
                });
            }
        }
        let mut events = Vec::new();
        if !st.buffer.is_empty() {
            seal(&mut st, config, &mut events);
        }
        Ok(events)
    }

    /// Drop any in-progress state without emitting.
    pub fn abort(&mut self) {
        self.state = None;
    }

    /// Target size of the block that would be sealed next.
    pub fn next_block_target(&self) -> Option<u64> {
        self.state.as_ref().map(|s| self.target_for(s.next_index))
    }
}

fn seal(st: &mut InProgress, config: AssemblerConfig, events: &mut Vec<AssemblerEvent>) {
    let payload = st.buffer.split().freeze();
    let index = st.next_index;
    let block = AssembledBlock {
        storage_index: index,
        source_fragments: std::mem::take(&mut st.sources),
        total_bytes: payload.len() as u64,
        payload,
        is_first_playable: index == 0,
    };
    tracing::debug!(
        index,
        bytes = block.total_bytes,
        fragments = block.source_fragments.len(),
        "block sealed"
    );
    events.push(AssemblerEvent::Block(block));
    if index == 0 && !st.ready_emitted {
        st.ready_emitted = true;
        events.push(AssemblerEvent::PlaybackReady);
    }

    st.next_index += 1;
    let remaining = st
        .expected_total
        .map(|t| t.saturating_sub(st.processed))
        .unwrap_or(config.storage_block_bytes);
    st.buffer = BytesMut::with_capacity(remaining.min(config.storage_block_bytes) as usize);
}
