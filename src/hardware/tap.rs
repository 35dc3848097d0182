// PlaybackTap - lock-free record of what the hardware actually played
//
// Implements an object pool pattern using two lock-free SPSC ring buffers so
// the host's notification context can hand played periods to an observer
// (tests, the demo CLI) without allocating.
//
// Architecture:
// - DATA_QUEUE: host pushes played periods, observer consumes
// - POOL_QUEUE: observer returns empty periods, host recycles
//
// Period flow:
// 1. Host pops an empty period from POOL_QUEUE
// 2. Host copies the submitted buffer into it
// 3. Host pushes it to DATA_QUEUE
// 4. Observer pops it from DATA_QUEUE and inspects it
// 5. Observer pushes it back to POOL_QUEUE
//
// When the pool is exhausted the host drops the record and counts it.

use rtrb::{Consumer, Producer};

use crate::audio::buffer_pool::BufferIndex;

/// Default number of periods the tap can hold before dropping.
pub const DEFAULT_TAP_PERIODS: usize = 16;

/// One period as the hardware played it.
#[derive(Debug, Clone)]
pub struct PlayedPeriod {
    pub index: BufferIndex,
    pub bytes: Vec<u8>,
    /// True when the host played silence because the buffer was not ready
    /// or was busy.
    pub underrun: bool,
}

impl PlayedPeriod {
    fn empty(capacity: usize) -> Self {
        Self {
            index: BufferIndex::First,
            bytes: Vec::with_capacity(capacity),
            underrun: false,
        }
    }
}

/// All four queue ends, before they are split between the two sides.
pub struct TapChannels {
    /// Producer for sending played periods to the observer
    pub data_producer: Producer<PlayedPeriod>,
    /// Consumer for receiving played periods in the observer
    pub data_consumer: Consumer<PlayedPeriod>,
    /// Producer for returning empty periods from the observer
    pub pool_producer: Producer<PlayedPeriod>,
    /// Consumer for retrieving empty periods in the host
    pub pool_consumer: Consumer<PlayedPeriod>,
}

impl TapChannels {
    /// Split into the host half and the observer half.
    pub fn split(self) -> (TapWriter, TapReader) {
        (
            TapWriter {
                data_producer: self.data_producer,
                pool_consumer: self.pool_consumer,
                dropped: 0,
            },
            TapReader {
                data_consumer: self.data_consumer,
                pool_producer: self.pool_producer,
            },
        )
    }
}

/// Pre-allocates the tap's periods.
pub struct PlaybackTap;

impl PlaybackTap {
    /// Create the tap queues with `period_count` recycled periods of
    /// `period_bytes` capacity each.
    ///
    /// # Panics
    /// Panics if period_count is 0
    #[allow(clippy::new_ret_no_self)]
    pub fn new(period_count: usize, period_bytes: usize) -> TapChannels {
        assert!(period_count > 0, "period_count must be greater than 0");

        let (mut pool_producer, pool_consumer) = rtrb::RingBuffer::new(period_count);
        let (data_producer, data_consumer) = rtrb::RingBuffer::new(period_count);

        for _ in 0..period_count {
            pool_producer
                .push(PlayedPeriod::empty(period_bytes))
                .expect("Failed to push period to pool queue during initialization");
        }

        TapChannels {
            data_producer,
            data_consumer,
            pool_producer,
            pool_consumer,
        }
    }
}

/// Host half of the tap.
pub struct TapWriter {
    data_producer: Producer<PlayedPeriod>,
    pool_consumer: Consumer<PlayedPeriod>,
    dropped: u64,
}

impl TapWriter {
    /// Record one played period. `fill` writes the bytes and returns whether
    /// the period was an underrun.
    ///
    /// Never allocates beyond the pooled capacity and never blocks.
    pub fn record(&mut self, index: BufferIndex, fill: impl FnOnce(&mut Vec<u8>) -> bool) {
        let Ok(mut period) = self.pool_consumer.pop() else {
            self.dropped += 1;
            return;
        };
        period.index = index;
        period.bytes.clear();
        period.underrun = fill(&mut period.bytes);
        if self.data_producer.push(period).is_err() {
            self.dropped += 1;
        }
    }

    /// Periods lost because the observer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Observer half of the tap.
pub struct TapReader {
    data_consumer: Consumer<PlayedPeriod>,
    pool_producer: Producer<PlayedPeriod>,
}

impl TapReader {
    /// Visit every played period in order and recycle it.
    pub fn drain_with(&mut self, mut f: impl FnMut(&PlayedPeriod)) -> usize {
        let mut count = 0;
        while let Ok(period) = self.data_consumer.pop() {
            f(&period);
            count += 1;
            let _ = self.pool_producer.push(period);
        }
        count
    }

    /// Copy out every played period and recycle the originals.
    pub fn drain(&mut self) -> Vec<PlayedPeriod> {
        let mut periods = Vec::new();
        self.drain_with(|period| periods.push(period.clone()));
        periods
    }
}
