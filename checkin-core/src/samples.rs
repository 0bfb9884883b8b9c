//! Bounded buffer of timestamped sensor readings awaiting upload.

use core::fmt::Write;

use heapless::{String, Vec as HeaplessVec};

use crate::error::ProtocolFault;
use crate::timesync::Timestamp;

/// Maximum readings held between successful uploads.
pub const SAMPLE_CAPACITY: usize = 20;

/// Capacity of the encoded upload body.
pub const MAX_FORM_LEN: usize = 2048;

/// Supply rail voltage.
pub const CHANNEL_SUPPLY_VOLTAGE: u16 = 255;
/// Radio signal quality percentage.
pub const CHANNEL_SIGNAL_QUALITY: u16 = 256;
/// Controller die temperature.
pub const CHANNEL_CORE_TEMPERATURE: u16 = 257;

/// Encoded upload body.
pub type FormBody = String<MAX_FORM_LEN>;

/// One reading on one channel.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorSample {
    pub timestamp: Timestamp,
    pub channel: u16,
    pub value: f32,
}

/// Insertion-ordered readings; the oldest is evicted once full.
#[derive(Clone, Debug, Default)]
pub struct SampleBuffer {
    samples: HeaplessVec<SensorSample, SAMPLE_CAPACITY>,
}

impl SampleBuffer {
    pub const fn new() -> Self {
        Self {
            samples: HeaplessVec::new(),
        }
    }

    /// Appends a reading, dropping the oldest when the buffer is full.
    ///
    /// Returns the evicted reading, if any.
    pub fn push(&mut self, channel: u16, value: f32, timestamp: Timestamp) -> Option<SensorSample> {
        let sample = SensorSample {
            timestamp,
            channel,
            value,
        };

        let evicted = if self.samples.is_full() {
            Some(self.samples.remove(0))
        } else {
            None
        };

        // Capacity was just freed above, so this cannot fail.
        let _ = self.samples.push(sample);
        evicted
    }

    /// Readings to upload. The buffer keeps them until [`Self::clear`].
    #[must_use]
    pub fn drain_for_transmission(&self) -> &[SensorSample] {
        &self.samples
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Encodes every reading as indexed form fields.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolFault::RequestTooLarge`] when the body does not fit
    /// in [`MAX_FORM_LEN`].
    pub fn encode_form(&self, out: &mut FormBody) -> Result<(), ProtocolFault> {
        out.clear();
        for (index, sample) in self.samples.iter().enumerate() {
            write!(
                out,
                "&sensor[{index}][datetime]={}&sensor[{index}][sensornum]={}&sensor[{index}][sensorval]={:.2}",
                sample.timestamp, sample.channel, sample.value
            )
            .map_err(|_| ProtocolFault::RequestTooLarge)?;
        }
        Ok(())
    }
}
