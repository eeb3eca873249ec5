use crate::preamble::Preamble;

const HEADER_LEN: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Short read: got {actual} bytes, a waveform frame needs at least {required}")]
    ShortRead { actual: usize, required: usize },

    #[error("Payload holds {payload} samples but the preamble reports {points}")]
    PointCountMismatch { payload: usize, points: u64 },
}

/// A `:WAV:DATA?` response split into its three regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformFrame {
    header: [u8; HEADER_LEN],
    payload: Vec<u8>,
    terminator: u8,
}

impl WaveformFrame {
    pub const HEADER_LEN: usize = HEADER_LEN;
    pub const TERMINATOR_LEN: usize = 1;
    pub const MIN_LEN: usize = Self::HEADER_LEN + Self::TERMINATOR_LEN;

    /// Split `response` as `[header][payload][terminator]`.
    pub fn split(mut response: Vec<u8>) -> Result<Self, FrameError> {
        profile_scope!("WaveformFrame::split");

        if response.len() < Self::MIN_LEN {
            return Err(FrameError::ShortRead {
                actual: response.len(),
                required: Self::MIN_LEN,
            });
        }

        let terminator = response.pop().ok_or(FrameError::ShortRead {
            actual: 0,
            required: Self::MIN_LEN,
        })?;
        let payload = response.split_off(Self::HEADER_LEN);
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&response);

        if terminator != b'\n' {
            log::warn!("Waveform frame ends with 0x{:02x} instead of a line feed", terminator);
        }

        Ok(Self {
            header,
            payload,
            terminator,
        })
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn terminator(&self) -> u8 {
        self.terminator
    }

    /// Payload length announced by an IEEE 488.2 definite-length block
    /// header (`#9000125000`), if the header has that shape.
    pub fn declared_len(&self) -> Option<usize> {
        let (&hash, rest) = self.header.split_first()?;
        if hash != b'#' {
            return None;
        }
        let (&digits, rest) = rest.split_first()?;
        let width = (digits as char).to_digit(10)? as usize;
        if width == 0 || width > rest.len() {
            return None;
        }
        std::str::from_utf8(&rest[..width]).ok()?.parse().ok()
    }

    /// Check the payload against the point count of the same capture.
    ///
    /// The payload may be shorter than `points` when the read window cut the
    /// block short, but never longer.
    pub fn check_points(&self, preamble: &Preamble) -> Result<(), FrameError> {
        let payload = self.payload.len();
        if payload as u64 > preamble.points {
            return Err(FrameError::PointCountMismatch {
                payload,
                points: preamble.points,
            });
        }
        if (payload as u64) < preamble.points {
            log::debug!(
                "Payload truncated to {} of {} points by the read window",
                payload,
                preamble.points
            );
        }
        Ok(())
    }
}
