//! Message framing over a raw byte stream.
//!
//! The default strategy wraps every JSON object in delimiter lines:
//!
//! ```text
//! \n[== "CMake Server" ==[\n<json>\n]== "CMake Server" ==]\n
//! ```
//!
//! Extraction is a pure function of the accumulated bytes: transports may
//! deliver any fragmentation, down to one byte per read, and callers drain
//! by calling [`BufferStrategy::extract`] until it returns `None`.

use crate::config::FramingConfig;

/// Pluggable framing used by a connection.
pub trait BufferStrategy: Send + Sync {
    /// Pull one complete message out of `raw`.
    ///
    /// Consumes the bytes of the returned frame (and anything outside a frame
    /// that precedes it). Returns `None` while no end delimiter has been seen.
    fn extract(&mut self, raw: &mut Vec<u8>) -> Option<String>;

    /// Wrap an outgoing message in frame delimiters.
    fn format(&self, message: &str) -> String;

    /// Drop any partially assembled frame.
    fn clear(&mut self);
}

/// Line-delimited framing with start/end magic lines.
#[derive(Debug, Default)]
pub struct FramedBufferStrategy {
    request_buffer: String,
    in_frame: bool,
}

impl FramedBufferStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferStrategy for FramedBufferStrategy {
    fn extract(&mut self, raw: &mut Vec<u8>) -> Option<String> {
        loop {
            let needle = raw.iter().position(|b| *b == b'\n')?;
            let mut line: Vec<u8> = raw.drain(..=needle).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line == FramingConfig::START_MAGIC {
                self.request_buffer.clear();
                self.in_frame = true;
                continue;
            }
            if line == FramingConfig::END_MAGIC {
                if !self.in_frame {
                    continue;
                }
                self.in_frame = false;
                return Some(std::mem::take(&mut self.request_buffer));
            }
            if self.in_frame {
                self.request_buffer.push_str(&line);
                self.request_buffer.push('\n');
            }
        }
    }

    fn format(&self, message: &str) -> String {
        format!(
            "\n{}\n{}\n{}\n",
            FramingConfig::START_MAGIC,
            message,
            FramingConfig::END_MAGIC
        )
    }

    fn clear(&mut self) {
        self.request_buffer.clear();
        self.in_frame = false;
    }
}
