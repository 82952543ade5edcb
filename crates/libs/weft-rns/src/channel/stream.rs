use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;

use super::{Channel, ChannelOutlet};
use crate::error::RnsError;

/// Reserved channel message type carrying stream data.
pub const STREAM_DATA_TYPE: u16 = 0xFF00;

/// Stream header: 14-bit stream id, EOF in bit 15, compressed in bit 14.
pub const STREAM_ID_MAX: u16 = 0x3FFF;
const STREAM_OVERHEAD: usize = 2;
const EOF_FLAG: u16 = 0x8000;
const COMPRESSED_FLAG: u16 = 0x4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDataMessage {
    pub stream_id: u16,
    pub data: Vec<u8>,
    pub eof: bool,
    pub compressed: bool,
}

impl StreamDataMessage {
    pub fn new(stream_id: u16, data: Vec<u8>, eof: bool, compressed: bool) -> Self {
        Self { stream_id: stream_id & STREAM_ID_MAX, data, eof, compressed }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut header = self.stream_id & STREAM_ID_MAX;
        if self.eof {
            header |= EOF_FLAG;
        }
        if self.compressed {
            header |= COMPRESSED_FLAG;
        }

        let mut out = Vec::with_capacity(STREAM_OVERHEAD + self.data.len());
        out.extend_from_slice(&header.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self, RnsError> {
        if raw.len() < STREAM_OVERHEAD {
            return Err(RnsError::PacketError);
        }
        let header = u16::from_be_bytes([raw[0], raw[1]]);
        Ok(Self {
            stream_id: header & STREAM_ID_MAX,
            data: raw[STREAM_OVERHEAD..].to_vec(),
            eof: header & EOF_FLAG != 0,
            compressed: header & COMPRESSED_FLAG != 0,
        })
    }

    /// Decompresses the payload when the compressed flag is set.
    pub fn plain_data(&self) -> Result<Vec<u8>, RnsError> {
        if !self.compressed {
            return Ok(self.data.clone());
        }
        let mut decoder = BzDecoder::new(self.data.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(|_| RnsError::PacketError)?;
        Ok(out)
    }
}

struct ReaderState {
    buffer: VecDeque<u8>,
    eof: bool,
}

/// Buffered byte-stream reader over a channel stream id.
#[derive(Clone)]
pub struct RawChannelReader {
    state: Arc<Mutex<ReaderState>>,
}

impl RawChannelReader {
    /// Non-blocking read; returns the bytes copied into `buf`, or zero
    /// when nothing is buffered.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return 0,
        };
        let mut copied = 0;
        while copied < buf.len() {
            match state.buffer.pop_front() {
                Some(byte) => {
                    buf[copied] = byte;
                    copied += 1;
                }
                None => break,
            }
        }
        copied
    }

    pub fn read_to_vec(&self) -> Vec<u8> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return Vec::new(),
        };
        state.buffer.drain(..).collect()
    }

    pub fn at_eof(&self) -> bool {
        self.state.lock().map(|state| state.eof && state.buffer.is_empty()).unwrap_or(false)
    }
}

/// Buffered byte-stream writer over a channel stream id.
pub struct RawChannelWriter<O: ChannelOutlet> {
    channel: Arc<Mutex<Channel<O>>>,
    stream_id: u16,
    closed: bool,
}

impl<O: ChannelOutlet> RawChannelWriter<O> {
    /// Chunks `data` to the channel MDU, compressing any chunk that
    /// shrinks, and sends each as a stream message. Returns the number
    /// of bytes accepted before the window filled.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, RnsError> {
        if self.closed {
            return Err(RnsError::ConnectionError);
        }

        let mut channel = self.channel.lock().map_err(|_| RnsError::ConnectionError)?;
        let chunk_size = channel.mdu().saturating_sub(STREAM_OVERHEAD);
        if chunk_size == 0 {
            return Err(RnsError::Overflow);
        }

        let mut written = 0;
        for chunk in data.chunks(chunk_size) {
            let (payload, compressed) = match bz2_compress(chunk) {
                Some(packed) if packed.len() < chunk.len() && packed.len() <= chunk_size => {
                    (packed, true)
                }
                _ => (chunk.to_vec(), false),
            };

            let message = StreamDataMessage::new(self.stream_id, payload, false, compressed);
            match channel.send(STREAM_DATA_TYPE, message.pack()) {
                Ok(_) => written += chunk.len(),
                Err(RnsError::WindowFull) if written > 0 => return Ok(written),
                Err(err) => return Err(err),
            }
        }

        Ok(written)
    }

    /// Closing sends an empty EOF frame; further writes fail.
    pub fn close(&mut self) -> Result<(), RnsError> {
        if self.closed {
            return Ok(());
        }

        let message = StreamDataMessage::new(self.stream_id, Vec::new(), true, false);
        let mut channel = self.channel.lock().map_err(|_| RnsError::ConnectionError)?;
        channel.send(STREAM_DATA_TYPE, message.pack())?;
        self.closed = true;
        Ok(())
    }
}

/// Registers a stream reader on the channel. Inbound stream messages
/// for the id accumulate in the reader's buffer in arrival order, which
/// the channel already guarantees is sequence order.
pub fn create_reader<O: ChannelOutlet>(
    channel: &mut Channel<O>,
    stream_id: u16,
) -> RawChannelReader {
    // The reserved type may already be registered by another reader.
    let _ = channel.register_type_unchecked(STREAM_DATA_TYPE);

    let state = Arc::new(Mutex::new(ReaderState { buffer: VecDeque::new(), eof: false }));
    let handler_state = state.clone();
    let wanted_id = stream_id & STREAM_ID_MAX;

    channel.add_handler(move |envelope| {
        if envelope.msg_type != STREAM_DATA_TYPE {
            return false;
        }
        let Ok(message) = StreamDataMessage::unpack(&envelope.payload) else {
            return false;
        };
        if message.stream_id != wanted_id {
            return false;
        }
        let Ok(plain) = message.plain_data() else {
            return true;
        };
        if let Ok(mut state) = handler_state.lock() {
            state.buffer.extend(plain);
            if message.eof {
                state.eof = true;
            }
        }
        true
    });

    RawChannelReader { state }
}

pub fn create_writer<O: ChannelOutlet>(
    channel: Arc<Mutex<Channel<O>>>,
    stream_id: u16,
) -> Result<RawChannelWriter<O>, RnsError> {
    {
        let mut guard = channel.lock().map_err(|_| RnsError::ConnectionError)?;
        let _ = guard.register_type_unchecked(STREAM_DATA_TYPE);
    }
    Ok(RawChannelWriter { channel, stream_id: stream_id & STREAM_ID_MAX, closed: false })
}

pub fn create_bidirectional<O: ChannelOutlet>(
    channel: Arc<Mutex<Channel<O>>>,
    receive_stream_id: u16,
    send_stream_id: u16,
) -> Result<(RawChannelReader, RawChannelWriter<O>), RnsError> {
    let reader = {
        let mut guard = channel.lock().map_err(|_| RnsError::ConnectionError)?;
        create_reader(&mut guard, receive_stream_id)
    };
    let writer = create_writer(channel, send_stream_id)?;
    Ok((reader, writer))
}

fn bz2_compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::channel::{Channel, ChannelOutlet, Envelope};
    use crate::error::RnsError;

    struct NullOutlet;

    impl ChannelOutlet for NullOutlet {
        fn send(&mut self, _raw: &[u8]) -> Result<(), RnsError> {
            Ok(())
        }

        fn resend(&mut self, _raw: &[u8]) -> Result<(), RnsError> {
            Ok(())
        }

        fn mdu(&self) -> usize {
            400
        }

        fn rtt(&self) -> Duration {
            Duration::from_millis(10)
        }

        fn is_usable(&self) -> bool {
            true
        }
    }

    #[test]
    fn stream_header_packs_flags_and_id() {
        let message = StreamDataMessage::new(0x1234, vec![0xAB], true, false);
        let packed = message.pack();
        assert_eq!(packed[0], 0x92);
        assert_eq!(packed[1], 0x34);

        let unpacked = StreamDataMessage::unpack(&packed).expect("unpacked");
        assert!(unpacked.eof);
        assert!(!unpacked.compressed);
        assert_eq!(unpacked.stream_id, 0x1234);
    }

    #[test]
    fn compressed_payload_round_trips() {
        let data = vec![7u8; 2048];
        let packed = bz2_compress(&data).expect("compressed");
        let message = StreamDataMessage::new(1, packed, false, true);
        assert_eq!(message.plain_data().expect("plain"), data);
    }

    #[test]
    fn reader_accumulates_stream_data_until_eof() {
        let mut channel = Channel::new(NullOutlet);
        let reader = create_reader(&mut channel, 7);

        let deliver = |channel: &mut Channel<NullOutlet>, sequence: u16, message: StreamDataMessage| {
            let envelope =
                Envelope { msg_type: STREAM_DATA_TYPE, sequence, payload: message.pack() };
            channel.receive(&envelope.pack()).expect("received");
        };

        deliver(&mut channel, 0, StreamDataMessage::new(7, b"hello ".to_vec(), false, false));
        deliver(&mut channel, 1, StreamDataMessage::new(7, b"stream".to_vec(), false, false));
        assert!(!reader.at_eof());

        deliver(&mut channel, 2, StreamDataMessage::new(7, Vec::new(), true, false));

        assert_eq!(reader.read_to_vec(), b"hello stream");
        assert!(reader.at_eof());
    }

    #[test]
    fn reader_ignores_other_stream_ids() {
        let mut channel = Channel::new(NullOutlet);
        let reader = create_reader(&mut channel, 1);

        let envelope = Envelope {
            msg_type: STREAM_DATA_TYPE,
            sequence: 0,
            payload: StreamDataMessage::new(2, b"other".to_vec(), false, false).pack(),
        };
        channel.receive(&envelope.pack()).expect("received");

        assert!(reader.read_to_vec().is_empty());
    }

    #[test]
    fn writer_chunks_and_closes_with_eof() {
        let channel = Arc::new(Mutex::new(Channel::new(NullOutlet)));
        let mut writer = create_writer(channel.clone(), 3).expect("writer");

        // Small incompressible payload goes out as a single raw chunk.
        let written = writer.write(&[1, 2, 3]).expect("written");
        assert_eq!(written, 3);

        writer.close().expect("closed");
        assert!(matches!(writer.write(&[4]), Err(RnsError::ConnectionError)));
    }
}
