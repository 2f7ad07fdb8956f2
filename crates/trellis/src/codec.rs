//! Wire framing: `command(u8) | escaped-length | payload`.
//!
//! The payload length is emitted as its minimal little-endian bytes with a
//! byte-stuffing transform: every `0x00` in the emitted stream is followed
//! by `0x01`, and the pair `0x00 0x00` terminates the length field. A
//! zero-length payload is legal (the length field is the terminator alone).
//!
//! Decoding is a resumable state machine so that frames may straddle
//! socket reads at any byte boundary.

use crate::command::Command;
use crate::types::{Error, Result};

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Vec<u8>,
}

/// Encode a frame ready to be written to a socket.
pub fn encode_frame(command: Command, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.push(command as u8);
    let mut len = payload.len();
    while len > 0 {
        let byte = (len & 0xFF) as u8;
        out.push(byte);
        if byte == 0x00 {
            out.push(0x01);
        }
        len >>= 8;
    }
    out.push(0x00);
    out.push(0x00);
    out.extend_from_slice(payload);
    out
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitCommand,
    ReadLength,
    ReadPayload,
}

/// Resumable frame decoder. Feed it byte slices of any size; completed
/// frames are returned as they become whole.
pub struct FrameDecoder {
    stage: Stage,
    command: Command,
    length: u64,
    shift: u32,
    saw_zero: bool,
    expect: usize,
    buffer: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            stage: Stage::AwaitCommand,
            command: Command::NullCommand,
            length: 0,
            shift: 0,
            saw_zero: false,
            expect: 0,
            buffer: Vec::new(),
            max_payload,
        }
    }

    /// Consume `input`, appending any completed frames to the result.
    ///
    /// A malformed length field, an unknown command code, or a sentinel
    /// command on the wire poisons the stream: the caller must drop the
    /// connection.
    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos < input.len() {
            match self.stage {
                Stage::AwaitCommand => {
                    let command = Command::try_from(input[pos])?;
                    if command == Command::NullCommand {
                        return Err(Error::Decode);
                    }
                    pos += 1;
                    self.command = command;
                    self.length = 0;
                    self.shift = 0;
                    self.saw_zero = false;
                    self.stage = Stage::ReadLength;
                }
                Stage::ReadLength => {
                    let byte = input[pos];
                    pos += 1;
                    if self.saw_zero {
                        self.saw_zero = false;
                        match byte {
                            // Terminator: the length field is complete.
                            0x00 => {
                                if self.length > self.max_payload as u64 {
                                    return Err(Error::Decode);
                                }
                                self.expect = self.length as usize;
                                if self.expect == 0 {
                                    frames.push(Frame {
                                        command: self.command,
                                        payload: Vec::new(),
                                    });
                                    self.stage = Stage::AwaitCommand;
                                } else {
                                    self.stage = Stage::ReadPayload;
                                }
                            }
                            // Stuffed literal 0x00 length byte.
                            0x01 => {
                                if self.shift >= 64 {
                                    return Err(Error::Decode);
                                }
                                self.shift += 8;
                            }
                            _ => return Err(Error::Decode),
                        }
                    } else if byte == 0x00 {
                        self.saw_zero = true;
                    } else {
                        if self.shift >= 64 {
                            return Err(Error::Decode);
                        }
                        self.length |= (byte as u64) << self.shift;
                        self.shift += 8;
                    }
                }
                Stage::ReadPayload => {
                    let take = (self.expect - self.buffer.len()).min(input.len() - pos);
                    self.buffer.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    if self.buffer.len() == self.expect {
                        frames.push(Frame {
                            command: self.command,
                            payload: std::mem::take(&mut self.buffer),
                        });
                        self.stage = Stage::AwaitCommand;
                    }
                }
            }
        }
        Ok(frames)
    }
}
