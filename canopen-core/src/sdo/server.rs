//! SDO server: the state machine a device runs to answer a
//! remote client's download/upload requests.
//!
//! The server does not own a [`crate::bus::Bus`] or register its own
//! timers — it is a plain state machine driven by whoever routes frames
//! to it (see `driver.rs`). Every request-handling method returns an
//! [`Outcome`] telling the caller what to transmit and whether to
//! (re)arm or cancel the transfer's timeout timer.

use crc16::{State as Crc16State, XMODEM};
use log::debug;

use crate::abort::AbortCode;
use crate::dictionary::Dictionary;
use crate::sdo::buffer::TransferBuffer;
use crate::sdo::wire::{self, ClientRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    DownloadSegment,
    UploadSegment,
    BlockDownload,
    BlockDownloadEnd,
    BlockUpload,
    BlockUploadEnd,
}

/// What the caller should do after feeding the server a request.
#[derive(Debug, Default)]
pub struct Outcome {
    pub reply: Option<[u8; 8]>,
    /// Start (or restart) the per-transfer timeout timer.
    pub arm_timeout: bool,
    /// The transfer reached a terminal state (idle); cancel any pending
    /// timeout timer.
    pub done: bool,
}

impl Outcome {
    fn reply(frame: [u8; 8]) -> Self {
        Outcome {
            reply: Some(frame),
            arm_timeout: false,
            done: false,
        }
    }

    fn reply_and_arm(frame: [u8; 8]) -> Self {
        Outcome {
            reply: Some(frame),
            arm_timeout: true,
            done: false,
        }
    }

    fn reply_and_finish(frame: [u8; 8]) -> Self {
        Outcome {
            reply: Some(frame),
            arm_timeout: false,
            done: true,
        }
    }

    fn silent_finish() -> Self {
        Outcome {
            reply: None,
            arm_timeout: false,
            done: true,
        }
    }
}

struct BlockDownloadState {
    crc_supported: bool,
    block_size: u8,
    seq: u8,
}

struct BlockUploadState {
    crc_supported: bool,
    block_size: u8,
    seq: u8,
    offset: usize,
}

pub struct SdoServer {
    state: State,
    toggle: bool,
    index: u16,
    sub: u8,
    buffer: TransferBuffer,
    block_download: Option<BlockDownloadState>,
    block_upload: Option<BlockUploadState>,
}

impl Default for SdoServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoServer {
    pub fn new() -> Self {
        SdoServer {
            state: State::Idle,
            toggle: false,
            index: 0,
            sub: 0,
            buffer: TransferBuffer::new(),
            block_download: None,
            block_upload: None,
        }
    }

    fn abort(&mut self, code: AbortCode) -> Outcome {
        debug!(
            "aborting transfer of {:04X}:{:02X}: {:?}",
            self.index, self.sub, code
        );
        let frame = wire::encode_abort(self.index, self.sub, code.code());
        self.state = State::Idle;
        self.block_download = None;
        self.block_upload = None;
        Outcome::reply_and_finish(frame)
    }

    /// The transfer's timeout fired; emit SDO_AC_TIMEOUT and return to idle.
    pub fn on_timeout(&mut self) -> [u8; 8] {
        debug!(
            "timeout waiting for next request on {:04X}:{:02X}",
            self.index, self.sub
        );
        let frame = wire::encode_abort(self.index, self.sub, AbortCode::Timeout.code());
        self.state = State::Idle;
        self.block_download = None;
        self.block_upload = None;
        frame
    }

    /// Feed one incoming 8-byte request frame to the server.
    ///
    /// Block-download data segments carry no command-specifier byte (the
    /// sequence number occupies byte 0 instead), so while one is in
    /// flight they're decoded with [`wire::decode_block_segment`] rather
    /// than run through the general [`wire::decode_client_request`]
    /// dispatch, which would otherwise misread the sequence byte as an
    /// unrelated command.
    pub fn on_request(&mut self, dict: &mut Dictionary, data: &[u8; 8]) -> Outcome {
        if self.state == State::BlockDownload {
            let (seq, last, segment) = wire::decode_block_segment(data);
            return self.on_block_download_segment(seq, last, segment);
        }

        let request = match wire::decode_client_request(data) {
            Ok(request) => request,
            Err(code) => return self.abort(code),
        };

        match request {
            ClientRequest::Abort { .. } => {
                self.state = State::Idle;
                self.block_download = None;
                self.block_upload = None;
                Outcome::silent_finish()
            }
            ClientRequest::DownloadInitiate {
                expedited,
                size_indicated,
                n_empty,
                index,
                sub,
                data,
            } => {
                self.index = index;
                self.sub = sub;
                if expedited {
                    debug!("expedited download to {:04X}:{:02X}", index, sub);
                    self.state = State::Idle;
                    let len = 4 - n_empty as usize;
                    match dict.write_raw(index, sub, &data[..len]) {
                        Ok(()) => Outcome::reply(wire::encode_download_initiate_response(index, sub)),
                        Err(code) => self.abort(code),
                    }
                } else {
                    debug!("segmented download to {:04X}:{:02X} starting", index, sub);
                    let announced = size_indicated
                        .then(|| u32::from_le_bytes(data));
                    self.buffer.begin(announced);
                    self.toggle = false;
                    self.state = State::DownloadSegment;
                    Outcome::reply_and_arm(wire::encode_download_initiate_response(index, sub))
                }
            }
            ClientRequest::DownloadSegment {
                toggle,
                last,
                n_empty,
                data,
            } => {
                if self.state != State::DownloadSegment {
                    // A segment arriving outside a download is only an abort
                    // if some other transfer is in flight; in idle it's just
                    // dropped, the client will time out and retry.
                    return if self.state == State::Idle {
                        debug!("dropping download segment received in idle");
                        Outcome::silent_finish()
                    } else {
                        self.abort(AbortCode::NoCs)
                    };
                }
                if toggle != self.toggle {
                    return self.abort(AbortCode::Toggle);
                }
                let len = 7 - n_empty as usize;
                if let Err(code) = self.buffer.append(&data[..len]) {
                    return self.abort(code);
                }
                if last {
                    let bytes = match self.buffer.finalize() {
                        Ok(bytes) => bytes,
                        Err(code) => return self.abort(code),
                    };
                    self.state = State::Idle;
                    if let Err(code) = dict.write_raw(self.index, self.sub, &bytes) {
                        return self.abort(code);
                    }
                    debug!(
                        "segmented download to {:04X}:{:02X} complete ({} bytes)",
                        self.index,
                        self.sub,
                        bytes.len()
                    );
                    self.toggle = !self.toggle;
                    return Outcome::reply_and_finish(wire::encode_download_segment_response(
                        self.toggle,
                    ));
                }
                self.toggle = !self.toggle;
                Outcome::reply_and_arm(wire::encode_download_segment_response(self.toggle))
            }
            ClientRequest::UploadInitiate { index, sub } => {
                self.index = index;
                self.sub = sub;
                let size = match dict.current_size(index, sub) {
                    Ok(size) => size,
                    Err(code) => return self.abort(code),
                };
                if size <= 4 {
                    debug!("expedited upload from {:04X}:{:02X}", index, sub);
                    self.state = State::Idle;
                    match dict.read_raw(index, sub) {
                        Ok(bytes) => Outcome::reply(wire::encode_upload_initiate_expedited(
                            index, sub, &bytes,
                        )),
                        Err(code) => self.abort(code),
                    }
                } else {
                    debug!("segmented upload from {:04X}:{:02X} starting ({} bytes)", index, sub, size);
                    match dict.read_raw(index, sub) {
                        Ok(bytes) => {
                            self.buffer.begin(None);
                            let _ = self.buffer.append(&bytes);
                            self.toggle = false;
                            self.state = State::UploadSegment;
                            Outcome::reply_and_arm(wire::encode_upload_initiate_segmented(
                                index,
                                sub,
                                size as u32,
                            ))
                        }
                        Err(code) => self.abort(code),
                    }
                }
            }
            ClientRequest::UploadSegment { toggle } => {
                if self.state != State::UploadSegment {
                    return if self.state == State::Idle {
                        debug!("dropping upload segment received in idle");
                        Outcome::silent_finish()
                    } else {
                        self.abort(AbortCode::NoCs)
                    };
                }
                if toggle != self.toggle {
                    return self.abort(AbortCode::Toggle);
                }
                let remaining = self.buffer.len();
                let chunk = remaining.min(7);
                let bytes = self.buffer.finalize().unwrap_or_default();
                let (segment, rest) = bytes.split_at(chunk);
                let last = rest.is_empty();
                if !last {
                    self.buffer.begin(None);
                    let _ = self.buffer.append(rest);
                } else {
                    self.state = State::Idle;
                }
                self.toggle = !self.toggle;
                let outcome_frame = wire::encode_upload_segment_response(self.toggle, last, segment);
                if last {
                    Outcome::reply_and_finish(outcome_frame)
                } else {
                    Outcome::reply_and_arm(outcome_frame)
                }
            }
            ClientRequest::BlockDownloadInitiate {
                crc_supported,
                index,
                sub,
                ..
            } => {
                self.index = index;
                self.sub = sub;
                // Segments always carry a full 7 bytes on the wire (the
                // last one zero-padded); the real length is recovered
                // from `n_empty` in the end-of-block frame, so the
                // buffer can't enforce an exact announced size here the
                // way it does for segmented transfer.
                debug!("block download to {:04X}:{:02X} starting", index, sub);
                self.buffer.begin(None);
                let block_size = 127;
                self.block_download = Some(BlockDownloadState {
                    crc_supported,
                    block_size,
                    seq: 0,
                });
                self.state = State::BlockDownload;
                Outcome::reply_and_arm(wire::encode_block_download_initiate_response(
                    crc_supported,
                    index,
                    sub,
                    block_size,
                ))
            }
            ClientRequest::BlockDownloadEnd { n_empty, crc } => {
                if self.state != State::BlockDownloadEnd {
                    return self.abort(AbortCode::NoCs);
                }
                let Some(block) = self.block_download.take() else {
                    return self.abort(AbortCode::NoCs);
                };
                let mut bytes = match self.buffer.finalize() {
                    Ok(bytes) => bytes,
                    Err(code) => return self.abort(code),
                };
                let trim = n_empty as usize;
                if trim > bytes.len() {
                    return self.abort(AbortCode::TypeLen);
                }
                bytes.truncate(bytes.len() - trim);
                if block.crc_supported {
                    let computed = Crc16State::<XMODEM>::calculate(&bytes);
                    if computed != crc {
                        return self.abort(AbortCode::BlkCrc);
                    }
                }
                self.state = State::Idle;
                match dict.write_raw(self.index, self.sub, &bytes) {
                    Ok(()) => {
                        debug!(
                            "block download to {:04X}:{:02X} complete ({} bytes)",
                            self.index,
                            self.sub,
                            bytes.len()
                        );
                        Outcome::reply_and_finish(wire::encode_block_download_end_response())
                    }
                    Err(code) => self.abort(code),
                }
            }
            ClientRequest::BlockUploadInitiate {
                crc_supported,
                index,
                sub,
                block_size,
                ..
            } => {
                self.index = index;
                self.sub = sub;
                let size = match dict.current_size(index, sub) {
                    Ok(size) => size,
                    Err(code) => return self.abort(code),
                };
                let bytes = match dict.read_raw(index, sub) {
                    Ok(bytes) => bytes,
                    Err(code) => return self.abort(code),
                };
                debug!("block upload from {:04X}:{:02X} starting ({} bytes)", index, sub, size);
                self.buffer.begin(None);
                let _ = self.buffer.append(&bytes);
                self.block_upload = Some(BlockUploadState {
                    crc_supported,
                    block_size: block_size.clamp(1, 127),
                    seq: 0,
                    offset: 0,
                });
                self.state = State::BlockUpload;
                Outcome::reply_and_arm(wire::encode_block_upload_initiate_response(
                    crc_supported,
                    index,
                    sub,
                    Some(size as u32),
                ))
            }
            ClientRequest::BlockUploadStart => {
                if self.state != State::BlockUpload {
                    return self.abort(AbortCode::NoCs);
                }
                self.next_upload_segment()
            }
            ClientRequest::BlockUploadAck { ack_seq, block_size } => {
                let Some(block) = self.block_upload.as_mut() else {
                    return self.abort(AbortCode::NoCs);
                };
                if self.state == State::BlockUploadEnd {
                    return self.finish_block_upload();
                }
                block.seq = 0;
                block.block_size = block_size.clamp(1, 127);
                let _ = ack_seq;
                self.next_upload_segment()
            }
            ClientRequest::BlockUploadEndAck => {
                self.state = State::Idle;
                Outcome {
                    reply: None,
                    arm_timeout: false,
                    done: true,
                }
            }
        }
    }

    fn on_block_download_segment(&mut self, seq: u8, last: bool, data: [u8; 7]) -> Outcome {
        let Some(block) = self.block_download.as_mut() else {
            return self.abort(AbortCode::NoCs);
        };
        if seq != block.seq + 1 {
            // Missing segment: ack what we actually got and let the
            // client resend the rest of this sub-block.
            let ack = wire::encode_block_ack(wire::SCS_BLOCK_DOWNLOAD, block.seq, block.block_size);
            return Outcome::reply_and_arm(ack);
        }
        block.seq = seq;
        let block_size = block.block_size;
        if let Err(code) = self.buffer.append(&data) {
            return self.abort(code);
        }
        if last {
            let ack = wire::encode_block_ack(wire::SCS_BLOCK_DOWNLOAD, seq, block_size);
            self.state = State::BlockDownloadEnd;
            return Outcome::reply_and_arm(ack);
        }
        if seq == block_size {
            let ack = wire::encode_block_ack(wire::SCS_BLOCK_DOWNLOAD, seq, block_size);
            if let Some(block) = self.block_download.as_mut() {
                block.seq = 0;
            }
            return Outcome::reply_and_arm(ack);
        }
        Outcome {
            reply: None,
            arm_timeout: true,
            done: false,
        }
    }

    fn next_upload_segment(&mut self) -> Outcome {
        let Some(block) = self.block_upload.as_mut() else {
            return self.abort(AbortCode::NoCs);
        };
        let remaining = self.buffer.len() - block.offset;
        let chunk = remaining.min(7);
        let mut data = [0u8; 7];
        let bytes = self.buffer.finalize().unwrap_or_default();
        data[..chunk].copy_from_slice(&bytes[block.offset..block.offset + chunk]);
        self.buffer.begin(None);
        let _ = self.buffer.append(&bytes);

        block.seq += 1;
        block.offset += chunk;
        let last = block.offset == bytes.len();
        let seq = block.seq;
        let at_block_boundary = seq == block.block_size;

        if last {
            self.state = State::BlockUploadEnd;
        }
        let frame = wire::encode_block_segment(seq, last, &data[..chunk]);
        if last || at_block_boundary {
            Outcome::reply_and_arm(frame)
        } else {
            Outcome {
                reply: Some(frame),
                arm_timeout: false,
                done: false,
            }
        }
    }

    fn finish_block_upload(&mut self) -> Outcome {
        let Some(block) = self.block_upload.take() else {
            return self.abort(AbortCode::NoCs);
        };
        let bytes = self.buffer.finalize().unwrap_or_default();
        let n_empty = ((7 - bytes.len() % 7) % 7) as u8;
        let crc = if block.crc_supported {
            Crc16State::<XMODEM>::calculate(&bytes)
        } else {
            0
        };
        debug!(
            "block upload from {:04X}:{:02X} complete ({} bytes)",
            self.index,
            self.sub,
            bytes.len()
        );
        self.state = State::BlockUploadEnd;
        Outcome::reply_and_arm(wire::encode_block_upload_end_response(n_empty, crc))
    }
}
