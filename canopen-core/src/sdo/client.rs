//! SDO client: drives a download or upload against a
//! remote server. Like [`crate::sdo::server::SdoServer`]
//! this is a plain state machine — whoever routes frames (see
//! `driver.rs`) is responsible for transmitting the frames it returns and
//! for arming/cancelling the transfer's timeout timer.

use crc16::{State as Crc16State, XMODEM};
use log::debug;

use crate::abort::AbortCode;
use crate::sdo::buffer::TransferBuffer;
use crate::sdo::wire::{self, ServerResponse};

/// Invoked when a transfer completes or aborts. `0` means success; for an
/// upload, the assembled bytes are passed too.
pub type ConfirmFn = Box<dyn FnMut(u32, Option<Vec<u8>>) + Send>;

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

/// What the caller should do after starting an operation or feeding the
/// client a response.
#[derive(Debug, Default)]
pub struct Outcome {
    pub reply: Option<[u8; 8]>,
    pub arm_timeout: bool,
    pub done: bool,
}

impl Outcome {
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
    offset: usize,
}

struct BlockUploadState {
    crc_supported: bool,
    block_size: u8,
}

pub struct SdoClient {
    state: State,
    index: u16,
    sub: u8,
    toggle: bool,
    upload_buffer: TransferBuffer,
    download_data: Vec<u8>,
    block_download: Option<BlockDownloadState>,
    block_upload: Option<BlockUploadState>,
    confirm: Option<ConfirmFn>,
}

impl Default for SdoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoClient {
    pub fn new() -> Self {
        SdoClient {
            state: State::Idle,
            index: 0,
            sub: 0,
            toggle: false,
            upload_buffer: TransferBuffer::new(),
            download_data: Vec::new(),
            block_download: None,
            block_upload: None,
            confirm: None,
        }
    }

    fn finish(&mut self, abort_code: u32, bytes: Option<Vec<u8>>) {
        debug!(
            "transfer of {:04X}:{:02X} finished: {:#010X}",
            self.index, self.sub, abort_code
        );
        self.state = State::Idle;
        self.block_download = None;
        self.block_upload = None;
        if let Some(mut confirm) = self.confirm.take() {
            confirm(abort_code, bytes);
        }
    }

    fn abort(&mut self, code: AbortCode) -> Outcome {
        debug!(
            "aborting transfer of {:04X}:{:02X}: {:?}",
            self.index, self.sub, code
        );
        let frame = wire::encode_abort(self.index, self.sub, code.code());
        self.finish(code.code(), None);
        Outcome::reply_and_finish(frame)
    }

    /// Begin a download. Chooses expedited transfer iff the payload fits
    /// in 4 bytes; anything larger than one segment's worth attempts block
    /// transfer first.
    pub fn download(&mut self, index: u16, sub: u8, bytes: &[u8], confirm: ConfirmFn) -> [u8; 8] {
        self.index = index;
        self.sub = sub;
        self.confirm = Some(confirm);
        if bytes.len() <= 4 {
            debug!("expedited download to {:04X}:{:02X}", index, sub);
            self.state = State::Idle;
            let mut padded = [0u8; 4];
            padded[..bytes.len()].copy_from_slice(bytes);
            let n_empty = (4 - bytes.len()) as u8;
            wire::encode_download_initiate(true, true, n_empty, index, sub, &padded)
        } else if bytes.len() > 7 {
            debug!("block download to {:04X}:{:02X} starting ({} bytes)", index, sub, bytes.len());
            self.state = State::BlockDownload;
            self.download_data = bytes.to_vec();
            wire::encode_block_download_initiate_request(true, index, sub, Some(bytes.len() as u32))
        } else {
            debug!("segmented download to {:04X}:{:02X} starting ({} bytes)", index, sub, bytes.len());
            self.state = State::DownloadSegment;
            self.toggle = false;
            self.download_data = bytes.to_vec();
            wire::encode_download_initiate(
                false,
                true,
                0,
                index,
                sub,
                &(bytes.len() as u32).to_le_bytes(),
            )
        }
    }

    /// Begin an upload.
    pub fn upload(&mut self, index: u16, sub: u8, confirm: ConfirmFn) -> [u8; 8] {
        debug!("upload from {:04X}:{:02X} starting", index, sub);
        self.index = index;
        self.sub = sub;
        self.toggle = false;
        self.upload_buffer.begin(None);
        self.confirm = Some(confirm);
        self.state = State::UploadSegment;
        wire::encode_upload_initiate_request(index, sub)
    }

    /// Block-transfer segments within one sub-block are sent back to
    /// back with no per-segment acknowledgement; call this after sending
    /// a segment whose outcome had `arm_timeout: false` to produce the
    /// next one, until an ack is actually expected (`arm_timeout: true`)
    /// or the transfer finishes.
    pub fn pump(&mut self) -> Outcome {
        if self.state == State::BlockDownload {
            self.next_block_download_segment()
        } else {
            Outcome::default()
        }
    }

    /// The transfer's timeout fired: emit an abort frame and confirm with
    /// SDO_AC_TIMEOUT.
    pub fn on_timeout(&mut self) -> [u8; 8] {
        debug!(
            "timeout waiting for server response on {:04X}:{:02X}",
            self.index, self.sub
        );
        let frame = wire::encode_abort(self.index, self.sub, AbortCode::Timeout.code());
        self.finish(AbortCode::Timeout.code(), None);
        frame
    }

    fn next_download_segment(&mut self) -> Outcome {
        let offset = self.upload_buffer.len();
        let data = std::mem::take(&mut self.download_data);
        let remaining = data.len() - offset;
        let chunk = remaining.min(7);
        let last = offset + chunk == data.len();
        let segment = &data[offset..offset + chunk];
        let _ = self.upload_buffer.append(segment);
        let frame = wire::encode_download_segment(self.toggle, last, segment);
        self.download_data = data;
        if last {
            Outcome::reply_and_finish(frame)
        } else {
            Outcome::reply_and_arm(frame)
        }
    }

    fn next_block_download_segment(&mut self) -> Outcome {
        let Some(block) = self.block_download.as_mut() else {
            return self.abort(AbortCode::NoCs);
        };
        let remaining = self.download_data.len() - block.offset;
        let chunk = remaining.min(7);
        let last = block.offset + chunk == self.download_data.len();
        let segment = self.download_data[block.offset..block.offset + chunk].to_vec();
        block.seq += 1;
        block.offset += chunk;
        let seq = block.seq;
        let at_boundary = seq == block.block_size;
        if last {
            self.state = State::BlockDownloadEnd;
        }
        let frame = wire::encode_block_segment(seq, last, &segment);
        if last || at_boundary {
            Outcome::reply_and_arm(frame)
        } else {
            Outcome {
                reply: Some(frame),
                arm_timeout: false,
                done: false,
            }
        }
    }

    fn send_block_download_end(&mut self) -> Outcome {
        let Some(block) = self.block_download.take() else {
            return self.abort(AbortCode::NoCs);
        };
        let n_empty = ((7 - self.download_data.len() % 7) % 7) as u8;
        let crc = if block.crc_supported {
            Crc16State::<XMODEM>::calculate(&self.download_data)
        } else {
            0
        };
        Outcome::reply_and_arm(wire::encode_block_download_end_request(n_empty, crc))
    }

    fn on_block_upload_segment(&mut self, seq: u8, last: bool, segment: [u8; 7]) -> Outcome {
        let Some(block) = self.block_upload.as_ref() else {
            return self.abort(AbortCode::NoCs);
        };
        let _ = self.upload_buffer.append(&segment);
        if last {
            self.state = State::BlockUploadEnd;
            Outcome::reply_and_arm(wire::encode_block_ack(wire::CCS_BLOCK_UPLOAD, seq, 127))
        } else if seq == block.block_size {
            Outcome::reply_and_arm(wire::encode_block_ack(wire::CCS_BLOCK_UPLOAD, seq, 127))
        } else {
            Outcome {
                reply: None,
                arm_timeout: true,
                done: false,
            }
        }
    }

    fn finish_block_upload(&mut self, n_empty: u8, crc: u16) -> Outcome {
        let mut bytes = self.upload_buffer.finalize().unwrap_or_default();
        let trim = n_empty as usize;
        if trim <= bytes.len() {
            bytes.truncate(bytes.len() - trim);
        }
        if let Some(block) = self.block_upload.take() {
            if block.crc_supported {
                let computed = Crc16State::<XMODEM>::calculate(&bytes);
                if computed != crc {
                    let frame = wire::encode_abort(self.index, self.sub, AbortCode::BlkCrc.code());
                    self.finish(AbortCode::BlkCrc.code(), None);
                    return Outcome::reply_and_finish(frame);
                }
            }
        }
        let frame = wire::encode_block_upload_end_ack();
        self.finish(0, Some(bytes));
        Outcome::reply_and_finish(frame)
    }

    /// Feed one incoming server response frame to the client.
    ///
    /// Block-upload data segments carry no command-specifier byte, so
    /// while one is expected they're decoded with
    /// [`wire::decode_block_segment`] instead of the general
    /// [`wire::decode_server_response`] dispatch (mirrors
    /// [`crate::sdo::server::SdoServer::on_request`]'s handling of
    /// block-download segments).
    pub fn on_response(&mut self, data: &[u8; 8]) -> Outcome {
        if self.state == State::BlockUpload {
            let (seq, last, segment) = wire::decode_block_segment(data);
            return self.on_block_upload_segment(seq, last, segment);
        }

        let response = match wire::decode_server_response(data) {
            Ok(response) => response,
            Err(code) => return self.abort(code),
        };

        match response {
            ServerResponse::Abort { abort_code, .. } => {
                self.finish(abort_code, None);
                Outcome::silent_finish()
            }
            ServerResponse::DownloadInitiate { .. } => {
                if self.state == State::DownloadSegment {
                    self.next_download_segment()
                } else {
                    self.finish(0, None);
                    Outcome::silent_finish()
                }
            }
            ServerResponse::DownloadSegment { toggle } => {
                if self.state != State::DownloadSegment || toggle != self.toggle {
                    return self.abort(AbortCode::Toggle);
                }
                self.toggle = !self.toggle;
                if self.upload_buffer.len() == self.download_data.len() {
                    debug!(
                        "segmented download to {:04X}:{:02X} complete ({} bytes)",
                        self.index,
                        self.sub,
                        self.download_data.len()
                    );
                    self.finish(0, None);
                    Outcome::silent_finish()
                } else {
                    self.next_download_segment()
                }
            }
            ServerResponse::UploadInitiateExpedited { n_empty, data, .. } => {
                let len = 4 - n_empty as usize;
                let bytes = data[..len].to_vec();
                self.finish(0, Some(bytes));
                Outcome::silent_finish()
            }
            ServerResponse::UploadInitiateSegmented { size, .. } => {
                debug!(
                    "segmented upload from {:04X}:{:02X} starting ({} bytes)",
                    self.index, self.sub, size
                );
                let frame = wire::encode_upload_segment_request(self.toggle);
                Outcome::reply_and_arm(frame)
            }
            ServerResponse::UploadSegment {
                toggle,
                last,
                n_empty,
                data,
            } => {
                if self.state != State::UploadSegment || toggle != self.toggle {
                    return self.abort(AbortCode::Toggle);
                }
                let len = 7 - n_empty as usize;
                let _ = self.upload_buffer.append(&data[..len]);
                self.toggle = !self.toggle;
                if last {
                    let bytes = self.upload_buffer.finalize().unwrap_or_default();
                    debug!(
                        "segmented upload from {:04X}:{:02X} complete ({} bytes)",
                        self.index,
                        self.sub,
                        bytes.len()
                    );
                    self.finish(0, Some(bytes));
                    Outcome::silent_finish()
                } else {
                    let frame = wire::encode_upload_segment_request(self.toggle);
                    Outcome::reply_and_arm(frame)
                }
            }
            ServerResponse::BlockDownloadInitiate {
                crc_supported,
                block_size,
                ..
            } => {
                if self.state != State::BlockDownload {
                    return self.abort(AbortCode::NoCs);
                }
                self.block_download = Some(BlockDownloadState {
                    crc_supported,
                    block_size,
                    seq: 0,
                    offset: 0,
                });
                self.next_block_download_segment()
            }
            ServerResponse::BlockDownloadAck { block_size, .. } => {
                if self.state == State::BlockDownloadEnd {
                    return self.send_block_download_end();
                }
                let Some(block) = self.block_download.as_mut() else {
                    return self.abort(AbortCode::NoCs);
                };
                block.seq = 0;
                block.block_size = block_size.clamp(1, 127);
                self.next_block_download_segment()
            }
            ServerResponse::BlockDownloadEnd => {
                debug!(
                    "block download to {:04X}:{:02X} complete ({} bytes)",
                    self.index,
                    self.sub,
                    self.download_data.len()
                );
                self.finish(0, None);
                Outcome::silent_finish()
            }
            ServerResponse::BlockUploadInitiate { crc_supported, .. } => {
                debug!("block upload from {:04X}:{:02X} starting", self.index, self.sub);
                self.upload_buffer.begin(None);
                self.block_upload = Some(BlockUploadState {
                    crc_supported,
                    block_size: 127,
                });
                self.state = State::BlockUpload;
                let frame = wire::encode_block_upload_start_request();
                Outcome::reply_and_arm(frame)
            }
            ServerResponse::BlockUploadEnd { n_empty, crc } => self.finish_block_upload(n_empty, crc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn expedited_download_completes_on_response() {
        let mut client = SdoClient::new();
        let result: Rc<RefCell<Option<(u32, Option<Vec<u8>>)>>> = Rc::new(RefCell::new(None));
        let result_cb = result.clone();
        let req = client.download(
            0x2000,
            0x00,
            &[0x34, 0x12],
            Box::new(move |code, bytes| *result_cb.borrow_mut() = Some((code, bytes))),
        );
        let decoded = wire::decode_client_request(&req).unwrap();
        assert_eq!(
            decoded,
            wire::ClientRequest::DownloadInitiate {
                expedited: true,
                size_indicated: true,
                n_empty: 2,
                index: 0x2000,
                sub: 0x00,
                data: [0x34, 0x12, 0, 0],
            }
        );

        let response = wire::encode_download_initiate_response(0x2000, 0x00);
        let outcome = client.on_response(&response);
        assert!(outcome.done);
        assert_eq!(*result.borrow(), Some((0, None)));
    }

    #[test]
    fn segmented_upload_assembles_full_payload() {
        let mut client = SdoClient::new();
        let result: Rc<RefCell<Option<(u32, Option<Vec<u8>>)>>> = Rc::new(RefCell::new(None));
        let result_cb = result.clone();
        let req = client.upload(
            0x2100,
            0x00,
            Box::new(move |code, bytes| *result_cb.borrow_mut() = Some((code, bytes))),
        );
        assert_eq!(
            wire::decode_client_request(&req).unwrap(),
            wire::ClientRequest::UploadInitiate {
                index: 0x2100,
                sub: 0x00
            }
        );

        let init_response = wire::encode_upload_initiate_segmented(0x2100, 0x00, 10);
        let outcome = client.on_response(&init_response);
        assert!(!outcome.done);
        let req1 = wire::decode_client_request(&outcome.reply.unwrap()).unwrap();
        assert_eq!(req1, wire::ClientRequest::UploadSegment { toggle: false });

        let seg1 = wire::encode_upload_segment_response(true, false, b"abcdefg");
        let outcome = client.on_response(&seg1);
        assert!(!outcome.done);

        let seg2 = wire::encode_upload_segment_response(false, true, b"xyz");
        let outcome = client.on_response(&seg2);
        assert!(outcome.done);
        assert_eq!(*result.borrow(), Some((0, Some(b"abcdefgxyz".to_vec()))));
    }

    #[test]
    fn timeout_invokes_confirm_with_timeout_code() {
        let mut client = SdoClient::new();
        let result: Rc<RefCell<Option<u32>>> = Rc::new(RefCell::new(None));
        let result_cb = result.clone();
        client.upload(
            0x2000,
            0x00,
            Box::new(move |code, _| *result_cb.borrow_mut() = Some(code)),
        );
        client.on_timeout();
        assert_eq!(*result.borrow(), Some(AbortCode::Timeout.code()));
    }

    #[test]
    fn block_download_round_trips_through_server() {
        use crate::dictionary::{Access, Object, ObjectKind, SubEntry};
        use crate::sdo::server::SdoServer;
        use crate::value::Value;

        let mut dict = crate::dictionary::Dictionary::new(1, 500_000, 0x0191).unwrap();
        let mut obj = Object::new(0x2100, ObjectKind::Variable, "string");
        obj.insert_sub(SubEntry::new(
            0,
            Access::ReadWrite,
            Value::VisibleString(vec![0; 20]),
        ))
        .unwrap();
        dict.insert_object(obj).unwrap();

        let mut server = SdoServer::new();
        let mut client = SdoClient::new();
        let payload: Vec<u8> = (0..20u8).collect();
        let result: Rc<RefCell<Option<u32>>> = Rc::new(RefCell::new(None));
        let result_cb = result.clone();
        let mut frame = client.download(
            0x2100,
            0x00,
            &payload,
            Box::new(move |code, _| *result_cb.borrow_mut() = Some(code)),
        );

        loop {
            let server_outcome = server.on_request(&mut dict, &frame);
            let client_outcome = match server_outcome.reply {
                Some(reply) => client.on_response(&reply),
                // Interior block segment: server doesn't ack every one,
                // the client just keeps sending until a block boundary.
                None => client.pump(),
            };
            if client_outcome.done {
                break;
            }
            match client_outcome.reply {
                Some(next) => frame = next,
                None => break,
            }
        }

        assert_eq!(*result.borrow(), Some(0));
        assert_eq!(
            dict.read_raw(0x2100, 0x00).unwrap()[..payload.len()],
            payload[..]
        );
    }
}
