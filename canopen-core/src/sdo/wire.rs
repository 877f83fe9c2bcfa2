//! SDO command-specifier byte layout and frame encode/decode.
//!
//! Every SDO frame is 8 bytes; byte 0's top 3 bits are the command
//! specifier (`ccs` client→server, `scs` server→client), the rest encode
//! expedited/size/toggle/last/ack bits depending on the command. Block
//! transfer sub-commands (the bottom 2 bits when `cs` is 5 or 6) are not
//! pinned exactly by CiA 301 text, so this module documents the specific
//! layout it uses next to each encoder (see DESIGN.md).

use crate::abort::AbortCode;

pub const CCS_DOWNLOAD_SEGMENT: u8 = 0;
pub const CCS_DOWNLOAD_INITIATE: u8 = 1;
pub const CCS_UPLOAD_INITIATE: u8 = 2;
pub const CCS_UPLOAD_SEGMENT: u8 = 3;
pub const CS_ABORT: u8 = 4;
pub const CCS_BLOCK_UPLOAD: u8 = 5;
pub const CCS_BLOCK_DOWNLOAD: u8 = 6;

pub const SCS_UPLOAD_SEGMENT: u8 = 0;
pub const SCS_UPLOAD_INITIATE: u8 = 2;
pub const SCS_DOWNLOAD_SEGMENT: u8 = 1;
pub const SCS_DOWNLOAD_INITIATE: u8 = 3;
pub const SCS_BLOCK_UPLOAD: u8 = 6;
pub const SCS_BLOCK_DOWNLOAD: u8 = 5;

/// Block sub-command, carried in bits 1..0 of byte 0 when `cs` is a block
/// command.
const BLOCK_SS_INITIATE: u8 = 0;
const BLOCK_SS_END: u8 = 1;
const BLOCK_SS_ACK: u8 = 2;
const BLOCK_SS_START: u8 = 3;

fn cs(byte: u8) -> u8 {
    byte >> 5
}

fn mux(index: u16, sub: u8) -> [u8; 3] {
    let idx = index.to_le_bytes();
    [idx[0], idx[1], sub]
}

fn read_index(data: &[u8]) -> u16 {
    u16::from_le_bytes([data[1], data[2]])
}

/// A request frame sent client → server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    DownloadInitiate {
        expedited: bool,
        size_indicated: bool,
        n_empty: u8,
        index: u16,
        sub: u8,
        data: [u8; 4],
    },
    DownloadSegment {
        toggle: bool,
        last: bool,
        n_empty: u8,
        data: [u8; 7],
    },
    UploadInitiate {
        index: u16,
        sub: u8,
    },
    UploadSegment {
        toggle: bool,
    },
    BlockDownloadInitiate {
        crc_supported: bool,
        size_indicated: bool,
        index: u16,
        sub: u8,
        size: Option<u32>,
    },
    BlockDownloadEnd {
        n_empty: u8,
        crc: u16,
    },
    BlockUploadInitiate {
        crc_supported: bool,
        index: u16,
        sub: u8,
        block_size: u8,
        pst: u8,
    },
    BlockUploadStart,
    BlockUploadAck {
        ack_seq: u8,
        block_size: u8,
    },
    BlockUploadEndAck,
    Abort {
        index: u16,
        sub: u8,
        abort_code: u32,
    },
}

/// A response frame sent server → client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerResponse {
    DownloadInitiate {
        index: u16,
        sub: u8,
    },
    DownloadSegment {
        toggle: bool,
    },
    UploadInitiateExpedited {
        size_indicated: bool,
        n_empty: u8,
        index: u16,
        sub: u8,
        data: [u8; 4],
    },
    UploadInitiateSegmented {
        index: u16,
        sub: u8,
        size: u32,
    },
    UploadSegment {
        toggle: bool,
        last: bool,
        n_empty: u8,
        data: [u8; 7],
    },
    BlockDownloadInitiate {
        crc_supported: bool,
        index: u16,
        sub: u8,
        block_size: u8,
    },
    BlockDownloadAck {
        ack_seq: u8,
        block_size: u8,
    },
    BlockDownloadEnd,
    BlockUploadInitiate {
        crc_supported: bool,
        size_indicated: bool,
        index: u16,
        sub: u8,
        size: Option<u32>,
    },
    BlockUploadEnd {
        n_empty: u8,
        crc: u16,
    },
    Abort {
        index: u16,
        sub: u8,
        abort_code: u32,
    },
}

pub fn decode_client_request(data: &[u8; 8]) -> Result<ClientRequest, AbortCode> {
    match cs(data[0]) {
        CCS_DOWNLOAD_SEGMENT => {
            let toggle = data[0] & 0x10 != 0;
            let n_empty = (data[0] >> 1) & 0x07;
            let last = data[0] & 0x01 != 0;
            let mut segment = [0u8; 7];
            segment.copy_from_slice(&data[1..8]);
            Ok(ClientRequest::DownloadSegment {
                toggle,
                last,
                n_empty,
                data: segment,
            })
        }
        CCS_DOWNLOAD_INITIATE => {
            let expedited = data[0] & 0x02 != 0;
            let size_indicated = data[0] & 0x01 != 0;
            let n_empty = (data[0] >> 2) & 0x03;
            let mut payload = [0u8; 4];
            payload.copy_from_slice(&data[4..8]);
            Ok(ClientRequest::DownloadInitiate {
                expedited,
                size_indicated,
                n_empty,
                index: read_index(data),
                sub: data[3],
                data: payload,
            })
        }
        CCS_UPLOAD_INITIATE => Ok(ClientRequest::UploadInitiate {
            index: read_index(data),
            sub: data[3],
        }),
        CCS_UPLOAD_SEGMENT => Ok(ClientRequest::UploadSegment {
            toggle: data[0] & 0x10 != 0,
        }),
        CS_ABORT => Ok(ClientRequest::Abort {
            index: read_index(data),
            sub: data[3],
            abort_code: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        }),
        CCS_BLOCK_DOWNLOAD => match data[0] & 0x03 {
            BLOCK_SS_INITIATE => {
                let crc_supported = data[0] & 0x04 != 0;
                let size_indicated = data[0] & 0x02 != 0;
                let size = size_indicated
                    .then(|| u32::from_le_bytes([data[4], data[5], data[6], data[7]]));
                Ok(ClientRequest::BlockDownloadInitiate {
                    crc_supported,
                    size_indicated,
                    index: read_index(data),
                    sub: data[3],
                    size,
                })
            }
            BLOCK_SS_END => Ok(ClientRequest::BlockDownloadEnd {
                n_empty: (data[0] >> 2) & 0x07,
                crc: u16::from_le_bytes([data[1], data[2]]),
            }),
            _ => Err(AbortCode::NoCs),
        },
        CCS_BLOCK_UPLOAD => match data[0] & 0x03 {
            BLOCK_SS_INITIATE => Ok(ClientRequest::BlockUploadInitiate {
                crc_supported: data[0] & 0x04 != 0,
                index: read_index(data),
                sub: data[3],
                block_size: data[4],
                pst: data[5],
            }),
            BLOCK_SS_START => Ok(ClientRequest::BlockUploadStart),
            BLOCK_SS_ACK => Ok(ClientRequest::BlockUploadAck {
                ack_seq: data[1],
                block_size: data[2],
            }),
            BLOCK_SS_END => Ok(ClientRequest::BlockUploadEndAck),
            _ => Err(AbortCode::NoCs),
        },
        _ => Err(AbortCode::NoCs),
    }
}

/// A raw block-transfer data segment (no command-specifier byte; the seq
/// number occupies the low 7 bits of byte 0 with the last-segment flag in
/// the top bit). Decoded separately from [`decode_client_request`]/
/// [`decode_server_response`] since the state machine only expects this
/// shape while a block sub-transfer is in flight.
pub fn decode_block_segment(data: &[u8; 8]) -> (u8, bool, [u8; 7]) {
    let seq = data[0] & 0x7F;
    let last = data[0] & 0x80 != 0;
    let mut segment = [0u8; 7];
    segment.copy_from_slice(&data[1..8]);
    (seq, last, segment)
}

pub fn decode_server_response(data: &[u8; 8]) -> Result<ServerResponse, AbortCode> {
    match cs(data[0]) {
        SCS_DOWNLOAD_INITIATE => Ok(ServerResponse::DownloadInitiate {
            index: read_index(data),
            sub: data[3],
        }),
        SCS_DOWNLOAD_SEGMENT => Ok(ServerResponse::DownloadSegment {
            toggle: data[0] & 0x10 != 0,
        }),
        SCS_UPLOAD_INITIATE => {
            let expedited = data[0] & 0x02 != 0;
            let size_indicated = data[0] & 0x01 != 0;
            if expedited {
                let n_empty = (data[0] >> 2) & 0x03;
                let mut payload = [0u8; 4];
                payload.copy_from_slice(&data[4..8]);
                Ok(ServerResponse::UploadInitiateExpedited {
                    size_indicated,
                    n_empty,
                    index: read_index(data),
                    sub: data[3],
                    data: payload,
                })
            } else {
                Ok(ServerResponse::UploadInitiateSegmented {
                    index: read_index(data),
                    sub: data[3],
                    size: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
                })
            }
        }
        SCS_UPLOAD_SEGMENT => {
            let toggle = data[0] & 0x10 != 0;
            let n_empty = (data[0] >> 1) & 0x07;
            let last = data[0] & 0x01 != 0;
            let mut segment = [0u8; 7];
            segment.copy_from_slice(&data[1..8]);
            Ok(ServerResponse::UploadSegment {
                toggle,
                last,
                n_empty,
                data: segment,
            })
        }
        CS_ABORT => Ok(ServerResponse::Abort {
            index: read_index(data),
            sub: data[3],
            abort_code: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        }),
        SCS_BLOCK_DOWNLOAD => match data[0] & 0x03 {
            BLOCK_SS_INITIATE => Ok(ServerResponse::BlockDownloadInitiate {
                crc_supported: data[0] & 0x04 != 0,
                index: read_index(data),
                sub: data[3],
                block_size: data[4],
            }),
            BLOCK_SS_ACK => Ok(ServerResponse::BlockDownloadAck {
                ack_seq: data[1],
                block_size: data[2],
            }),
            BLOCK_SS_END => Ok(ServerResponse::BlockDownloadEnd),
            _ => Err(AbortCode::NoCs),
        },
        SCS_BLOCK_UPLOAD => match data[0] & 0x03 {
            BLOCK_SS_INITIATE => {
                let crc_supported = data[0] & 0x04 != 0;
                let size_indicated = data[0] & 0x02 != 0;
                let size = size_indicated
                    .then(|| u32::from_le_bytes([data[4], data[5], data[6], data[7]]));
                Ok(ServerResponse::BlockUploadInitiate {
                    crc_supported,
                    size_indicated,
                    index: read_index(data),
                    sub: data[3],
                    size,
                })
            }
            BLOCK_SS_END => Ok(ServerResponse::BlockUploadEnd {
                n_empty: (data[0] >> 2) & 0x07,
                crc: u16::from_le_bytes([data[1], data[2]]),
            }),
            _ => Err(AbortCode::NoCs),
        },
        _ => Err(AbortCode::NoCs),
    }
}

pub fn encode_download_initiate(
    expedited: bool,
    size_indicated: bool,
    n_empty: u8,
    index: u16,
    sub: u8,
    data: &[u8],
) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (CCS_DOWNLOAD_INITIATE << 5)
        | (n_empty << 2)
        | ((expedited as u8) << 1)
        | size_indicated as u8;
    out[1..4].copy_from_slice(&mux(index, sub));
    out[4..4 + data.len()].copy_from_slice(data);
    out
}

pub fn encode_download_initiate_response(index: u16, sub: u8) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = SCS_DOWNLOAD_INITIATE << 5;
    out[1..4].copy_from_slice(&mux(index, sub));
    out
}

pub fn encode_download_segment(toggle: bool, last: bool, data: &[u8]) -> [u8; 8] {
    let n_empty = (7 - data.len()) as u8;
    let mut out = [0u8; 8];
    out[0] = (CCS_DOWNLOAD_SEGMENT << 5) | ((toggle as u8) << 4) | (n_empty << 1) | last as u8;
    out[1..1 + data.len()].copy_from_slice(data);
    out
}

pub fn encode_download_segment_response(toggle: bool) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (SCS_DOWNLOAD_SEGMENT << 5) | ((toggle as u8) << 4);
    out
}

pub fn encode_upload_initiate_request(index: u16, sub: u8) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = CCS_UPLOAD_INITIATE << 5;
    out[1..4].copy_from_slice(&mux(index, sub));
    out
}

pub fn encode_upload_initiate_expedited(index: u16, sub: u8, data: &[u8]) -> [u8; 8] {
    let n_empty = (4 - data.len()) as u8;
    let mut out = [0u8; 8];
    out[0] = (SCS_UPLOAD_INITIATE << 5) | (n_empty << 2) | 0x02 | 0x01;
    out[1..4].copy_from_slice(&mux(index, sub));
    out[4..4 + data.len()].copy_from_slice(data);
    out
}

pub fn encode_upload_initiate_segmented(index: u16, sub: u8, size: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (SCS_UPLOAD_INITIATE << 5) | 0x01;
    out[1..4].copy_from_slice(&mux(index, sub));
    out[4..8].copy_from_slice(&size.to_le_bytes());
    out
}

pub fn encode_upload_segment_request(toggle: bool) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (CCS_UPLOAD_SEGMENT << 5) | ((toggle as u8) << 4);
    out
}

pub fn encode_upload_segment_response(toggle: bool, last: bool, data: &[u8]) -> [u8; 8] {
    let n_empty = (7 - data.len()) as u8;
    let mut out = [0u8; 8];
    out[0] = (SCS_UPLOAD_SEGMENT << 5) | ((toggle as u8) << 4) | (n_empty << 1) | last as u8;
    out[1..1 + data.len()].copy_from_slice(data);
    out
}

pub fn encode_abort(index: u16, sub: u8, abort_code: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = CS_ABORT << 5;
    out[1..4].copy_from_slice(&mux(index, sub));
    out[4..8].copy_from_slice(&abort_code.to_le_bytes());
    out
}

pub fn encode_block_download_initiate_request(
    crc_supported: bool,
    index: u16,
    sub: u8,
    size: Option<u32>,
) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (CCS_BLOCK_DOWNLOAD << 5)
        | ((crc_supported as u8) << 2)
        | ((size.is_some() as u8) << 1)
        | BLOCK_SS_INITIATE;
    out[1..4].copy_from_slice(&mux(index, sub));
    if let Some(size) = size {
        out[4..8].copy_from_slice(&size.to_le_bytes());
    }
    out
}

pub fn encode_block_download_initiate_response(
    crc_supported: bool,
    index: u16,
    sub: u8,
    block_size: u8,
) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (SCS_BLOCK_DOWNLOAD << 5) | ((crc_supported as u8) << 2) | BLOCK_SS_INITIATE;
    out[1..4].copy_from_slice(&mux(index, sub));
    out[4] = block_size;
    out
}

pub fn encode_block_segment(seq: u8, last: bool, data: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (seq & 0x7F) | ((last as u8) << 7);
    out[1..1 + data.len()].copy_from_slice(data);
    out
}

pub fn encode_block_ack(direction_cs: u8, ack_seq: u8, block_size: u8) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (direction_cs << 5) | BLOCK_SS_ACK;
    out[1] = ack_seq;
    out[2] = block_size;
    out
}

pub fn encode_block_download_end_request(n_empty: u8, crc: u16) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (CCS_BLOCK_DOWNLOAD << 5) | (n_empty << 2) | BLOCK_SS_END;
    out[1..3].copy_from_slice(&crc.to_le_bytes());
    out
}

pub fn encode_block_download_end_response() -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (SCS_BLOCK_DOWNLOAD << 5) | BLOCK_SS_END;
    out
}

pub fn encode_block_upload_initiate_request(
    crc_supported: bool,
    index: u16,
    sub: u8,
    block_size: u8,
    pst: u8,
) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (CCS_BLOCK_UPLOAD << 5) | ((crc_supported as u8) << 2) | BLOCK_SS_INITIATE;
    out[1..4].copy_from_slice(&mux(index, sub));
    out[4] = block_size;
    out[5] = pst;
    out
}

pub fn encode_block_upload_initiate_response(
    crc_supported: bool,
    index: u16,
    sub: u8,
    size: Option<u32>,
) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (SCS_BLOCK_UPLOAD << 5)
        | ((crc_supported as u8) << 2)
        | ((size.is_some() as u8) << 1)
        | BLOCK_SS_INITIATE;
    out[1..4].copy_from_slice(&mux(index, sub));
    if let Some(size) = size {
        out[4..8].copy_from_slice(&size.to_le_bytes());
    }
    out
}

pub fn encode_block_upload_start_request() -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (CCS_BLOCK_UPLOAD << 5) | BLOCK_SS_START;
    out
}

pub fn encode_block_upload_end_response(n_empty: u8, crc: u16) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (SCS_BLOCK_UPLOAD << 5) | (n_empty << 2) | BLOCK_SS_END;
    out[1..3].copy_from_slice(&crc.to_le_bytes());
    out
}

pub fn encode_block_upload_end_ack() -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (CCS_BLOCK_UPLOAD << 5) | BLOCK_SS_END;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expedited_download_round_trips() {
        let frame = encode_download_initiate(true, true, 2, 0x2000, 0x00, &[0x34, 0x12, 0, 0]);
        let decoded = decode_client_request(&frame).unwrap();
        assert_eq!(
            decoded,
            ClientRequest::DownloadInitiate {
                expedited: true,
                size_indicated: true,
                n_empty: 2,
                index: 0x2000,
                sub: 0x00,
                data: [0x34, 0x12, 0, 0],
            }
        );
    }

    #[test]
    fn segmented_upload_response_round_trips() {
        let payload = b"quickfx";
        let frame = encode_upload_segment_response(true, true, payload);
        let decoded = decode_server_response(&frame).unwrap();
        assert_eq!(
            decoded,
            ServerResponse::UploadSegment {
                toggle: true,
                last: true,
                n_empty: 0,
                data: *payload,
            }
        );
    }

    #[test]
    fn abort_frame_round_trips() {
        let frame = encode_abort(0x1018, 0x01, AbortCode::NoWrite.code());
        let decoded = decode_client_request(&frame).unwrap();
        assert_eq!(
            decoded,
            ClientRequest::Abort {
                index: 0x1018,
                sub: 0x01,
                abort_code: AbortCode::NoWrite.code(),
            }
        );
    }

    #[test]
    fn block_download_initiate_round_trips() {
        let frame = encode_block_download_initiate_request(true, 0x2100, 0x00, Some(47));
        let decoded = decode_client_request(&frame).unwrap();
        assert_eq!(
            decoded,
            ClientRequest::BlockDownloadInitiate {
                crc_supported: true,
                size_indicated: true,
                index: 0x2100,
                sub: 0x00,
                size: Some(47),
            }
        );
    }

    #[test]
    fn block_segment_round_trips() {
        let frame = encode_block_segment(5, true, &[1, 2, 3]);
        let (seq, last, data) = decode_block_segment(&frame);
        assert_eq!(seq, 5);
        assert!(last);
        assert_eq!(&data[..3], &[1, 2, 3]);
    }
}
