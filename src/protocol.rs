//! Codec (spec.md §4.C1): frame, parse, encode, and checksum FIXT.1.1 /
//! FIX 5.0 tag/value messages for the PSX profile.

use crate::error::PsxFixError;
use bytes::{Buf, Bytes, BytesMut};
use chrono::Utc;
use std::collections::HashMap;

/// Start-of-Header byte, the FIX field separator.
pub const SOH: u8 = 0x01;

/// The PSX profile runs over the FIXT.1.1 envelope.
pub const BEGIN_STRING: &str = "FIXT.1.1";

/// Commonly referenced FIX tag numbers, named for readability at call sites.
pub mod tags {
    pub const BEGIN_STRING: u32 = 8;
    pub const BODY_LENGTH: u32 = 9;
    pub const MSG_TYPE: u32 = 35;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const SENDING_TIME: u32 = 52;
    pub const CHECK_SUM: u32 = 10;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const HEART_BT_INT: u32 = 108;
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
    pub const USERNAME: u32 = 553;
    pub const PASSWORD: u32 = 554;
    pub const TEST_REQ_ID: u32 = 112;
    pub const TEXT: u32 = 58;
    pub const ON_BEHALF_OF_COMP_ID: u32 = 115;
    pub const RAW_DATA_LENGTH: u32 = 95;
    pub const RAW_DATA: u32 = 96;
    pub const DEFAULT_APPL_VER_ID: u32 = 1137;
    pub const DEFAULT_CSTM_APPL_VER_ID: u32 = 1408;
    pub const REF_SEQ_NUM: u32 = 45;
    pub const REF_TAG_ID: u32 = 371;
    pub const SESSION_REJECT_REASON: u32 = 373;
    pub const MD_REQ_ID: u32 = 262;
    pub const SUBSCRIPTION_REQUEST_TYPE: u32 = 263;
    pub const MARKET_DEPTH: u32 = 264;
    pub const MD_UPDATE_TYPE: u32 = 265;
    pub const NO_MD_ENTRY_TYPES: u32 = 267;
    pub const MD_ENTRY_TYPE: u32 = 269;
    pub const MD_ENTRY_PX: u32 = 270;
    pub const MD_ENTRY_SIZE: u32 = 271;
    pub const MD_ENTRY_DATE: u32 = 272;
    pub const MD_ENTRY_TIME: u32 = 273;
    pub const NO_RELATED_SYM: u32 = 146;
    pub const SYMBOL: u32 = 55;
    pub const NO_MD_ENTRIES: u32 = 268;
    pub const MD_REJECT_REASON: u32 = 816;
    pub const SECURITY_REQ_ID: u32 = 320;
    pub const SECURITY_LIST_REQUEST_TYPE: u32 = 559;
    pub const PRODUCT: u32 = 460;
    pub const TRADING_SESSION_ID: u32 = 336;
    pub const SECURITY_TYPE: u32 = 167;
    pub const SECURITY_DESC: u32 = 107;
    pub const MARKET_ID: u32 = 1301;
    pub const TRAD_SES_REQ_ID: u32 = 335;
    pub const TRAD_SES_STATUS: u32 = 340;
    pub const START_TIME: u32 = 341;
    pub const END_TIME: u32 = 342;
    pub const TRADING_SESSION_SUB_ID: u32 = 625;
    pub const TRADING_STATUS: u32 = 102;
    pub const PARTY_ID: u32 = 448;
    pub const NO_PARTY_IDS: u32 = 453;
    pub const TRANSACT_TIME: u32 = 60;
}

/// Admin/application message types recognized on this profile (spec.md §4.C3/C4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Logon,
    Logout,
    Heartbeat,
    TestRequest,
    Reject,
    MarketDataRequest,
    MarketDataSnapshotFullRefresh,
    MarketDataIncrementalRefresh,
    MarketDataRequestReject,
    SecurityListRequest,
    SecurityList,
    TradingSessionStatusRequest,
    TradingSessionStatus,
    TradingStatus,
    Other,
}

impl MsgType {
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Logon => "A",
            MsgType::Logout => "5",
            MsgType::Heartbeat => "0",
            MsgType::TestRequest => "1",
            MsgType::Reject => "3",
            MsgType::MarketDataRequest => "V",
            MsgType::MarketDataSnapshotFullRefresh => "W",
            MsgType::MarketDataIncrementalRefresh => "X",
            MsgType::MarketDataRequestReject => "Y",
            MsgType::SecurityListRequest => "x",
            MsgType::SecurityList => "y",
            MsgType::TradingSessionStatusRequest => "g",
            MsgType::TradingSessionStatus => "h",
            MsgType::TradingStatus => "f",
            MsgType::Other => "?",
        }
    }

    pub fn from_str(s: &str) -> MsgType {
        match s {
            "A" => MsgType::Logon,
            "5" => MsgType::Logout,
            "0" => MsgType::Heartbeat,
            "1" => MsgType::TestRequest,
            "3" => MsgType::Reject,
            "V" => MsgType::MarketDataRequest,
            "W" => MsgType::MarketDataSnapshotFullRefresh,
            "X" => MsgType::MarketDataIncrementalRefresh,
            "Y" => MsgType::MarketDataRequestReject,
            "x" => MsgType::SecurityListRequest,
            "y" => MsgType::SecurityList,
            "g" => MsgType::TradingSessionStatusRequest,
            "h" => MsgType::TradingSessionStatus,
            "f" => MsgType::TradingStatus,
            _ => MsgType::Other,
        }
    }
}

/// A parsed inbound FIX message: a flat tag→value map plus the original
/// ordered occurrences, which repeating-group extraction needs to recover
/// group-row boundaries (spec.md §3 "Parsed message").
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub begin_string: String,
    pub msg_type_raw: String,
    pub msg_type: MsgType,
    fields: HashMap<u32, String>,
    raw: Vec<(u32, String)>,
}

impl ParsedMessage {
    pub fn get(&self, tag: u32) -> Option<&str> {
        self.fields.get(&tag).map(|s| s.as_str())
    }

    pub fn get_u32(&self, tag: u32) -> Option<u32> {
        self.get(tag).and_then(|v| v.parse().ok())
    }

    /// Extracts a repeating group keyed by `count_tag`, in wire order.
    /// The delimiter tag (first tag after the count) marks the start of
    /// each row, per spec.md §4.C1's grouping heuristic.
    pub fn group(&self, count_tag: u32) -> Vec<HashMap<u32, String>> {
        let Some(pos) = self.raw.iter().position(|(t, _)| *t == count_tag) else {
            return Vec::new();
        };
        let count: usize = match self.raw[pos].1.parse() {
            Ok(n) => n,
            Err(_) => return Vec::new(),
        };
        if count == 0 || pos + 1 >= self.raw.len() {
            return Vec::new();
        }
        let delimiter_tag = self.raw[pos + 1].0;

        let mut rows = Vec::with_capacity(count);
        let mut current: HashMap<u32, String> = HashMap::new();
        let mut started = false;
        for (tag, value) in &self.raw[pos + 1..] {
            if *tag == delimiter_tag {
                if started {
                    rows.push(std::mem::take(&mut current));
                    if rows.len() == count {
                        break;
                    }
                }
                started = true;
            }
            if started {
                current.insert(*tag, value.clone());
            }
        }
        if rows.len() < count && started {
            rows.push(current);
        }
        rows.truncate(count);
        rows
    }
}

fn compute_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Builds one ordered, checksummed, body-length-correct FIX frame.
///
/// `body` must already be in the desired wire order; the mandatory header
/// fields (spec.md §3) are prepended and the trailer appended here.
pub fn encode(
    msg_type: MsgType,
    seq_num: u32,
    sender_comp_id: &str,
    target_comp_id: &str,
    body: &[(u32, String)],
) -> Bytes {
    let sending_time = Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string();

    let mut fields: Vec<(u32, String)> = Vec::with_capacity(body.len() + 5);
    fields.push((tags::MSG_TYPE, msg_type.as_str().to_string()));
    fields.push((tags::SENDER_COMP_ID, sender_comp_id.to_string()));
    fields.push((tags::TARGET_COMP_ID, target_comp_id.to_string()));
    fields.push((tags::MSG_SEQ_NUM, seq_num.to_string()));
    fields.push((tags::SENDING_TIME, sending_time));
    fields.extend_from_slice(body);

    let mut body_bytes = Vec::new();
    for (tag, value) in &fields {
        body_bytes.extend_from_slice(format!("{tag}={value}").as_bytes());
        body_bytes.push(SOH);
    }

    let mut out = Vec::with_capacity(body_bytes.len() + 32);
    out.extend_from_slice(format!("{}={}", tags::BEGIN_STRING, BEGIN_STRING).as_bytes());
    out.push(SOH);
    out.extend_from_slice(format!("{}={}", tags::BODY_LENGTH, body_bytes.len()).as_bytes());
    out.push(SOH);
    out.extend_from_slice(&body_bytes);

    let checksum = compute_checksum(&out) as u32 % 256;
    out.extend_from_slice(format!("{}={:03}", tags::CHECK_SUM, checksum).as_bytes());
    out.push(SOH);

    Bytes::from(out)
}

/// Outcome of scanning the rolling inbound buffer for the next frame
/// (spec.md §4.C1 Framer).
pub enum FrameResult {
    /// Not enough bytes buffered yet for a complete frame.
    Incomplete,
    /// A well-formed frame was extracted and consumed from the buffer.
    Frame(Bytes),
    /// A malformed region was consumed from the buffer; the caller should
    /// log `reason` and keep polling for the next frame.
    Skipped(String),
}

/// Scans `buf` for the next FIX frame, tolerating partial reads, multiple
/// frames per read, and garbage preceding a `BeginString`. Never panics on
/// malformed input; always makes forward progress when bytes are consumed.
pub fn next_frame(buf: &mut BytesMut) -> FrameResult {
    if buf.is_empty() {
        return FrameResult::Incomplete;
    }

    let data: &[u8] = buf.as_ref();
    let start = match memchr::memmem::find(data, b"8=") {
        Some(0) => 0,
        Some(p) => {
            buf.advance(p);
            return FrameResult::Skipped(format!("{p} bytes of garbage preceding BeginString"));
        }
        None => return FrameResult::Incomplete,
    };

    let data: &[u8] = buf.as_ref();
    let Some(begin_end) = memchr::memchr(SOH, &data[start..]) else {
        return FrameResult::Incomplete;
    };
    let begin_end = start + begin_end;

    let nine_start = begin_end + 1;
    if nine_start + 2 > data.len() {
        return FrameResult::Incomplete;
    }
    if &data[nine_start..nine_start + 2] != b"9=" {
        buf.advance(start + 1);
        return FrameResult::Skipped("missing BodyLength field after BeginString".to_string());
    }
    let Some(nine_end) = memchr::memchr(SOH, &data[nine_start..]) else {
        return FrameResult::Incomplete;
    };
    let nine_end = nine_start + nine_end;

    let body_len_str = match std::str::from_utf8(&data[nine_start + 2..nine_end]) {
        Ok(s) => s,
        Err(_) => {
            buf.advance(start + 1);
            return FrameResult::Skipped("non-utf8 BodyLength field".to_string());
        }
    };
    let body_len: usize = match body_len_str.parse() {
        Ok(n) => n,
        Err(_) => {
            let msg = format!("invalid BodyLength value {body_len_str:?}");
            buf.advance(start + 1);
            return FrameResult::Skipped(msg);
        }
    };

    let body_start = nine_end + 1;
    let trailer_start = body_start + body_len;
    let total_len = trailer_start + 7; // "10=" + 3 digits + SOH
    if total_len > data.len() {
        return FrameResult::Incomplete;
    }

    if &data[trailer_start..trailer_start + 3] != b"10=" || data[total_len - 1] != SOH {
        // BodyLength lied about the frame extent; resync on the next BeginString.
        buf.advance(start + 1);
        return FrameResult::Skipped("BodyLength does not locate a CheckSum trailer".to_string());
    }

    let checksum_str = match std::str::from_utf8(&data[trailer_start + 3..total_len - 1]) {
        Ok(s) => s,
        Err(_) => {
            buf.advance(total_len);
            return FrameResult::Skipped("non-utf8 CheckSum field".to_string());
        }
    };
    let expected_checksum: u32 = match checksum_str.parse() {
        Ok(n) => n,
        Err(_) => {
            let msg = format!("invalid CheckSum value {checksum_str:?}");
            buf.advance(total_len);
            return FrameResult::Skipped(msg);
        }
    };
    let actual_checksum = compute_checksum(&data[..trailer_start]) as u32 % 256;

    let frame = Bytes::copy_from_slice(&data[..total_len]);
    buf.advance(total_len);

    if actual_checksum != expected_checksum {
        return FrameResult::Skipped(format!(
            "checksum mismatch: header={expected_checksum:03} computed={actual_checksum:03}"
        ));
    }

    FrameResult::Frame(frame)
}

/// Parses one complete, already-extracted FIX frame into a [`ParsedMessage`].
/// Assumes `frame` passed [`next_frame`]'s structural checks.
pub fn decode(frame: &[u8]) -> Result<ParsedMessage, PsxFixError> {
    if !frame.ends_with(&[SOH]) {
        return Err(PsxFixError::Frame("frame must end with SOH".into()));
    }
    let without_trailer_soh = &frame[..frame.len() - 1];
    let segments: Vec<&[u8]> = without_trailer_soh.split(|b| *b == SOH).collect();

    let mut raw: Vec<(u32, String)> = Vec::with_capacity(segments.len());
    for seg in &segments {
        let s =
            std::str::from_utf8(seg).map_err(|_| PsxFixError::Frame("non-utf8 field".into()))?;
        let mut it = s.splitn(2, '=');
        let tag_str = it
            .next()
            .ok_or_else(|| PsxFixError::Frame("missing tag".into()))?;
        let value = it
            .next()
            .ok_or_else(|| PsxFixError::Frame(format!("field {tag_str:?} missing value")))?;
        let tag: u32 = tag_str
            .parse()
            .map_err(|_| PsxFixError::Frame(format!("non-numeric tag {tag_str:?}")))?;
        raw.push((tag, value.to_string()));
    }

    let mut fields: HashMap<u32, String> = HashMap::with_capacity(raw.len());
    for (tag, value) in &raw {
        fields.insert(*tag, value.clone());
    }

    let begin_string = fields
        .get(&tags::BEGIN_STRING)
        .cloned()
        .ok_or_else(|| PsxFixError::Protocol("missing BeginString(8)".into()))?;
    let msg_type_raw = fields
        .get(&tags::MSG_TYPE)
        .cloned()
        .ok_or_else(|| PsxFixError::Protocol("missing MsgType(35)".into()))?;
    let msg_type = MsgType::from_str(&msg_type_raw);

    fields.remove(&tags::BEGIN_STRING);
    fields.remove(&tags::BODY_LENGTH);
    fields.remove(&tags::CHECK_SUM);

    Ok(ParsedMessage {
        begin_string,
        msg_type_raw,
        msg_type,
        fields,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg_type: MsgType, seq: u32, body: &[(u32, &str)]) -> ParsedMessage {
        let body: Vec<(u32, String)> = body.iter().map(|(t, v)| (*t, v.to_string())).collect();
        let bytes = encode(msg_type, seq, "realtime", "NMDUFISQ0001", &body);
        decode(&bytes).unwrap()
    }

    #[test]
    fn p2_checksum_is_self_consistent() {
        let bytes = encode(MsgType::Heartbeat, 7, "realtime", "NMDUFISQ0001", &[]);
        let s = std::str::from_utf8(&bytes).unwrap();
        let trailer_idx = s.rfind("10=").unwrap();
        let expected: u32 = s[trailer_idx + 3..trailer_idx + 6].parse().unwrap();
        let actual = compute_checksum(&bytes[..trailer_idx]) as u32 % 256;
        assert_eq!(expected, actual);
    }

    #[test]
    fn p3_body_length_is_exact_byte_count() {
        let bytes = encode(MsgType::Logon, 1, "realtime", "NMDUFISQ0001", &[]);
        let s = std::str::from_utf8(&bytes).unwrap();
        let nine = s.find("9=").unwrap();
        let soh_after_nine = s[nine..].find('\u{1}').unwrap() + nine;
        let declared: usize = s[nine + 2..soh_after_nine].parse().unwrap();
        let ten = s.rfind("10=").unwrap();
        assert_eq!(declared, ten - (soh_after_nine + 1));
    }

    #[test]
    fn p1_encode_decode_round_trip_preserves_fields() {
        let parsed = roundtrip(MsgType::TestRequest, 3, &[(112, "abc-123")]);
        assert_eq!(parsed.get(tags::TEST_REQ_ID), Some("abc-123"));
        assert_eq!(parsed.get_u32(tags::MSG_SEQ_NUM), Some(3));
        assert_eq!(parsed.msg_type, MsgType::TestRequest);
    }

    #[test]
    fn partial_frames_yield_same_result_as_whole_stream() {
        let bytes = encode(MsgType::Heartbeat, 1, "A", "B", &[]);
        let mut whole = BytesMut::from(&bytes[..]);
        let one = match next_frame(&mut whole) {
            FrameResult::Frame(f) => f,
            _ => panic!("expected frame"),
        };

        for split in 1..bytes.len() {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&bytes[..split]);
            let first = next_frame(&mut buf);
            assert!(matches!(first, FrameResult::Incomplete));
            buf.extend_from_slice(&bytes[split..]);
            let second = match next_frame(&mut buf) {
                FrameResult::Frame(f) => f,
                FrameResult::Incomplete => panic!("split at {split} left frame incomplete"),
                FrameResult::Skipped(reason) => {
                    panic!("split at {split} reported malformed frame: {reason}")
                }
            };
            assert_eq!(second, one);
        }
    }

    #[test]
    fn malformed_frame_between_two_valid_frames_both_survive() {
        let good1 = encode(MsgType::Heartbeat, 1, "A", "B", &[]);
        let good2 = encode(MsgType::Heartbeat, 2, "A", "B", &[]);
        let mut corrupt = encode(MsgType::TestRequest, 1, "A", "B", &[(112, "x".into())]).to_vec();
        // Flip a body byte so the frame extent is still consistent but the checksum fails.
        let idx = corrupt.iter().position(|&b| b == b'x').unwrap();
        corrupt[idx] = b'y';

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&good1);
        buf.extend_from_slice(&corrupt);
        buf.extend_from_slice(&good2);

        let first = match next_frame(&mut buf) {
            FrameResult::Frame(f) => f,
            _ => panic!("expected first valid frame"),
        };
        assert_eq!(first, good1);

        let skipped = next_frame(&mut buf);
        assert!(matches!(skipped, FrameResult::Skipped(_)));

        let third = match next_frame(&mut buf) {
            FrameResult::Frame(f) => f,
            _ => panic!("expected trailing valid frame to survive"),
        };
        assert_eq!(third, good2);
    }

    #[test]
    fn group_extraction_preserves_row_order() {
        let body = vec![
            (tags::SYMBOL, "LUCK".to_string()),
            (tags::NO_MD_ENTRIES, "2".to_string()),
            (tags::MD_ENTRY_TYPE, "0".to_string()),
            (tags::MD_ENTRY_PX, "100.5".to_string()),
            (tags::MD_ENTRY_SIZE, "10".to_string()),
            (tags::MD_ENTRY_TYPE, "1".to_string()),
            (tags::MD_ENTRY_PX, "100.6".to_string()),
            (tags::MD_ENTRY_SIZE, "8".to_string()),
        ];
        let bytes = encode(MsgType::MarketDataSnapshotFullRefresh, 4, "A", "B", &body);
        let parsed = decode(&bytes).unwrap();
        let rows = parsed.group(tags::NO_MD_ENTRIES);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get(&tags::MD_ENTRY_PX).unwrap(), "100.5");
        assert_eq!(rows[1].get(&tags::MD_ENTRY_PX).unwrap(), "100.6");
    }

    #[test]
    fn security_list_group_deduplicates_by_symbol_order() {
        let body = vec![
            (tags::SECURITY_REQ_ID, "id-1".to_string()),
            (tags::PRODUCT, "4".to_string()),
            (tags::NO_RELATED_SYM, "2".to_string()),
            (tags::SYMBOL, "LUCK".to_string()),
            (tags::SECURITY_TYPE, "CS".to_string()),
            (tags::SYMBOL, "OGDC".to_string()),
            (tags::SECURITY_TYPE, "CS".to_string()),
        ];
        let bytes = encode(MsgType::SecurityList, 5, "A", "B", &body);
        let parsed = decode(&bytes).unwrap();
        let rows = parsed.group(tags::NO_RELATED_SYM);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get(&tags::SYMBOL).unwrap(), "LUCK");
        assert_eq!(rows[1].get(&tags::SYMBOL).unwrap(), "OGDC");
    }
}
