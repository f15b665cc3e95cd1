//! Per-inbound-MsgType semantic extraction (spec.md §4.C4).
//!
//! Handlers are pure functions over a [`ParsedMessage`]: they never touch the
//! socket, the event sink, or the sequence manager directly. The dispatcher
//! translates a handler's [`HandlerOutcome`] into event-sink sends and, where
//! flagged, session recovery (spec.md §7: "handlers never throw out of the
//! dispatcher").

use crate::protocol::{tags, ParsedMessage};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// One row of a MarketDataSnapshotFullRefresh/IncrementalRefresh entry group.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketDataItem {
    pub entry_type: Option<String>,
    pub price: Option<f64>,
    pub size: Option<f64>,
    pub date: Option<String>,
    pub time: Option<String>,
}

/// One row of a SecurityList's NoRelatedSym group.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityListEntry {
    pub symbol: String,
    pub security_type: Option<String>,
    pub security_desc: Option<String>,
    pub market_id: Option<String>,
}

/// TradingSessionStatus, with the fallback policy of spec.md §4.C4 already
/// applied and logged.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingSessionStatusInfo {
    pub trading_session_id: String,
    pub status: u32,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// Reject(3) fields (spec.md §4.C4).
#[derive(Debug, Clone, PartialEq)]
pub struct RejectInfo {
    pub ref_seq_num: Option<u32>,
    pub ref_tag_id: Option<u32>,
    pub text: Option<String>,
    pub session_reject_reason: Option<String>,
}

/// Returned by handlers that can indicate a session-level sequence error
/// (Logout and Reject, per spec.md §4.C4/§4.C6).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceErrorInfo {
    pub is_sequence_error: bool,
    pub expected_seq_num: Option<u32>,
}

fn sequence_error_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"expected ['"]?([0-9]+)['"]?"#).expect("valid regex"))
}

/// Whether free text names a sequence-number anomaly (spec.md §4.C4: the
/// Logout text and Reject text are checked against the same heuristic).
pub fn looks_like_sequence_error(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("msgseqnum") || lower.contains("too large") || lower.contains("sequence")
}

/// Extracts the expected sequence number from free text, if present. Returns
/// `None` when the text doesn't match the known phrasing — callers must fall
/// back to `reset_all()` rather than treat this as an error (spec.md §9).
pub fn extract_expected_seq_num(text: &str) -> Option<u32> {
    sequence_error_regex()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Logon(A): server's starting sequence number and whether it reset.
pub struct LogonInfo {
    pub server_seq: u32,
    pub reset_flag: bool,
}

pub fn handle_logon(msg: &ParsedMessage) -> LogonInfo {
    let server_seq = msg.get_u32(tags::MSG_SEQ_NUM).unwrap_or(1);
    let reset_flag = msg.get(tags::RESET_SEQ_NUM_FLAG) == Some("Y");
    LogonInfo {
        server_seq,
        reset_flag,
    }
}

pub struct LogoutOutcome {
    pub text: Option<String>,
    pub sequence_error: SequenceErrorInfo,
}

pub fn handle_logout(msg: &ParsedMessage) -> LogoutOutcome {
    let text = msg.get(tags::TEXT).map(str::to_string);
    let sequence_error = match &text {
        Some(t) if looks_like_sequence_error(t) => SequenceErrorInfo {
            is_sequence_error: true,
            expected_seq_num: extract_expected_seq_num(t),
        },
        _ => SequenceErrorInfo::default(),
    };
    LogoutOutcome {
        text,
        sequence_error,
    }
}

pub fn handle_test_request(msg: &ParsedMessage) -> Option<String> {
    msg.get(tags::TEST_REQ_ID).map(str::to_string)
}

fn parse_f64(s: Option<&String>) -> Option<f64> {
    s.and_then(|v| v.parse().ok())
}

fn market_data_items(msg: &ParsedMessage) -> Vec<MarketDataItem> {
    msg.group(tags::NO_MD_ENTRIES)
        .into_iter()
        .map(|row| MarketDataItem {
            entry_type: row.get(&tags::MD_ENTRY_TYPE).cloned(),
            price: parse_f64(row.get(&tags::MD_ENTRY_PX)),
            size: parse_f64(row.get(&tags::MD_ENTRY_SIZE)),
            date: row.get(&tags::MD_ENTRY_DATE).cloned(),
            time: row.get(&tags::MD_ENTRY_TIME).cloned(),
        })
        .collect()
}

/// Symbol prefixes for index instruments on this gateway, used alongside
/// `RawData(96)=kse` to route onto the `kseData` channel (spec.md §4.C4 —
/// an explicitly heuristic classification; see DESIGN.md open question).
const INDEX_SYMBOL_PREFIXES: &[&str] = &["KSE", "KMI", "ALLSHR"];

fn is_kse_index_payload(msg: &ParsedMessage, symbol: &str) -> bool {
    INDEX_SYMBOL_PREFIXES
        .iter()
        .any(|prefix| symbol.starts_with(prefix))
        || msg.get(tags::RAW_DATA) == Some("kse")
}

pub struct MarketDataSnapshot {
    pub symbol: String,
    pub items: Vec<MarketDataItem>,
    pub is_kse_index: bool,
}

pub fn handle_market_data_snapshot(msg: &ParsedMessage) -> MarketDataSnapshot {
    let symbol = msg.get(tags::SYMBOL).unwrap_or_default().to_string();
    let items = market_data_items(msg);
    let is_kse_index = is_kse_index_payload(msg, &symbol);
    MarketDataSnapshot {
        symbol,
        items,
        is_kse_index,
    }
}

pub fn handle_market_data_incremental(msg: &ParsedMessage) -> MarketDataSnapshot {
    handle_market_data_snapshot(msg)
}

pub struct MarketDataRejectInfo {
    pub md_req_id: Option<String>,
    pub reject_reason: Option<String>,
    pub text: Option<String>,
}

pub fn handle_market_data_reject(msg: &ParsedMessage) -> MarketDataRejectInfo {
    MarketDataRejectInfo {
        md_req_id: msg.get(tags::MD_REQ_ID).map(str::to_string),
        reject_reason: msg.get(tags::MD_REJECT_REASON).map(str::to_string),
        text: msg.get(tags::TEXT).map(str::to_string),
    }
}

pub struct SecurityListOutcome {
    pub security_req_id: Option<String>,
    /// `4` = equity/futures, `5` = index (spec.md §4.C3/§4.C4).
    pub product: Option<String>,
    pub entries: Vec<SecurityListEntry>,
}

pub fn handle_security_list(msg: &ParsedMessage) -> SecurityListOutcome {
    let security_req_id = msg.get(tags::SECURITY_REQ_ID).map(str::to_string);
    let product = msg.get(tags::PRODUCT).map(str::to_string);

    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::new();
    for row in msg.group(tags::NO_RELATED_SYM) {
        let Some(symbol) = row.get(&tags::SYMBOL).cloned() else {
            continue;
        };
        if !seen.insert(symbol.clone()) {
            continue;
        }
        entries.push(SecurityListEntry {
            symbol,
            security_type: row.get(&tags::SECURITY_TYPE).cloned(),
            security_desc: row.get(&tags::SECURITY_DESC).cloned(),
            market_id: row.get(&tags::MARKET_ID).cloned(),
        });
    }

    SecurityListOutcome {
        security_req_id,
        product,
        entries,
    }
}

/// TradSesStatus codes (FIX enum): 1=Unknown, 2=Open, 3=Closed, 4=PreOpen,
/// 5=PreClose, 6=RequestRejected.
const TRAD_SES_STATUS_OPEN: u32 = 2;
const TRAD_SES_STATUS_CLOSED: u32 = 3;
const TRAD_SES_STATUS_PRE_OPEN: u32 = 4;

/// TradingSessionStatus(h), applying spec.md §4.C4's fallback policy: when
/// fields are missing, derive them from secondary tags, logging every
/// heuristic applied (the source's per-venue mapping is unconfirmed, per
/// spec.md §9 — do not tighten this without exchange confirmation).
pub fn handle_trading_session_status(msg: &ParsedMessage) -> TradingSessionStatusInfo {
    let trading_session_id = match msg.get(tags::TRADING_SESSION_ID) {
        Some(id) => id.to_string(),
        None => match msg.get(tags::MARKET_ID) {
            Some(market_id) => {
                tracing::debug!(
                    market_id,
                    "TradingSessionID absent; falling back to MarketID"
                );
                market_id.to_string()
            }
            None => {
                tracing::warn!("TradingSessionID and MarketID both absent; defaulting to REG");
                "REG".to_string()
            }
        },
    };

    let status = match msg.get_u32(tags::TRAD_SES_STATUS) {
        Some(status) => status,
        None => derive_trad_ses_status(msg),
    };

    TradingSessionStatusInfo {
        trading_session_id,
        status,
        start_time: msg.get(tags::START_TIME).map(str::to_string),
        end_time: msg.get(tags::END_TIME).map(str::to_string),
    }
}

fn derive_trad_ses_status(msg: &ParsedMessage) -> u32 {
    if let Some(sub_id) = msg.get(tags::TRADING_SESSION_SUB_ID) {
        let derived = match sub_id {
            "OPEN" => Some(TRAD_SES_STATUS_OPEN),
            "CLOS" => Some(TRAD_SES_STATUS_CLOSED),
            "PRE" => Some(TRAD_SES_STATUS_PRE_OPEN),
            _ => None,
        };
        if let Some(status) = derived {
            tracing::debug!(
                sub_id,
                status,
                "TradSesStatus absent; derived from TradingSessionSubID"
            );
            return status;
        }
    }
    if let Some(text) = msg.get(tags::TEXT) {
        let lower = text.to_ascii_lowercase();
        if lower.contains("open") {
            tracing::debug!(text, "TradSesStatus absent; derived Open from Text keyword");
            return TRAD_SES_STATUS_OPEN;
        }
        if lower.contains("clos") {
            tracing::debug!(
                text,
                "TradSesStatus absent; derived Closed from Text keyword"
            );
            return TRAD_SES_STATUS_CLOSED;
        }
        if lower.contains("pre") {
            tracing::debug!(
                text,
                "TradSesStatus absent; derived PreOpen from Text keyword"
            );
            return TRAD_SES_STATUS_PRE_OPEN;
        }
    }
    tracing::warn!("TradSesStatus undeterminable; defaulting to Open");
    TRAD_SES_STATUS_OPEN
}

pub fn handle_reject(msg: &ParsedMessage) -> (RejectInfo, SequenceErrorInfo) {
    let ref_seq_num = msg.get_u32(tags::REF_SEQ_NUM);
    let ref_tag_id = msg.get_u32(tags::REF_TAG_ID);
    let text = msg.get(tags::TEXT).map(str::to_string);
    let session_reject_reason = msg.get(tags::SESSION_REJECT_REASON).map(str::to_string);

    let references_seq_tag = ref_tag_id == Some(tags::MSG_SEQ_NUM);
    let text_looks_like_seq_error = text.as_deref().is_some_and(looks_like_sequence_error);
    let sequence_error = if references_seq_tag || text_looks_like_seq_error {
        SequenceErrorInfo {
            is_sequence_error: true,
            expected_seq_num: text.as_deref().and_then(extract_expected_seq_num),
        }
    } else {
        SequenceErrorInfo::default()
    };

    (
        RejectInfo {
            ref_seq_num,
            ref_tag_id,
            text,
            session_reject_reason,
        },
        sequence_error,
    )
}

pub struct SymbolTradingStatus {
    pub symbol: String,
    pub status: Option<String>,
    pub timestamp: Option<String>,
}

pub fn handle_trading_status(msg: &ParsedMessage) -> SymbolTradingStatus {
    SymbolTradingStatus {
        symbol: msg.get(tags::SYMBOL).unwrap_or_default().to_string(),
        status: msg.get(tags::TRADING_STATUS).map(str::to_string),
        timestamp: msg.get(tags::TRANSACT_TIME).map(str::to_string),
    }
}

/// Turns a parsed message's flat fields into the tag→value map the
/// `Message`/`RawMessage`/`CategorizedData` events carry (spec.md §4.C7).
pub fn to_field_map(msg: &ParsedMessage) -> HashMap<u32, String> {
    let mut map = HashMap::new();
    for tag in [
        tags::MSG_TYPE,
        tags::SENDER_COMP_ID,
        tags::TARGET_COMP_ID,
        tags::MSG_SEQ_NUM,
        tags::SENDING_TIME,
    ] {
        if let Some(v) = msg.get(tag) {
            map.insert(tag, v.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, encode, MsgType};

    #[test]
    fn sequence_error_text_extracts_expected_number() {
        let text = "MsgSeqNum too large, expected '42'";
        assert!(looks_like_sequence_error(text));
        assert_eq!(extract_expected_seq_num(text), Some(42));
    }

    #[test]
    fn sequence_error_without_parseable_number_falls_back_gracefully() {
        let text = "sequence number mismatch detected";
        assert!(looks_like_sequence_error(text));
        assert_eq!(extract_expected_seq_num(text), None);
    }

    #[test]
    fn unrelated_logout_text_is_not_a_sequence_error() {
        assert!(!looks_like_sequence_error("user requested disconnect"));
    }

    #[test]
    fn scenario_market_data_snapshot_two_items() {
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
        let msg = decode(&bytes).unwrap();
        let snapshot = handle_market_data_snapshot(&msg);
        assert_eq!(snapshot.symbol, "LUCK");
        assert_eq!(snapshot.items.len(), 2);
        assert_eq!(snapshot.items[0].price, Some(100.5));
        assert_eq!(snapshot.items[1].price, Some(100.6));
        assert!(!snapshot.is_kse_index);
    }

    #[test]
    fn scenario_security_list_classification() {
        let body = vec![
            (tags::SECURITY_REQ_ID, "id".to_string()),
            (tags::PRODUCT, "4".to_string()),
            (tags::NO_RELATED_SYM, "2".to_string()),
            (tags::SYMBOL, "LUCK".to_string()),
            (tags::SECURITY_TYPE, "CS".to_string()),
            (tags::SYMBOL, "OGDC".to_string()),
            (tags::SECURITY_TYPE, "CS".to_string()),
        ];
        let bytes = encode(MsgType::SecurityList, 5, "A", "B", &body);
        let msg = decode(&bytes).unwrap();
        let outcome = handle_security_list(&msg);
        assert_eq!(outcome.product.as_deref(), Some("4"));
        assert_eq!(outcome.entries.len(), 2);
    }

    #[test]
    fn security_list_deduplicates_repeated_symbols() {
        let body = vec![
            (tags::PRODUCT, "4".to_string()),
            (tags::NO_RELATED_SYM, "2".to_string()),
            (tags::SYMBOL, "LUCK".to_string()),
            (tags::SECURITY_TYPE, "CS".to_string()),
            (tags::SYMBOL, "LUCK".to_string()),
            (tags::SECURITY_TYPE, "CS".to_string()),
        ];
        let bytes = encode(MsgType::SecurityList, 6, "A", "B", &body);
        let msg = decode(&bytes).unwrap();
        let outcome = handle_security_list(&msg);
        assert_eq!(outcome.entries.len(), 1);
    }

    #[test]
    fn trading_session_status_falls_back_to_market_id_then_default() {
        let with_market_id = vec![(tags::MARKET_ID, "REG".to_string())];
        let bytes = encode(MsgType::TradingSessionStatus, 1, "A", "B", &with_market_id);
        let msg = decode(&bytes).unwrap();
        let info = handle_trading_session_status(&msg);
        assert_eq!(info.trading_session_id, "REG");
        assert_eq!(info.status, TRAD_SES_STATUS_OPEN);

        let empty: Vec<(u32, String)> = vec![];
        let bytes = encode(MsgType::TradingSessionStatus, 2, "A", "B", &empty);
        let msg = decode(&bytes).unwrap();
        let info = handle_trading_session_status(&msg);
        assert_eq!(info.trading_session_id, "REG");
    }

    #[test]
    fn trading_session_status_derives_from_sub_id_when_status_absent() {
        let body = vec![
            (tags::TRADING_SESSION_ID, "REG".to_string()),
            (tags::TRADING_SESSION_SUB_ID, "CLOS".to_string()),
        ];
        let bytes = encode(MsgType::TradingSessionStatus, 3, "A", "B", &body);
        let msg = decode(&bytes).unwrap();
        let info = handle_trading_session_status(&msg);
        assert_eq!(info.status, TRAD_SES_STATUS_CLOSED);
    }

    #[test]
    fn reject_referencing_seq_num_tag_is_a_sequence_error() {
        let body = vec![
            (tags::REF_SEQ_NUM, "7".to_string()),
            (tags::REF_TAG_ID, tags::MSG_SEQ_NUM.to_string()),
            (tags::TEXT, "MsgSeqNum expected '42'".to_string()),
        ];
        let bytes = encode(MsgType::Reject, 8, "A", "B", &body);
        let msg = decode(&bytes).unwrap();
        let (info, seq_err) = handle_reject(&msg);
        assert_eq!(info.ref_seq_num, Some(7));
        assert!(seq_err.is_sequence_error);
        assert_eq!(seq_err.expected_seq_num, Some(42));
    }
}
