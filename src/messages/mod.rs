//! Domain-typed constructors for each outbound message kind (spec.md §4.C3).
//!
//! Every builder here draws its `MsgSeqNum` from [`SequenceManager`] and
//! returns the fully encoded frame in the same call, so there is no code path
//! that can assign a sequence number without placing it on the wire (I1).

use crate::config::ConnectionConfig;
use crate::protocol::{self, tags, MsgType};
use crate::sequence::{SequenceManager, Stream};
use bytes::Bytes;
use uuid::Uuid;

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

fn encode(
    cfg: &ConnectionConfig,
    seq_mgr: &mut SequenceManager,
    stream: Stream,
    msg_type: MsgType,
    body: Vec<(u32, String)>,
) -> Bytes {
    let seq = seq_mgr.next_and_inc(stream);
    protocol::encode(
        msg_type,
        seq,
        &cfg.sender_comp_id,
        &cfg.target_comp_id,
        &body,
    )
}

fn push_session_profile_fields(cfg: &ConnectionConfig, body: &mut Vec<(u32, String)>) {
    if let Some(ref obo) = cfg.on_behalf_of_comp_id {
        body.push((tags::ON_BEHALF_OF_COMP_ID, obo.clone()));
    }
    if let (Some(ref raw), Some(len)) = (&cfg.raw_data, cfg.raw_data_length) {
        body.push((tags::RAW_DATA_LENGTH, len.to_string()));
        body.push((tags::RAW_DATA, raw.clone()));
    }
}

/// Logon(A): EncryptMethod=0, HeartBtInt, ResetSeqNumFlag, credentials, and
/// the PSX profile's fixed ApplVerID pair.
pub fn build_logon(cfg: &ConnectionConfig, seq_mgr: &mut SequenceManager) -> Bytes {
    let mut body = vec![
        (tags::ENCRYPT_METHOD, "0".to_string()),
        (tags::HEART_BT_INT, cfg.heartbeat_interval_secs.to_string()),
    ];
    if cfg.reset_on_logon {
        body.push((tags::RESET_SEQ_NUM_FLAG, "Y".to_string()));
    }
    if !cfg.username.is_empty() {
        body.push((tags::USERNAME, cfg.username.clone()));
    }
    if !cfg.password.is_empty() {
        body.push((tags::PASSWORD, cfg.password.clone()));
    }
    body.push((tags::DEFAULT_APPL_VER_ID, cfg.default_appl_ver_id.clone()));
    body.push((
        tags::DEFAULT_CSTM_APPL_VER_ID,
        cfg.default_cstm_appl_ver_id.clone(),
    ));
    push_session_profile_fields(cfg, &mut body);

    encode(cfg, seq_mgr, Stream::Main, MsgType::Logon, body)
}

/// Logout(5), optionally carrying free text (spec.md §4.C3).
pub fn build_logout(
    cfg: &ConnectionConfig,
    seq_mgr: &mut SequenceManager,
    text: Option<&str>,
) -> Bytes {
    let mut body = Vec::new();
    if let Some(t) = text {
        body.push((tags::TEXT, t.to_string()));
    }
    encode(cfg, seq_mgr, Stream::Main, MsgType::Logout, body)
}

/// Heartbeat(0), echoing `TestReqID` when responding to a TestRequest.
pub fn build_heartbeat(
    cfg: &ConnectionConfig,
    seq_mgr: &mut SequenceManager,
    test_req_id: Option<&str>,
) -> Bytes {
    let mut body = Vec::new();
    if let Some(id) = test_req_id {
        body.push((tags::TEST_REQ_ID, id.to_string()));
    }
    encode(cfg, seq_mgr, Stream::Main, MsgType::Heartbeat, body)
}

/// TestRequest(1) with a fresh `TestReqID`; the caller tracks this id to
/// confirm the Heartbeat echo (spec.md P6: at most one in flight).
pub fn build_test_request(
    cfg: &ConnectionConfig,
    seq_mgr: &mut SequenceManager,
) -> (String, Bytes) {
    let test_req_id = fresh_id();
    let body = vec![(tags::TEST_REQ_ID, test_req_id.clone())];
    let bytes = encode(cfg, seq_mgr, Stream::Main, MsgType::TestRequest, body);
    (test_req_id, bytes)
}

/// Which product classification a [`SecurityListRequest`] / market-data
/// subscription targets (spec.md §4.C3 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Product {
    Equity,
    Index,
    Futures,
}

impl Product {
    fn code(self) -> &'static str {
        match self {
            Product::Equity | Product::Futures => "4",
            Product::Index => "5",
        }
    }

    fn trading_session_id(self) -> &'static str {
        match self {
            Product::Equity | Product::Index => "REG",
            Product::Futures => "FUT",
        }
    }
}

/// SecurityListRequest(x) for equities, indices, or futures, distinguished by
/// `Product` and `TradingSessionID` (spec.md §4.C3 table's three rows).
pub fn build_security_list_request(
    cfg: &ConnectionConfig,
    seq_mgr: &mut SequenceManager,
    product: Product,
) -> (String, Bytes) {
    let security_req_id = fresh_id();
    let body = vec![
        (tags::SECURITY_REQ_ID, security_req_id.clone()),
        (tags::SECURITY_LIST_REQUEST_TYPE, "0".to_string()),
        (tags::SYMBOL, "NA".to_string()),
        (tags::PRODUCT, product.code().to_string()),
        (
            tags::TRADING_SESSION_ID,
            product.trading_session_id().to_string(),
        ),
    ];
    let bytes = encode(
        cfg,
        seq_mgr,
        Stream::SecurityList,
        MsgType::SecurityListRequest,
        body,
    );
    (security_req_id, bytes)
}

/// TradingSessionStatusRequest(g) for the regular session.
pub fn build_trading_session_status_request(
    cfg: &ConnectionConfig,
    seq_mgr: &mut SequenceManager,
) -> (String, Bytes) {
    let trad_ses_req_id = fresh_id();
    let body = vec![
        (tags::TRAD_SES_REQ_ID, trad_ses_req_id.clone()),
        (tags::SUBSCRIPTION_REQUEST_TYPE, "0".to_string()),
        (tags::TRADING_SESSION_ID, "REG".to_string()),
    ];
    let bytes = encode(
        cfg,
        seq_mgr,
        Stream::TradingStatus,
        MsgType::TradingSessionStatusRequest,
        body,
    );
    (trad_ses_req_id, bytes)
}

/// Subscription request for a set of symbols and MDEntryTypes (spec.md
/// §4.C3's MarketDataRequest row: MDReqID, SubscriptionRequestType,
/// MarketDepth, MDUpdateType, NoMDEntryTypes + list, NoRelatedSym + list, an
/// optional PartyID group).
#[derive(Debug, Clone)]
pub struct MarketDataSubscription {
    pub symbols: Vec<String>,
    /// MDEntryType codes, e.g. `['0', '1']` for bid/offer.
    pub entry_types: Vec<char>,
    pub market_depth: u32,
    /// '0' snapshot only, '1' snapshot + updates, '2' disable previous.
    pub subscription_request_type: char,
    /// 0 = full refresh, 1 = incremental refresh.
    pub md_update_type: u32,
    pub party_id: Option<String>,
}

impl MarketDataSubscription {
    pub fn snapshot_plus_updates(symbols: Vec<String>) -> Self {
        Self {
            symbols,
            entry_types: vec!['0', '1'],
            market_depth: 0,
            subscription_request_type: '1',
            md_update_type: 0,
            party_id: None,
        }
    }
}

/// MarketDataRequest(V).
pub fn build_market_data_request(
    cfg: &ConnectionConfig,
    seq_mgr: &mut SequenceManager,
    req: &MarketDataSubscription,
) -> (String, Bytes) {
    let md_req_id = fresh_id();
    let mut body = vec![
        (tags::MD_REQ_ID, md_req_id.clone()),
        (
            tags::SUBSCRIPTION_REQUEST_TYPE,
            req.subscription_request_type.to_string(),
        ),
        (tags::MARKET_DEPTH, req.market_depth.to_string()),
        (tags::MD_UPDATE_TYPE, req.md_update_type.to_string()),
        (tags::NO_MD_ENTRY_TYPES, req.entry_types.len().to_string()),
    ];
    for entry_type in &req.entry_types {
        body.push((tags::MD_ENTRY_TYPE, entry_type.to_string()));
    }
    body.push((tags::NO_RELATED_SYM, req.symbols.len().to_string()));
    for symbol in &req.symbols {
        body.push((tags::SYMBOL, symbol.clone()));
    }
    if let Some(ref party_id) = req.party_id {
        body.push((tags::NO_PARTY_IDS, "1".to_string()));
        body.push((tags::PARTY_ID, party_id.clone()));
    }

    let bytes = encode(
        cfg,
        seq_mgr,
        Stream::MarketData,
        MsgType::MarketDataRequest,
        body,
    );
    (md_req_id, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode;

    fn cfg() -> ConnectionConfig {
        ConnectionConfig::builder()
            .host("127.0.0.1")
            .port(8016)
            .sender_comp_id("realtime")
            .target_comp_id("NMDUFISQ0001")
            .username("realtime")
            .password("secret")
            .heartbeat_interval_secs(30)
            .reset_on_logon(true)
            .build()
            .unwrap()
    }

    #[test]
    fn logon_carries_psx_profile_fields() {
        let cfg = cfg();
        let mut seq_mgr = SequenceManager::new();
        let bytes = build_logon(&cfg, &mut seq_mgr);
        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.get(tags::ENCRYPT_METHOD), Some("0"));
        assert_eq!(msg.get(tags::HEART_BT_INT), Some("30"));
        assert_eq!(msg.get(tags::RESET_SEQ_NUM_FLAG), Some("Y"));
        assert_eq!(msg.get(tags::USERNAME), Some("realtime"));
        assert_eq!(msg.get(tags::DEFAULT_APPL_VER_ID), Some("9"));
        assert_eq!(
            msg.get(tags::DEFAULT_CSTM_APPL_VER_ID),
            Some("FIX5.00_PSX_1.00")
        );
        assert_eq!(msg.get_u32(tags::MSG_SEQ_NUM), Some(1));
    }

    #[test]
    fn security_list_request_varies_product_and_session() {
        let cfg = cfg();
        let mut seq_mgr = SequenceManager::new();
        let (_, equity) = build_security_list_request(&cfg, &mut seq_mgr, Product::Equity);
        let (_, futures) = build_security_list_request(&cfg, &mut seq_mgr, Product::Futures);
        let equity = decode(&equity).unwrap();
        let futures = decode(&futures).unwrap();
        assert_eq!(equity.get(tags::PRODUCT), Some("4"));
        assert_eq!(equity.get(tags::TRADING_SESSION_ID), Some("REG"));
        assert_eq!(futures.get(tags::PRODUCT), Some("4"));
        assert_eq!(futures.get(tags::TRADING_SESSION_ID), Some("FUT"));
    }

    #[test]
    fn market_data_request_encodes_symbol_and_entry_type_groups() {
        let cfg = cfg();
        let mut seq_mgr = SequenceManager::new();
        let sub = MarketDataSubscription::snapshot_plus_updates(vec![
            "LUCK".to_string(),
            "OGDC".to_string(),
        ]);
        let (_, bytes) = build_market_data_request(&cfg, &mut seq_mgr, &sub);
        let msg = decode(&bytes).unwrap();
        let symbols = msg.group(tags::NO_RELATED_SYM);
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].get(&tags::SYMBOL).unwrap(), "LUCK");
        assert_eq!(symbols[1].get(&tags::SYMBOL).unwrap(), "OGDC");
    }

    #[test]
    fn each_builder_draws_from_its_own_stream() {
        let cfg = cfg();
        let mut seq_mgr = SequenceManager::new();
        let _ = build_logon(&cfg, &mut seq_mgr); // main: 1 -> 2
        let (_, md) = build_market_data_request(
            &cfg,
            &mut seq_mgr,
            &MarketDataSubscription::snapshot_plus_updates(vec!["LUCK".to_string()]),
        ); // market_data: 1 -> 2
        let md = decode(&md).unwrap();
        assert_eq!(md.get_u32(tags::MSG_SEQ_NUM), Some(1));
        assert_eq!(seq_mgr.peek(Stream::Main), 2);
    }
}
