//! Toy acceptor side of the PSX profile, for exercising the connector
//! without a real exchange gateway: accepts one connection, replies to
//! Logon/TestRequest/Logout, and pushes a market data snapshot a couple of
//! seconds after logon. Mirrors what the teacher's `acceptor.rs` does, using
//! this crate's own codec instead of hand-built frames.

use bytes::BytesMut;
use psxfix::protocol::{self, tags, FrameResult, MsgType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{self, Duration, Instant};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let listener = TcpListener::bind(("127.0.0.1", 9876)).await?;
    println!("toy gateway listening on 127.0.0.1:9876");

    loop {
        let (socket, addr) = listener.accept().await?;
        println!("accepted connection from {addr}");
        tokio::spawn(serve(socket));
    }
}

async fn serve(mut socket: tokio::net::TcpStream) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut read_buf = [0u8; 4096];
    let mut out_seq: u32 = 1;
    let mut sender_comp = "GATEWAY".to_string();
    let mut target_comp = "CLIENT".to_string();
    let mut heartbeat_interval = Duration::from_secs(30);
    let mut last_rx = Instant::now();
    let mut logged_on = false;
    let mut ticker = time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            result = socket.read(&mut read_buf) => {
                match result {
                    Ok(0) => { println!("peer closed"); return; }
                    Ok(n) => {
                        buf.extend_from_slice(&read_buf[..n]);
                        last_rx = Instant::now();
                        loop {
                            match protocol::next_frame(&mut buf) {
                                FrameResult::Incomplete => break,
                                FrameResult::Skipped(reason) => {
                                    println!("skipped malformed frame: {reason}");
                                    continue;
                                }
                                FrameResult::Frame(frame) => {
                                    let msg = match protocol::decode(&frame) {
                                        Ok(msg) => msg,
                                        Err(err) => { println!("decode error: {err}"); continue; }
                                    };
                                    match msg.msg_type {
                                        MsgType::Logon => {
                                            if let Some(hb) = msg.get_u32(tags::HEART_BT_INT) {
                                                heartbeat_interval = Duration::from_secs(hb as u64);
                                            }
                                            if let Some(s) = msg.get(tags::SENDER_COMP_ID) { target_comp = s.to_string(); }
                                            if let Some(t) = msg.get(tags::TARGET_COMP_ID) { sender_comp = t.to_string(); }

                                            let body = vec![
                                                (tags::ENCRYPT_METHOD, "0".to_string()),
                                                (tags::HEART_BT_INT, heartbeat_interval.as_secs().to_string()),
                                                (tags::RESET_SEQ_NUM_FLAG, "Y".to_string()),
                                            ];
                                            let reply = protocol::encode(MsgType::Logon, out_seq, &sender_comp, &target_comp, &body);
                                            out_seq += 1;
                                            let _ = socket.write_all(&reply).await;
                                            logged_on = true;
                                            println!("logon accepted from {sender_comp} (reset), scheduling a snapshot");
                                            let snapshot = build_snapshot(&sender_comp, &target_comp, out_seq);
                                            out_seq += 1;
                                            tokio::time::sleep(Duration::from_secs(2)).await;
                                            let _ = socket.write_all(&snapshot).await;
                                        }
                                        MsgType::TestRequest => {
                                            let test_req_id = msg.get(tags::TEST_REQ_ID).map(str::to_string);
                                            let mut body = Vec::new();
                                            if let Some(id) = test_req_id { body.push((tags::TEST_REQ_ID, id)); }
                                            let reply = protocol::encode(MsgType::Heartbeat, out_seq, &sender_comp, &target_comp, &body);
                                            out_seq += 1;
                                            let _ = socket.write_all(&reply).await;
                                        }
                                        MsgType::Logout => {
                                            let reply = protocol::encode(MsgType::Logout, out_seq, &sender_comp, &target_comp, &[]);
                                            let _ = socket.write_all(&reply).await;
                                            let _ = socket.shutdown().await;
                                            return;
                                        }
                                        _ => {}
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => { println!("read error: {err}"); return; }
                }
            }
            _ = ticker.tick() => {
                if logged_on && last_rx.elapsed() >= heartbeat_interval {
                    let reply = protocol::encode(MsgType::Heartbeat, out_seq, &sender_comp, &target_comp, &[]);
                    out_seq += 1;
                    let _ = socket.write_all(&reply).await;
                    last_rx = Instant::now();
                }
            }
        }
    }
}

fn build_snapshot(sender_comp: &str, target_comp: &str, seq: u32) -> bytes::Bytes {
    let body = vec![
        (tags::SYMBOL, "LUCK".to_string()),
        (tags::NO_MD_ENTRIES, "2".to_string()),
        (tags::MD_ENTRY_TYPE, "0".to_string()),
        (tags::MD_ENTRY_PX, "620.50".to_string()),
        (tags::MD_ENTRY_SIZE, "500".to_string()),
        (tags::MD_ENTRY_TYPE, "1".to_string()),
        (tags::MD_ENTRY_PX, "621.00".to_string()),
        (tags::MD_ENTRY_SIZE, "300".to_string()),
    ];
    protocol::encode(
        MsgType::MarketDataSnapshotFullRefresh,
        seq,
        sender_comp,
        target_comp,
        &body,
    )
}
