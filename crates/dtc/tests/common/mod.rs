//! In-process DTC server used by the client tests.

#![allow(dead_code)]

use feedhub_dtc::protocol::*;
use feedhub_dtc::DtcConfig;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, Default)]
pub struct PeerBehavior {
    /// Reject this many logons before accepting.
    pub reject_logons: usize,
    /// Reject every subscription with this reason.
    pub reject_subscriptions: Option<String>,
    /// Close the socket right after acknowledging a subscription.
    pub drop_after_subscription_ack: bool,
    /// Never answer the logon.
    pub silent: bool,
    /// Answer subscriptions with `request_id + 1`.
    pub wrong_request_id: bool,
    /// Answer subscriptions with a bare header whose size is below 4.
    pub malformed_subscription_response: bool,
    /// Push this many trade updates right after a successful logon.
    pub unsolicited_after_logon: usize,
}

#[derive(Debug, Default)]
pub struct PeerLog {
    pub connections: usize,
    pub logons: Vec<LogonRequest>,
    pub subscriptions: Vec<MarketDataSubscribe>,
    pub trades: Vec<TradeUpdate>,
    pub logoffs: Vec<Logoff>,
    /// Message types in arrival order, across all connections.
    pub sequence: Vec<u16>,
}

pub struct MockPeer {
    pub addr: SocketAddr,
    pub log: Arc<Mutex<PeerLog>>,
}

impl MockPeer {
    pub async fn start(behavior: PeerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(PeerLog::default()));

        let accept_log = log.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                accept_log.lock().unwrap().connections += 1;
                tokio::spawn(serve(stream, behavior.clone(), accept_log.clone()));
            }
        });

        Self { addr, log }
    }

    pub fn config(&self) -> DtcConfig {
        DtcConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            username: "demo".to_string(),
            password: "secret".to_string(),
            handshake_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    /// Poll until `cond` holds on the log, or panic after two seconds.
    pub async fn wait_for(&self, cond: impl Fn(&PeerLog) -> bool) {
        for _ in 0..200 {
            if cond(&self.log.lock().unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peer condition not reached: {:?}", self.log.lock().unwrap());
    }
}

async fn serve(mut stream: TcpStream, behavior: PeerBehavior, log: Arc<Mutex<PeerLog>>) {
    loop {
        let Ok(frame) = read_frame(&mut stream).await else {
            return;
        };
        let Ok(msg) = Message::decode(&frame) else {
            return;
        };
        log.lock().unwrap().sequence.push(frame.message_type);

        match msg {
            Message::LogonRequest(req) => {
                let rejected = {
                    let mut log = log.lock().unwrap();
                    log.logons.push(req);
                    log.logons.len() <= behavior.reject_logons
                };
                if behavior.silent {
                    continue;
                }
                let response = if rejected {
                    LogonResponse {
                        protocol_version: PROTOCOL_VERSION,
                        result: 2,
                        result_text: "bad credentials".to_string(),
                    }
                } else {
                    LogonResponse {
                        protocol_version: PROTOCOL_VERSION,
                        result: LOGON_SUCCESS,
                        result_text: "welcome".to_string(),
                    }
                };
                if write_message(&mut stream, &Message::LogonResponse(response))
                    .await
                    .is_err()
                    || rejected
                {
                    return;
                }
                for n in 0..behavior.unsolicited_after_logon {
                    let push = Message::TradeUpdate(TradeUpdate {
                        request_id: 9_000 + n as u32,
                        symbol: "NQZ4".to_string(),
                        exchange: "CME".to_string(),
                        price: 1.0,
                        size: 1.0,
                        timestamp: 0.0,
                    });
                    if write_message(&mut stream, &push).await.is_err() {
                        return;
                    }
                }
            }
            Message::MarketDataSubscribe(sub) => {
                let request_id = sub.request_id;
                log.lock().unwrap().subscriptions.push(sub);
                if behavior.malformed_subscription_response {
                    let header = [2u8, 0, 102, 0];
                    if stream.write_all(&header).await.is_err() {
                        return;
                    }
                    continue;
                }
                let response = SubscriptionResponse {
                    request_id: if behavior.wrong_request_id {
                        request_id + 1
                    } else {
                        request_id
                    },
                    result: if behavior.reject_subscriptions.is_some() { 1 } else { SUBSCRIPTION_ACCEPTED },
                    reason: behavior.reject_subscriptions.clone().unwrap_or_default(),
                };
                if write_message(&mut stream, &Message::SubscriptionResponse(response))
                    .await
                    .is_err()
                    || behavior.drop_after_subscription_ack
                {
                    return;
                }
            }
            Message::TradeUpdate(trade) => log.lock().unwrap().trades.push(trade),
            Message::Logoff(logoff) => log.lock().unwrap().logoffs.push(logoff),
            _ => {}
        }
    }
}
