//! Block-number notifications.
//!
//! A [`BlockSource`] hands out [`BlockSubscription`]s: a stream of block
//! numbers driven by a background task. Dropping the subscription
//! unsubscribes by aborting that task.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::{
    net::TcpStream,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time,
};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::{helpers::parse_quantity, prelude::*, req::JsonRpcClient, Error};

/// Stream of block numbers from a [`BlockSource`].
#[derive(Debug)]
pub struct BlockSubscription {
    receiver: UnboundedReceiver<u64>,
    task: Option<JoinHandle<()>>,
}

impl BlockSubscription {
    /// Subscription fed by `task` through the sending half of `receiver`.
    pub fn new(receiver: UnboundedReceiver<u64>, task: Option<JoinHandle<()>>) -> Self {
        Self { receiver, task }
    }

    /// Next announced block number, `None` once the source has shut down.
    pub async fn next(&mut self) -> Option<u64> {
        self.receiver.recv().await
    }
}

impl Drop for BlockSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Source of new-block notifications.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn subscribe(&self) -> Result<BlockSubscription>;
}

/// Polls `eth_blockNumber` and announces every block number it hasn't seen yet.
#[derive(Debug, Clone)]
pub struct PollingBlockSource {
    rpc: Arc<JsonRpcClient>,
    interval: Duration,
}

impl PollingBlockSource {
    pub fn new(rpc: Arc<JsonRpcClient>, interval: Duration) -> Self {
        Self { rpc, interval }
    }
}

async fn block_number(rpc: &JsonRpcClient) -> Result<u64> {
    let number: String = rpc.request("eth_blockNumber", json!([])).await?;
    parse_quantity(&number)
}

#[async_trait]
impl BlockSource for PollingBlockSource {
    async fn subscribe(&self) -> Result<BlockSubscription> {
        let (sender, receiver) = unbounded_channel();
        let rpc = Arc::clone(&self.rpc);
        let period = self.interval;

        // Baseline: only blocks after the one current at subscription time are announced.
        let mut last_seen = block_number(&rpc).await?;

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match block_number(&rpc).await {
                    Ok(number) if number > last_seen => {
                        last_seen = number;
                        if sender.send(number).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "Block number poll failed"),
                }
            }
            debug!("Block polling task stopped");
        });

        Ok(BlockSubscription::new(receiver, Some(task)))
    }
}

/// Reconnection policy for [`WsBlockSource`].
#[derive(Debug, Clone)]
pub struct WsReconnectConfig {
    /// Initial delay before first reconnection attempt (default: 1s)
    pub initial_reconnect_delay: Duration,
    /// Maximum delay between reconnection attempts (default: 60s)
    pub max_reconnect_delay: Duration,
    /// Backoff multiplier for exponential delay (default: 2.0)
    pub backoff_multiplier: f64,
    /// Maximum consecutive reconnection failures before giving up (0 = unlimited)
    pub max_consecutive_failures: u32,
}

impl Default for WsReconnectConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_consecutive_failures: 10,
        }
    }
}

impl WsReconnectConfig {
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_secs =
            self.initial_reconnect_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_secs = base_secs.min(self.max_reconnect_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs.max(0.1))
    }
}

#[derive(Deserialize, Debug)]
struct SubscriptionNotification {
    params: SubscriptionParams,
}

#[derive(Deserialize, Debug)]
struct SubscriptionParams {
    result: NewHead,
}

#[derive(Deserialize, Debug)]
struct NewHead {
    number: String,
}

/// Block number carried by an `eth_subscription` message, if it is one.
fn parse_new_head(text: &str) -> Option<u64> {
    let notification: SubscriptionNotification = serde_json::from_str(text).ok()?;
    parse_quantity(&notification.params.result.number).ok()
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `eth_subscribe("newHeads")` over a WebSocket endpoint, reconnecting with
/// exponential backoff when the connection drops.
#[derive(Debug, Clone)]
pub struct WsBlockSource {
    url: String,
    reconnect: WsReconnectConfig,
}

impl WsBlockSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, WsReconnectConfig::default())
    }

    pub fn with_config(url: impl Into<String>, reconnect: WsReconnectConfig) -> Self {
        Self {
            url: url.into(),
            reconnect,
        }
    }

    async fn connect(url: &str) -> Result<WsStream> {
        let (mut ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::ws_connection(e.to_string()))?;

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"],
        });
        ws.send(protocol::Message::Text(request.to_string()))
            .await
            .map_err(|e| Error::ws_connection(e.to_string()))?;

        Ok(ws)
    }

    /// Forward heads until the connection drops. Returns `false` when the
    /// receiving side has gone away.
    async fn forward(ws: &mut WsStream, sender: &UnboundedSender<u64>) -> bool {
        while let Some(message) = ws.next().await {
            match message {
                Ok(protocol::Message::Text(text)) => {
                    if let Some(number) = parse_new_head(&text) {
                        if sender.send(number).is_err() {
                            return false;
                        }
                    }
                }
                Ok(protocol::Message::Ping(payload)) => {
                    if let Err(err) = ws.send(protocol::Message::Pong(payload)).await {
                        warn!(error = %err, "Failed to answer ping");
                        return true;
                    }
                }
                Ok(protocol::Message::Close(_)) => return true,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "WebSocket read failed");
                    return true;
                }
            }
        }
        true
    }
}

#[async_trait]
impl BlockSource for WsBlockSource {
    async fn subscribe(&self) -> Result<BlockSubscription> {
        let (sender, receiver) = unbounded_channel();
        let mut ws = Self::connect(&self.url).await?;
        let url = self.url.clone();
        let reconnect = self.reconnect.clone();

        let task = tokio::spawn(async move {
            loop {
                if !Self::forward(&mut ws, &sender).await {
                    break;
                }
                warn!(url = %url, "Block subscription disconnected");

                let mut attempt = 0u32;
                ws = loop {
                    let delay = reconnect.backoff_delay(attempt);
                    info!(attempt = attempt + 1, delay_ms = delay.as_millis(), "Reconnecting block subscription");
                    time::sleep(delay).await;

                    match Self::connect(&url).await {
                        Ok(ws) => break ws,
                        Err(err) => {
                            attempt += 1;
                            if reconnect.max_consecutive_failures > 0
                                && attempt >= reconnect.max_consecutive_failures
                            {
                                error!(error = %err, failures = attempt, "Giving up on block subscription");
                                return;
                            }
                            error!(error = %err, attempt, "Could not reconnect block subscription");
                        }
                    }
                };
            }
            debug!("Block subscription task stopped");
        });

        Ok(BlockSubscription::new(receiver, Some(task)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_new_head() {
        let message = r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xabc","result":{"number":"0x1b4","hash":"0x00"}}}"#;
        assert_eq!(parse_new_head(message), Some(436));
        assert_eq!(parse_new_head(r#"{"jsonrpc":"2.0","id":1,"result":"0xabc"}"#), None);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = WsReconnectConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(20), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_subscription_drop_aborts_task() {
        let (sender, receiver) = unbounded_channel();
        let task = tokio::spawn(async move {
            let _sender = sender;
            std::future::pending::<()>().await;
        });
        let abort_handle = task.abort_handle();

        let subscription = BlockSubscription::new(receiver, Some(task));
        drop(subscription);
        for _ in 0..10 {
            if abort_handle.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(abort_handle.is_finished());
    }
}
