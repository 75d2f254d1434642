//! Ordered delivery lanes for backends that carry each message on its own HTTP
//! request. Messages of one session are delivered one after another; different
//! sessions never wait on each other.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{Outbound, SessionId};
use crate::message::Message;

/// How long an empty lane waits for more traffic before its task ends.
const LANE_IDLE: Duration = Duration::from_secs(30);

/// Reads `outbound` until it closes or `closing` fires, handing every message to
/// `deliver` on the lane of its session.
pub(crate) async fn run_lanes<F, Fut>(
    mut outbound: mpsc::Receiver<Outbound>,
    closing: CancellationToken,
    deliver: F,
) where
    F: Fn(Message) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut lanes: HashMap<Option<SessionId>, mpsc::UnboundedSender<Message>> = HashMap::new();
    loop {
        let Outbound { session, message } = tokio::select! {
            _ = closing.cancelled() => return,
            next = outbound.recv() => match next {
                Some(next) => next,
                None => return,
            },
        };

        // A lane that went idle has closed its queue and hands the message back.
        let message = match lanes.get(&session) {
            Some(lane) => match lane.send(message) {
                Ok(()) => continue,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        lanes.retain(|_, lane| !lane.is_closed());
        let (lane, queue) = mpsc::unbounded_channel();
        let _ = lane.send(message);
        debug!(session = ?session, lanes = lanes.len() + 1, "Opened delivery lane");
        tokio::spawn(run_lane(queue, closing.clone(), deliver.clone()));
        lanes.insert(session, lane);
    }
}

async fn run_lane<F, Fut>(
    mut queue: mpsc::UnboundedReceiver<Message>,
    closing: CancellationToken,
    deliver: F,
) where
    F: Fn(Message) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let message = tokio::select! {
            _ = closing.cancelled() => return,
            next = queue.recv() => match next {
                Some(message) => message,
                None => return,
            },
            _ = tokio::time::sleep(LANE_IDLE) => {
                // Refuse new messages, then finish whatever is already queued.
                queue.close();
                continue;
            }
        };

        tokio::select! {
            _ = closing.cancelled() => return,
            _ = deliver(message) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn outbound(session: &str, body: &str) -> Outbound {
        Outbound {
            session: Some(SessionId::from(session)),
            message: Message::from(body),
        }
    }

    #[tokio::test]
    async fn slow_lane_does_not_hold_up_others() {
        let (tx, rx) = mpsc::channel(8);
        let (done_tx, mut done) = mpsc::unbounded_channel();
        let closing = CancellationToken::new();
        let deliver = {
            let done_tx = done_tx.clone();
            move |message: Message| {
                let done_tx = done_tx.clone();
                async move {
                    if message.as_str().starts_with("slow") {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    let _ = done_tx.send(message.into_string());
                }
            }
        };
        tokio::spawn(run_lanes(rx, closing.clone(), deliver));

        tx.send(outbound("a", "slow-1")).await.unwrap();
        tx.send(outbound("a", "a-2")).await.unwrap();
        tx.send(outbound("b", "b-1")).await.unwrap();

        assert_eq!(done.recv().await.as_deref(), Some("b-1"));
        assert_eq!(done.recv().await.as_deref(), Some("slow-1"));
        assert_eq!(done.recv().await.as_deref(), Some("a-2"));
        closing.cancel();
    }

    #[tokio::test]
    async fn one_session_is_delivered_in_order() {
        let (tx, rx) = mpsc::channel(64);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let closing = CancellationToken::new();
        let deliver = {
            let seen = seen.clone();
            move |message: Message| {
                let seen = seen.clone();
                async move {
                    tokio::task::yield_now().await;
                    seen.lock().push(message.into_string());
                }
            }
        };
        let dispatcher = tokio::spawn(run_lanes(rx, closing.clone(), deliver));

        for n in 0..20 {
            tx.send(outbound("a", &n.to_string())).await.unwrap();
        }
        drop(tx);
        dispatcher.await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().len() < 20 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let expected: Vec<String> = (0..20).map(|n| n.to_string()).collect();
        assert_eq!(*seen.lock(), expected);
        closing.cancel();
    }
}
