use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::command::{self, Command, EventLine, Reply, Response};
use crate::limits::MAX_LINE_LEN;
use crate::notify::{NotifyHub, ScheduleEvent};
use crate::observability::{self, command_label};
use crate::schedule::{ScheduleError, Scheduler, ValidationError};

pub type WireError = Box<dyn std::error::Error + Send + Sync>;

type Lines = Framed<TcpStream, LinesCodec>;

/// The user a connection listens for, with its receiver.
struct Subscription {
    user_id: String,
    rx: broadcast::Receiver<ScheduleEvent>,
}

/// Serve one client: a JSON request per line, a JSON response per line.
///
/// After a successful `subscribe`, events for that user are written between
/// responses as `{"event":…}` lines. A bad request gets an error response and
/// the connection stays open; an over-long line is answered and then closed.
pub async fn process_connection(
    socket: TcpStream,
    scheduler: Arc<Scheduler>,
    hub: Arc<NotifyHub>,
) -> Result<(), WireError> {
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut subscription: Option<Subscription> = None;

    let result = loop {
        tokio::select! {
            frame = lines.next() => {
                let line = match frame {
                    None => break Ok(()),
                    Some(Ok(line)) => line,
                    // the codec stream ends after any decode error
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("request line over {MAX_LINE_LEN} bytes, closing connection");
                        let e = ScheduleError::LimitExceeded("request line too long");
                        break send(&mut lines, &Response::from(Err::<Reply, _>(e))).await;
                    }
                    Some(Err(e)) => break Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&scheduler, &hub, &line, &mut subscription).await;
                if let Err(e) = send(&mut lines, &response).await {
                    break Err(e);
                }
            }
            event = next_event(&mut subscription) => {
                match event {
                    Ok(event) => {
                        if let Err(e) = send(&mut lines, &EventLine { event: &event }).await {
                            break Err(e);
                        }
                    }
                    Err(RecvError::Lagged(n)) => warn!("subscriber lagged, {n} events dropped"),
                    Err(RecvError::Closed) => subscription = None,
                }
            }
        }
    };

    if let Some(sub) = subscription.take() {
        unsubscribe(&hub, sub);
    }
    result
}

async fn handle_line(
    scheduler: &Scheduler,
    hub: &NotifyHub,
    line: &str,
    subscription: &mut Option<Subscription>,
) -> Response {
    let start = Instant::now();
    let cmd = match command::parse(line) {
        Ok(cmd) => cmd,
        Err(e) => {
            debug!("undecodable request: {e}");
            metrics::counter!(observability::COMMANDS_TOTAL, "command" => "unknown", "status" => e.kind())
                .increment(1);
            return Response::from(Err::<Reply, _>(e));
        }
    };

    let label = command_label(&cmd);
    let subscribe_to = match &cmd {
        Command::Subscribe { user_id } => Some(user_id.clone()),
        _ => None,
    };
    let result = command::execute(scheduler, hub, cmd).await;

    if let (Ok(_), Some(user_id)) = (&result, subscribe_to) {
        if let Some(previous) = subscription.take() {
            unsubscribe(hub, previous);
        }
        let rx = hub.subscribe(&user_id);
        debug!("subscribed to events for {user_id}");
        *subscription = Some(Subscription { user_id, rx });
    }

    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(observability::COMMANDS_TOTAL, "command" => label, "status" => status)
        .increment(1);
    metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
        .record(start.elapsed().as_secs_f64());
    result.into()
}

/// Never resolves without a subscription, so the select arm stays idle.
async fn next_event(subscription: &mut Option<Subscription>) -> Result<ScheduleEvent, RecvError> {
    match subscription {
        Some(sub) => sub.rx.recv().await,
        None => std::future::pending().await,
    }
}

fn unsubscribe(hub: &NotifyHub, sub: Subscription) {
    let Subscription { user_id, rx } = sub;
    drop(rx);
    hub.release(&user_id);
}

async fn send<T: Serialize>(lines: &mut Lines, message: &T) -> Result<(), WireError> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!("cannot encode response: {e}");
            let fallback = ScheduleError::Validation(ValidationError::Malformed(e.to_string()));
            serde_json::to_string(&Response::from(Err::<Reply, _>(fallback)))?
        }
    };
    lines.send(text).await?;
    Ok(())
}
