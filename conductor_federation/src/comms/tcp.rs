//! TCP transport adapter: framed action-message links plus the parent-side
//! listener that performs the register/disconnect handshake with child cores.

use std::sync::Arc;

use conductor_core::keys::FederateId;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::Framed;

use crate::{
    broker::Broker,
    frame::{Frame, FrameCodec},
    messages::{Action, ActionMessage, MessageFlags},
};

use super::{CommsError, ViolationBudget};

/// An established outbound link. Dropping the sender closes the writer.
#[derive(Debug)]
pub struct TcpLink {
    pub sender: mpsc::UnboundedSender<ActionMessage>,
    pub writer: JoinHandle<()>,
    pub reader: JoinHandle<()>,
}

/// Connect to a peer and pump received frames into `inbound`.
pub async fn connect(
    addr: &str,
    inbound: mpsc::UnboundedSender<ActionMessage>,
) -> Result<TcpLink, CommsError> {
    let stream = TcpStream::connect(addr).await?;
    tracing::info!(%addr, "Connected outbound route.");
    let framed = Framed::new(stream, FrameCodec::new());
    let (sink, mut frames) = framed.split();

    let (sender, outbound) = mpsc::unbounded_channel::<ActionMessage>();
    let writer = tokio::spawn(async move {
        let mut forward = UnboundedReceiverStream::new(outbound).map(Ok).forward(sink);
        if let Err(err) = (&mut forward).await {
            tracing::warn!(%err, "Outbound route writer stopped.");
        }
    });

    let reader = tokio::spawn(async move {
        let mut budget = ViolationBudget::default();
        while let Some(item) = frames.next().await {
            match item {
                Ok(Frame::Message(msg)) => {
                    if inbound.send(msg).is_err() {
                        break;
                    }
                }
                Ok(Frame::Violation(violation)) => {
                    if budget.record(&violation) {
                        tracing::error!("Violation budget exhausted; tearing route down.");
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "Route read error.");
                    break;
                }
            }
        }
    });

    Ok(TcpLink {
        sender,
        writer,
        reader,
    })
}

/// Accept child-core connections for a broker until the listener is dropped.
///
/// Each connection must open with `Register`; the broker assigns the core id
/// and answers `RegisterReply` carrying it along with the federation id.
pub async fn serve(broker: Arc<Broker>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::info!(%addr, "Incoming core connection.");
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    if let Err(err) = handle_core_link(broker, stream).await {
                        tracing::warn!(%addr, %err, "Core link ended with an error.");
                    }
                });
            }
            Err(err) => {
                tracing::error!(%err, "Failed to accept a core connection.");
            }
        }
    }
}

async fn handle_core_link(broker: Arc<Broker>, stream: TcpStream) -> Result<(), CommsError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    // Handshake: the first frame must be a Register naming the child core.
    match framed.next().await {
        Some(Ok(Frame::Message(msg))) if msg.action == Action::Register => {
            let name = msg.name.clone().unwrap_or_default();
            let (sender, mut outbound) = mpsc::unbounded_channel();
            match broker.register_core_link(&name, sender) {
                Ok((core_id, federation)) => {
                    let mut reply = ActionMessage::new(Action::RegisterReply, broker.id());
                    reply.dest_id = core_id;
                    reply.name = Some(federation);
                    framed.send(reply).await?;
                    tracing::info!(%core_id, name, "Registered child core.");

                    let result = relay(&broker, core_id, &mut framed, &mut outbound).await;
                    broker.drop_core_link(core_id);
                    result
                }
                Err(err) => {
                    let mut reject = ActionMessage::new(Action::Error, broker.id());
                    reject.flags = MessageFlags::default().with_error();
                    reject.name = Some(err.to_string());
                    framed.send(reject).await?;
                    framed.close().await?;
                    Err(CommsError::Rejected(err.to_string()))
                }
            }
        }
        Some(Ok(Frame::Message(msg))) => {
            tracing::warn!(%msg, "Expected Register as the first frame.");
            framed.close().await?;
            Err(CommsError::UnexpectedClose)
        }
        Some(Ok(Frame::Violation(violation))) => {
            framed.close().await?;
            Err(violation.into())
        }
        Some(Err(err)) => Err(err.into()),
        None => Err(CommsError::UnexpectedClose),
    }
}

/// Pump frames between an accepted core link and the broker fabric.
async fn relay(
    broker: &Arc<Broker>,
    core_id: FederateId,
    framed: &mut Framed<TcpStream, FrameCodec>,
    outbound: &mut mpsc::UnboundedReceiver<ActionMessage>,
) -> Result<(), CommsError> {
    let mut budget = ViolationBudget::default();
    loop {
        tokio::select! {
            // Traffic for the child core, relayed out over the socket.
            out = outbound.recv() => {
                match out {
                    Some(msg) => framed.send(msg).await?,
                    None => return Ok(()),
                }
            }
            // Frames from the child core.
            item = framed.next() => {
                match item {
                    Some(Ok(Frame::Message(msg))) => match msg.action {
                        Action::Disconnect => {
                            let mut ack = ActionMessage::new(Action::DisconnectAck, broker.id());
                            ack.dest_id = core_id;
                            framed.send(ack).await?;
                            framed.close().await?;
                            tracing::info!(%core_id, "Core disconnected cleanly.");
                            return Ok(());
                        }
                        _ => broker.route(msg),
                    },
                    Some(Ok(Frame::Violation(violation))) => {
                        if budget.record(&violation) {
                            framed.close().await?;
                            return Err(violation.into());
                        }
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(CommsError::UnexpectedClose),
                }
            }
        }
    }
}
