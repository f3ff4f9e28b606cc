//! Register/disconnect handshake, frame relay, and protocol-violation
//! handling over the TCP transport.

use conductor::core::keys::{FederateId, RouteId};
use conductor::core::time::Time;
use conductor::federation::{
    comms::{tcp, RouteTable},
    frame::{Frame, FrameCodec},
    messages::{Action, ActionMessage},
    Broker,
};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

async fn serve_broker(name: &str) -> (std::sync::Arc<Broker>, std::net::SocketAddr) {
    let broker = Broker::new(name);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(tcp::serve(broker.clone(), listener));
    (broker, addr)
}

async fn next_message(framed: &mut Framed<TcpStream, FrameCodec>) -> ActionMessage {
    match framed.next().await.expect("stream ended").expect("io error") {
        Frame::Message(msg) => msg,
        Frame::Violation(violation) => panic!("unexpected violation: {violation}"),
    }
}

#[test_log::test(tokio::test)]
async fn register_handshake_assigns_a_core_id() {
    let (_broker, addr) = serve_broker("wire").await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    let register =
        ActionMessage::new(Action::Register, FederateId::INVALID).with_name("child-core");
    framed.send(register).await.unwrap();

    let reply = next_message(&mut framed).await;
    assert_eq!(reply.action, Action::RegisterReply);
    assert!(reply.dest_id.is_broker(), "core ids are negative");
    assert_eq!(reply.name.as_deref(), Some("wire"));

    framed
        .send(ActionMessage::new(Action::Disconnect, reply.dest_id))
        .await
        .unwrap();
    let ack = next_message(&mut framed).await;
    assert_eq!(ack.action, Action::DisconnectAck);
}

#[test_log::test(tokio::test)]
async fn duplicate_core_names_are_rejected() {
    let (_broker, addr) = serve_broker("wire").await;

    let mut first = Framed::new(TcpStream::connect(addr).await.unwrap(), FrameCodec::new());
    first
        .send(ActionMessage::new(Action::Register, FederateId::INVALID).with_name("core-a"))
        .await
        .unwrap();
    assert_eq!(next_message(&mut first).await.action, Action::RegisterReply);

    let mut second = Framed::new(TcpStream::connect(addr).await.unwrap(), FrameCodec::new());
    second
        .send(ActionMessage::new(Action::Register, FederateId::INVALID).with_name("core-a"))
        .await
        .unwrap();
    let reject = next_message(&mut second).await;
    assert_eq!(reject.action, Action::Error);
    assert!(reject.flags.error());
}

#[test_log::test(tokio::test)]
async fn relayed_control_frames_reach_a_federate_queue() {
    let (broker, addr) = serve_broker("wire").await;
    let (queue, mut inbox) = mpsc::unbounded_channel();
    let fed = broker.register_federate("fed0", Time::EPSILON, queue).unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed
        .send(ActionMessage::new(Action::Register, FederateId::INVALID).with_name("child"))
        .await
        .unwrap();
    let reply = next_message(&mut framed).await;
    let core_id = reply.dest_id;

    let mut request = ActionMessage::new(Action::TimeRequest, core_id).to(fed);
    request.action_time = Time::from_seconds(1.0);
    request.sequence = 1;
    framed.send(request.clone()).await.unwrap();

    let delivered = inbox.recv().await.unwrap();
    assert_eq!(delivered, request);
}

#[test_log::test(tokio::test)]
async fn repeated_violations_tear_the_route_down() {
    let (_broker, addr) = serve_broker("wire").await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed
        .send(ActionMessage::new(Action::Register, FederateId::INVALID).with_name("noisy"))
        .await
        .unwrap();
    assert_eq!(next_message(&mut framed).await.action, Action::RegisterReply);

    // A frame with a bad version byte: dropped and counted, not fatal.
    let bad_frame: &[u8] = &[0, 0, 0, 3, 99, 0, 5];
    let stream = framed.get_mut();
    for _ in 0..16 {
        if stream.write_all(bad_frame).await.is_err() {
            break;
        }
    }
    let _ = stream.flush().await;

    // The violation budget is exhausted; the server closes the link.
    loop {
        match framed.next().await {
            None => break,
            Some(Err(_)) => break,
            Some(Ok(frame)) => panic!("expected teardown, got {frame:?}"),
        }
    }
}

#[test_log::test(tokio::test)]
async fn route_table_establishes_channels_lazily() {
    let (_broker, addr) = serve_broker("lazy").await;

    let (inbound, mut replies) = mpsc::unbounded_channel();
    let mut table = RouteTable::new(inbound);
    table.add_route(RouteId::PARENT, format!("tcp://{addr}"));

    let register =
        ActionMessage::new(Action::Register, FederateId::INVALID).with_name("remote-core");
    table.transmit(RouteId::PARENT, register).await.unwrap();

    let reply = replies.recv().await.unwrap();
    assert_eq!(reply.action, Action::RegisterReply);
    assert_eq!(reply.name.as_deref(), Some("lazy"));
}
