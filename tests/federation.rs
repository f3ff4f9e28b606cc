//! End-to-end federation scenarios over the in-process core.

use conductor::core::time::Time;
use conductor::federation::{
    Broker, Federate, FederateConfig, FilterOperation, IterationRequest, IterationResult,
};

fn seconds(s: f64) -> Time {
    Time::from_seconds(s)
}

fn config(name: &str) -> FederateConfig {
    FederateConfig::new(name).with_min_time_delta(seconds(1.0))
}

#[test_log::test(tokio::test)]
async fn single_federate_publish_subscribe() {
    let broker = Broker::new("single");
    let fed = Federate::create(&broker, config("fed0")).unwrap();
    let pub1 = fed
        .register_global_publication("pub1", "string", None)
        .unwrap();
    let sub1 = fed.register_subscription("pub1").unwrap();

    fed.enter_executing_mode().await.unwrap();

    // Publish at t=0; the value surfaces at the next grant.
    fed.publish(pub1, &b"string1"[..]).unwrap();
    let granted = fed.request_time(seconds(1.0)).await.unwrap();
    assert_eq!(granted, seconds(1.0));
    assert!(fed.is_updated(sub1).unwrap());
    assert_eq!(fed.get_value(sub1).unwrap().as_ref(), b"string1");
    assert!(!fed.is_updated(sub1).unwrap());
    assert_eq!(fed.get_last_update_time(sub1).unwrap(), Time::ZERO);

    // A second publish stays invisible until the next grant.
    fed.publish(pub1, &b"string2"[..]).unwrap();
    assert_eq!(fed.get_value(sub1).unwrap().as_ref(), b"string1");

    let granted = fed.request_time(seconds(2.0)).await.unwrap();
    assert_eq!(granted, seconds(2.0));
    assert_eq!(fed.get_value(sub1).unwrap().as_ref(), b"string2");

    fed.finalize().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn dual_transfer() {
    let broker = Broker::new("dual");
    let f1 = Federate::create(&broker, config("fed0")).unwrap();
    let f2 = Federate::create(&broker, config("fed1")).unwrap();

    let pub1 = f1
        .register_global_publication("pub1", "string", None)
        .unwrap();
    let sub1 = f2.register_subscription("pub1").unwrap();

    let (r1, r2) = tokio::join!(f1.enter_executing_mode(), f2.enter_executing_mode());
    r1.unwrap();
    r2.unwrap();

    f1.publish(pub1, &b"string1"[..]).unwrap();
    let (g1, g2) = tokio::join!(f1.request_time(seconds(1.0)), f2.request_time(seconds(1.0)));
    assert_eq!(g1.unwrap(), seconds(1.0));
    assert_eq!(g2.unwrap(), seconds(1.0));
    assert_eq!(f2.get_value(sub1).unwrap().as_ref(), b"string1");

    // Published at t=1.0: invisible to fed1 until it is granted past 1.0.
    f1.publish(pub1, &b"string2"[..]).unwrap();
    assert_eq!(f2.get_value(sub1).unwrap().as_ref(), b"string1");

    let (g1, g2) = tokio::join!(f1.request_time(seconds(2.0)), f2.request_time(seconds(2.0)));
    assert_eq!(g1.unwrap(), seconds(2.0));
    assert_eq!(g2.unwrap(), seconds(2.0));
    assert_eq!(f2.get_value(sub1).unwrap().as_ref(), b"string2");

    let (r1, r2) = tokio::join!(f1.finalize(), f2.finalize());
    r1.unwrap();
    r2.unwrap();
}

#[test_log::test(tokio::test)]
async fn initialization_publish_is_visible_at_startup() {
    let broker = Broker::new("init");
    let fed = Federate::create(&broker, config("fed0")).unwrap();
    let pub1 = fed
        .register_global_publication("pub1", "double", None)
        .unwrap();
    let sub1 = fed.register_subscription("pub1").unwrap();

    fed.enter_initializing_mode().await.unwrap();
    fed.publish(pub1, &b"1.0"[..]).unwrap();

    fed.enter_executing_mode().await.unwrap();
    // Visible before the first requestTime.
    assert!(fed.is_updated(sub1).unwrap());
    assert_eq!(fed.get_value(sub1).unwrap().as_ref(), b"1.0");
    fed.finalize().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn broker_data_link_before_registration() {
    let broker = Broker::new("datalink");
    // Neither side exists yet.
    broker.data_link("pub1", "inp1").unwrap();

    let f1 = Federate::create(&broker, config("fed0")).unwrap();
    let f2 = Federate::create(&broker, config("fed1")).unwrap();
    let pub1 = f1
        .register_global_publication("pub1", "string", None)
        .unwrap();
    let inp1 = f2.register_global_input("inp1", "string").unwrap();

    let (r1, r2) = tokio::join!(f1.enter_executing_mode(), f2.enter_executing_mode());
    r1.unwrap();
    r2.unwrap();

    f1.publish(pub1, &b"string1"[..]).unwrap();
    let (g1, g2) = tokio::join!(f1.request_time(seconds(1.0)), f2.request_time(seconds(1.0)));
    assert_eq!(g1.unwrap(), seconds(1.0));
    assert_eq!(g2.unwrap(), seconds(1.0));
    assert_eq!(f2.get_value(inp1).unwrap().as_ref(), b"string1");

    f1.publish(pub1, &b"string2"[..]).unwrap();
    let (g1, g2) = tokio::join!(f1.request_time(seconds(2.0)), f2.request_time(seconds(2.0)));
    assert_eq!(g1.unwrap(), seconds(2.0));
    assert_eq!(g2.unwrap(), seconds(2.0));
    assert_eq!(f2.get_value(inp1).unwrap().as_ref(), b"string2");
}

#[test_log::test(tokio::test)]
async fn delay_filter_shifts_message_delivery() {
    let broker = Broker::new("delayed");
    let f1 = Federate::create(&broker, config("fed0")).unwrap();
    let f2 = Federate::create(&broker, config("fed1")).unwrap();

    let ep1 = f1.register_global_endpoint("ep1").unwrap();
    let ep2 = f2.register_global_endpoint("ep2").unwrap();

    let filter = f1.register_filter("delay_half").unwrap();
    f1.set_filter(filter, FilterOperation::delay(seconds(0.5)))
        .unwrap();
    f1.add_filter_source_target(filter, "ep1").unwrap();

    let (r1, r2) = tokio::join!(f1.enter_executing_mode(), f2.enter_executing_mode());
    r1.unwrap();
    r2.unwrap();

    let granted = f1.request_time(seconds(1.0)).await.unwrap();
    assert_eq!(granted, seconds(1.0));
    f1.send_message(ep1, "ep2", &b"pulse"[..]).unwrap();

    // The message left at 1.0 and is observable at the grant covering 1.5.
    let granted = f2.request_time(seconds(1.5)).await.unwrap();
    assert_eq!(granted, seconds(1.5));
    assert!(f2.has_message(ep2).unwrap());
    let msg = f2.get_message(ep2).unwrap().unwrap();
    assert_eq!(msg.time, seconds(1.5));
    assert_eq!(msg.payload.as_ref(), b"pulse");
    assert!(!f2.has_message(ep2).unwrap());
}

#[test_log::test(tokio::test)]
async fn iterating_exec_entry_converges_at_iteration_one() {
    let broker = Broker::new("iterate");
    let feds: Vec<Federate> = (0..3)
        .map(|i| Federate::create(&broker, config(&format!("fed{i}"))).unwrap())
        .collect();

    // All-to-all coupling: every federate subscribes to both others.
    for (i, fed) in feds.iter().enumerate() {
        fed.register_global_publication(&format!("p{i}"), "double", None)
            .unwrap();
    }
    for (i, fed) in feds.iter().enumerate() {
        for j in 0..3 {
            if i != j {
                fed.register_subscription(&format!("p{j}")).unwrap();
            }
        }
    }

    let iterating = feds[1].enter_executing_mode_iterative(IterationRequest::ForceIteration);
    let (r0, r1, r2) = tokio::join!(
        feds[0].enter_executing_mode(),
        iterating,
        feds[2].enter_executing_mode(),
    );
    r0.unwrap();
    assert_eq!(r1.unwrap(), IterationResult::Iterating);
    r2.unwrap();

    // The iterating federate resumes and completes at the same counter.
    feds[1].enter_executing_mode().await.unwrap();

    for fed in &feds {
        assert_eq!(fed.granted_time(), Time::ZERO);
        assert_eq!(fed.current_iteration(), 1);
    }
}

#[test_log::test(tokio::test)]
async fn update_callback_fires_on_grant() {
    use std::sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    };

    let broker = Broker::new("callbacks");
    let fed = Federate::create(&broker, config("fed0")).unwrap();
    let pub1 = fed
        .register_global_publication("pub1", "string", None)
        .unwrap();
    let sub1 = fed.register_subscription("pub1").unwrap();

    let seen = Arc::new(AtomicI64::new(-1));
    {
        let seen = Arc::clone(&seen);
        fed.on_input_update(sub1, move |_, time| {
            seen.store(time.as_nanos(), Ordering::SeqCst);
        })
        .unwrap();
    }

    fed.enter_executing_mode().await.unwrap();
    fed.publish(pub1, &b"x"[..]).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), -1);

    fed.request_time(seconds(1.0)).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), Time::ZERO.as_nanos());
}

#[test_log::test(tokio::test)]
async fn two_federations_in_one_process_are_isolated() {
    let broker_a = Broker::new("fedA");
    let broker_b = Broker::new("fedB");

    let fa = Federate::create(&broker_a, config("fed0")).unwrap();
    let fb = Federate::create(&broker_b, config("fed0")).unwrap();

    let pa = fa
        .register_global_publication("pub1", "string", None)
        .unwrap();
    let sa = fa.register_subscription("pub1").unwrap();
    let sb = fb.register_subscription("pub1").unwrap();
    fb.register_global_publication("pub1", "string", None)
        .unwrap();

    let (ra, rb) = tokio::join!(fa.enter_executing_mode(), fb.enter_executing_mode());
    ra.unwrap();
    rb.unwrap();

    fa.publish(pa, &b"only-A"[..]).unwrap();
    let (ga, gb) = tokio::join!(fa.request_time(seconds(1.0)), fb.request_time(seconds(1.0)));
    ga.unwrap();
    gb.unwrap();

    assert_eq!(fa.get_value(sa).unwrap().as_ref(), b"only-A");
    assert!(!fb.is_updated(sb).unwrap());
    assert!(fb.get_value(sb).unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn finalize_unblocks_a_waiting_peer() {
    let broker = Broker::new("departure");
    let f1 = Federate::create(&broker, config("fed0")).unwrap();
    let f2 = Federate::create(&broker, config("fed1")).unwrap();

    let pub1 = f1
        .register_global_publication("pub1", "string", None)
        .unwrap();
    f2.register_subscription("pub1").unwrap();
    let _ = pub1;

    let (r1, r2) = tokio::join!(f1.enter_executing_mode(), f2.enter_executing_mode());
    r1.unwrap();
    r2.unwrap();

    // fed1 waits on fed0, which leaves instead of advancing: the departure
    // removes the dependency and the grant completes.
    let (done, granted) = tokio::join!(f1.finalize(), f2.request_time(seconds(5.0)));
    done.unwrap();
    assert_eq!(granted.unwrap(), seconds(5.0));
}
