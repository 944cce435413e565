//! End-to-end broker scenarios over real sockets.
//!
//! Each test binds an ephemeral listener on localhost and drives it with
//! the blocking client. SMQ SUBSCRIBE has no acknowledgement, so tests use
//! a PING round-trip as an ordering barrier after subscribing.

use std::{path::Path, thread, time::Duration};

use smq_broker::{
    Broker, BrokerError, Client, ClientOptions, Multiplexer,
    config::{AuthConfig, Config, StoreConfig},
};
use smq_wire::{ConnectReturn, Protocol, QoS};

const RECV: Duration = Duration::from_secs(2);

fn test_config(protocol: Protocol, store_root: Option<&Path>) -> Config {
    let mut cfg = Config::default();
    cfg.listen.address = "127.0.0.1".to_string();
    cfg.protocol = protocol;
    cfg.auth = Some(AuthConfig { username: "u".to_string(), password: "p".to_string() });
    cfg.delivery.workers = 4;
    cfg.store = store_root.map(|root| StoreConfig {
        root: root.to_path_buf(),
        bucket_size: 256 * 1024,
    });
    cfg
}

fn start(protocol: Protocol, store_root: Option<&Path>) -> Broker {
    start_with(test_config(protocol, store_root))
}

fn start_with(cfg: Config) -> Broker {
    Broker::start(cfg, Multiplexer::new().unwrap()).unwrap()
}

fn connect(broker: &Broker, protocol: Protocol, client_id: &str) -> Client {
    Client::connect(broker.local_addr(), ClientOptions::new(client_id, "u", "p").protocol(protocol))
        .unwrap()
}

/// Subscribe, then round-trip a ping so the broker has processed it.
fn subscribe(client: &mut Client, destination: &str, qos: QoS) {
    client.subscribe(destination, qos).unwrap();
    client.ping().unwrap();
}

fn recv_bodies(client: &mut Client, n: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let msg = client.receive(RECV).unwrap().expect("expected a delivery");
        if msg.qos == QoS::AtLeastOnce {
            client.ack(msg.id).unwrap();
        }
        out.push(String::from_utf8(msg.body.to_vec()).unwrap());
    }
    out
}

#[test]
fn s1_topic_fanout_preserves_order() {
    let broker = start(Protocol::Smq, None);
    let mut c1 = connect(&broker, Protocol::Smq, "c1");
    let mut c2 = connect(&broker, Protocol::Smq, "c2");
    subscribe(&mut c1, "/topic/news", QoS::AtMostOnce);
    subscribe(&mut c2, "/topic/news", QoS::AtMostOnce);

    let mut producer = connect(&broker, Protocol::Smq, "p1");
    for body in ["a", "b", "c"] {
        producer.publish("/topic/news", body, QoS::AtMostOnce).unwrap();
    }

    assert_eq!(recv_bodies(&mut c1, 3), vec!["a", "b", "c"]);
    assert_eq!(recv_bodies(&mut c2, 3), vec!["a", "b", "c"]);
    broker.stop();
}

#[test]
fn s2_queue_round_robin_splits_the_work() {
    let broker = start(Protocol::Smq, None);
    let mut c1 = connect(&broker, Protocol::Smq, "c1");
    let mut c2 = connect(&broker, Protocol::Smq, "c2");
    subscribe(&mut c1, "/queue/work", QoS::AtMostOnce);
    subscribe(&mut c2, "/queue/work", QoS::AtMostOnce);

    let mut producer = connect(&broker, Protocol::Smq, "p1");
    for body in ["1", "2", "3", "4"] {
        producer.publish("/queue/work", body, QoS::AtMostOnce).unwrap();
    }

    let got1 = recv_bodies(&mut c1, 2);
    let got2 = recv_bodies(&mut c2, 2);

    // no fifth delivery anywhere
    assert!(c1.receive(Duration::from_millis(200)).unwrap().is_none());
    assert!(c2.receive(Duration::from_millis(200)).unwrap().is_none());

    // union is complete and disjoint
    let mut all: Vec<String> = got1.iter().chain(got2.iter()).cloned().collect();
    all.sort();
    assert_eq!(all, vec!["1", "2", "3", "4"]);

    // per consumer, relative order matches the producer
    for got in [&got1, &got2] {
        let mut sorted = got.clone();
        sorted.sort();
        assert_eq!(*got, sorted);
    }
    broker.stop();
}

#[test]
fn s3_queue_retention_replays_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let broker = start(Protocol::Smq, Some(tmp.path()));

    let mut producer = connect(&broker, Protocol::Smq, "p1");
    producer.publish("/queue/late", "x", QoS::AtLeastOnce).unwrap();
    producer.publish("/queue/late", "y", QoS::AtLeastOnce).unwrap();

    let mut consumer = connect(&broker, Protocol::Smq, "c1");
    subscribe(&mut consumer, "/queue/late", QoS::AtLeastOnce);

    assert_eq!(recv_bodies(&mut consumer, 2), vec!["x", "y"]);

    // give the acks a moment to settle, then look at the store directly
    thread::sleep(Duration::from_millis(300));
    broker.stop();
    let store = smq_store::PersistentStore::open(tmp.path(), "broker", 256 * 1024).unwrap();
    let list = store.list("/queue/late").unwrap();
    assert!(list.is_empty(), "retained list must be empty after acks");
}

#[test]
fn retained_messages_survive_a_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let broker = start(Protocol::Smq, Some(tmp.path()));
        let mut producer = connect(&broker, Protocol::Smq, "p1");
        producer.publish("/queue/jobs", "j1", QoS::AtLeastOnce).unwrap();
        producer.publish("/queue/jobs", "j2", QoS::AtLeastOnce).unwrap();
        producer.disconnect().unwrap();
        broker.stop();
    }

    let broker = start(Protocol::Smq, Some(tmp.path()));
    let mut consumer = connect(&broker, Protocol::Smq, "c1");
    subscribe(&mut consumer, "/queue/jobs", QoS::AtLeastOnce);
    assert_eq!(recv_bodies(&mut consumer, 2), vec!["j1", "j2"]);
    broker.stop();
}

#[test]
fn s4_wrong_password_gets_a_negative_connack() {
    let broker = start(Protocol::Smq, None);
    let mut anchor = connect(&broker, Protocol::Smq, "anchor");
    anchor.ping().unwrap();
    let baseline = broker.connection_count();

    let outcome = Client::connect(
        broker.local_addr(),
        ClientOptions::new("c1", "u", "wrong"),
    );
    match outcome {
        Err(BrokerError::Rejected(ConnectReturn::AuthFailed)) => {}
        Err(e) => panic!("expected auth_failed, got {e:?}"),
        Ok(_) => panic!("expected auth_failed, got a session"),
    }

    // the refused transport closes within a second
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    loop {
        if broker.connection_count() == baseline {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "refused connection lingered");
        thread::sleep(Duration::from_millis(20));
    }
    anchor.ping().unwrap();
    broker.stop();
}

#[test]
fn s5_client_id_collision_leaves_the_holder_alone() {
    let broker = start(Protocol::Smq, None);
    let mut first = connect(&broker, Protocol::Smq, "c1");
    subscribe(&mut first, "/topic/t", QoS::AtMostOnce);

    let second = Client::connect(broker.local_addr(), ClientOptions::new("c1", "u", "p"));
    match second {
        Err(BrokerError::Rejected(ConnectReturn::ClientIdInUse)) => {}
        Err(e) => panic!("expected client_id_in_use, got {e:?}"),
        Ok(_) => panic!("expected client_id_in_use, got a session"),
    }

    // the original session keeps working
    let mut producer = connect(&broker, Protocol::Smq, "p1");
    producer.publish("/topic/t", "still-here", QoS::AtMostOnce).unwrap();
    assert_eq!(recv_bodies(&mut first, 1), vec!["still-here"]);
    broker.stop();
}

#[test]
fn unsubscribe_stops_deliveries() {
    let broker = start(Protocol::Smq, None);
    let mut consumer = connect(&broker, Protocol::Smq, "c1");
    subscribe(&mut consumer, "/topic/t", QoS::AtMostOnce);

    let mut producer = connect(&broker, Protocol::Smq, "p1");
    producer.publish("/topic/t", "first", QoS::AtMostOnce).unwrap();
    assert_eq!(recv_bodies(&mut consumer, 1), vec!["first"]);

    consumer.unsubscribe("/topic/t").unwrap();
    consumer.ping().unwrap();
    producer.publish("/topic/t", "second", QoS::AtMostOnce).unwrap();
    assert!(consumer.receive(Duration::from_millis(300)).unwrap().is_none());
    broker.stop();
}

#[test]
fn mqtt_publish_subscribe_with_acks() {
    let broker = start(Protocol::Mqtt, None);
    let mut c1 = connect(&broker, Protocol::Mqtt, "c1");
    let mut c2 = connect(&broker, Protocol::Mqtt, "c2");
    // MQTT subscribes are acknowledged with SUBACK, no barrier needed
    c1.subscribe("/topic/news", QoS::AtLeastOnce).unwrap();
    c2.subscribe("/topic/news", QoS::AtLeastOnce).unwrap();

    let mut producer = connect(&broker, Protocol::Mqtt, "p1");
    for body in ["a", "b", "c"] {
        producer.publish("/topic/news", body, QoS::AtLeastOnce).unwrap();
    }

    assert_eq!(recv_bodies(&mut c1, 3), vec!["a", "b", "c"]);
    assert_eq!(recv_bodies(&mut c2, 3), vec!["a", "b", "c"]);
    broker.stop();
}

#[test]
fn queue_missed_ack_is_redelivered_to_the_next_subscriber() {
    let mut cfg = test_config(Protocol::Smq, None);
    cfg.delivery.ack_timeout_ms = 300;
    let broker = start_with(cfg);

    let mut c1 = connect(&broker, Protocol::Smq, "c1");
    let mut c2 = connect(&broker, Protocol::Smq, "c2");
    subscribe(&mut c1, "/queue/retry", QoS::AtLeastOnce);
    subscribe(&mut c2, "/queue/retry", QoS::AtLeastOnce);

    let mut producer = connect(&broker, Protocol::Smq, "p1");
    producer.publish("/queue/retry", "m", QoS::AtLeastOnce).unwrap();

    // round-robin hands the message to c1 first; c1 never acks it
    let first = c1.receive(RECV).unwrap().expect("first delivery");
    assert_eq!(first.body.as_ref(), b"m");

    // after the ack window lapses the broker re-enqueues for the same
    // destination, and the cursor points at c2
    let second = c2.receive(RECV).unwrap().expect("redelivery");
    assert_eq!(second.body.as_ref(), b"m");
    c2.ack(second.id).unwrap();

    // one miss is below the limit; the slow subscriber stays connected
    c1.ping().unwrap();
    broker.stop();
}

#[test]
fn topic_missed_ack_is_not_refanned() {
    let mut cfg = test_config(Protocol::Smq, None);
    cfg.delivery.ack_timeout_ms = 300;
    cfg.delivery.max_ack_misses = 2;
    let broker = start_with(cfg);

    let mut c1 = connect(&broker, Protocol::Smq, "c1");
    let mut c2 = connect(&broker, Protocol::Smq, "c2");
    subscribe(&mut c1, "/topic/once", QoS::AtLeastOnce);
    subscribe(&mut c2, "/topic/once", QoS::AtLeastOnce);

    let mut producer = connect(&broker, Protocol::Smq, "p1");
    producer.publish("/topic/once", "t1", QoS::AtLeastOnce).unwrap();
    producer.publish("/topic/once", "t2", QoS::AtLeastOnce).unwrap();

    // c1 acknowledges everything, c2 acknowledges nothing
    assert_eq!(recv_bodies(&mut c1, 2), vec!["t1", "t2"]);
    for _ in 0..2 {
        c2.receive(RECV).unwrap().expect("fan-out delivery");
    }

    // let both of c2's ack windows lapse; topic deliveries are best-effort,
    // so the healthy subscriber must not see duplicates
    thread::sleep(Duration::from_millis(600));
    assert!(c1.receive(Duration::from_millis(500)).unwrap().is_none());

    // the unresponsive subscriber hit max_ack_misses and was closed
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        match c2.receive(Duration::from_millis(200)) {
            Err(BrokerError::PeerClosed | BrokerError::Io(_)) => break,
            Ok(Some(msg)) => panic!("unexpected duplicate: {msg:?}"),
            Ok(None) | Err(_) => {
                assert!(
                    std::time::Instant::now() < deadline,
                    "unresponsive subscriber was never closed"
                );
            }
        }
    }
    broker.stop();
}

#[test]
fn concurrent_producers_fan_out_without_loss() {
    const PRODUCERS: usize = 3;
    const CONSUMERS: usize = 2;
    const PER_PRODUCER: usize = 20;

    let broker = start(Protocol::Smq, None);

    let mut consumers: Vec<Client> = (0..CONSUMERS)
        .map(|n| {
            let mut c = connect(&broker, Protocol::Smq, &format!("consumer-{n}"));
            subscribe(&mut c, "/topic/load", QoS::AtLeastOnce);
            c
        })
        .collect();

    let addr = broker.local_addr();
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            thread::spawn(move || {
                let mut client = Client::connect(
                    addr,
                    ClientOptions::new(&format!("producer-{p}"), "u", "p"),
                )
                .unwrap();
                for k in 0..PER_PRODUCER {
                    client
                        .publish("/topic/load", format!("{p}:{k}").into_bytes(), QoS::AtLeastOnce)
                        .unwrap();
                }
                client.disconnect().unwrap();
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    for consumer in &mut consumers {
        let got = recv_bodies(consumer, PRODUCERS * PER_PRODUCER);

        // no duplicates, no losses
        let mut unique = got.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER);

        // per-producer order is preserved per consumer
        for p in 0..PRODUCERS {
            let ks: Vec<usize> = got
                .iter()
                .filter_map(|body| {
                    let (producer, k) = body.split_once(':')?;
                    (producer == p.to_string()).then(|| k.parse().unwrap())
                })
                .collect();
            assert_eq!(ks, (0..PER_PRODUCER).collect::<Vec<_>>());
        }
    }
    broker.stop();
}
