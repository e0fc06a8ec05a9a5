use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use courier::{
    Broker, BrokerConfig, DeadLetterReason, DeadLetterStore, DeliveryState,
    InMemoryDeadLetterStore, RequeueError, SettleError, SubscriptionConfig, TryRecvError,
};
use tokio::time::{self, Instant};

fn config() -> BrokerConfig {
    BrokerConfig::default()
        .with_retry_delays(Duration::from_millis(100), Duration::from_secs(30))
        .with_retry_jitter(0.0)
}

fn payload_str(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Тест проверяет маршрутизацию по точным и wildcard шаблонам.
#[tokio::test(start_paused = true)]
async fn test_topic_routing() -> Result<(), Box<dyn std::error::Error>> {
    let broker = Broker::new(config());
    let single = broker.subscribe_with_defaults("orders.*")?;
    let rest = broker.subscribe_with_defaults("orders.**")?;
    let exact = broker.subscribe_with_defaults("orders.created")?;
    let users = broker.subscribe_with_defaults("users.created")?;

    broker.publish("orders.created", "o1").await?;
    broker.publish("orders.created.eu", "o2").await?;
    broker.publish("users.created", "u1").await?;

    let drain = |id| {
        let mut got = Vec::new();
        while let Ok(d) = broker.try_receive(id) {
            got.push(payload_str(d.payload()));
            broker.ack(d.token()).unwrap();
        }
        got
    };

    assert_eq!(drain(single), vec!["o1"]);
    assert_eq!(drain(rest), vec!["o1", "o2"]);
    assert_eq!(drain(exact), vec!["o1"]);
    assert_eq!(drain(users), vec!["u1"]);
    assert_eq!(broker.in_flight(), 0);
    assert_eq!(broker.metrics().acked, 5);
    Ok(())
}

/// Тест проверяет, что поздний подписчик не получает старые сообщения.
#[tokio::test(start_paused = true)]
async fn test_no_retroactive_delivery() -> Result<(), Box<dyn std::error::Error>> {
    let broker = Broker::new(config());
    broker.publish("news", "before").await?;

    let sub = broker.subscribe_with_defaults("news")?;
    assert_eq!(broker.try_receive(sub).unwrap_err(), TryRecvError::Empty);

    broker.publish("news", "after").await?;
    let d = broker.try_receive(sub)?;
    assert_eq!(payload_str(d.payload()), "after");
    Ok(())
}

/// Тест проверяет, что после трёх nack сообщение уходит в dead-letter
/// только после всей цепочки задержек (100ms + 200ms + 400ms), но не
/// раньше.
#[tokio::test(start_paused = true)]
async fn test_retries_then_dead_letter() -> Result<(), Box<dyn std::error::Error>> {
    let broker = Broker::new(config());
    let sub = broker.subscribe("jobs", SubscriptionConfig::new(16, Duration::from_secs(30), 3))?;

    let start = Instant::now();
    let id = broker.publish("jobs", "payload").await?;

    let mut last = None;
    for attempt in 1..=3 {
        let d = broker.receive_timeout(sub, Duration::from_secs(5)).await?;
        assert_eq!(d.message().id, id);
        assert_eq!(d.attempt(), attempt);
        assert_eq!(broker.dead_letter_count(), 0, "dead-lettered too early");
        broker.nack(d.token(), format!("handler failed #{attempt}"))?;
        last = Some((d.token(), Instant::now()));
    }

    // последний nack после задержек 100ms + 200ms
    let (token, nacked_at) = last.expect("three attempts received");
    let elapsed = nacked_at - start;
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
    let rec = broker.delivery_record(token).expect("record is still tracked");
    assert_eq!(rec.state, DeliveryState::Nacked);
    assert_eq!(rec.attempt, 3);
    assert_eq!(rec.last_error.as_deref(), Some("handler failed #3"));
    assert_eq!(rec.next_retry_at, Some(nacked_at + Duration::from_millis(400)));
    assert_eq!(broker.in_flight(), 1);

    time::sleep_until(nacked_at + Duration::from_millis(399)).await;
    assert_eq!(broker.dead_letter_count(), 0, "dead-lettered too early");

    time::sleep_until(nacked_at + Duration::from_millis(410)).await;
    assert!(start.elapsed() >= Duration::from_millis(700));
    assert!(broker.delivery_record(token).is_none());
    let dead = broker.drain_dead_letters(10);
    assert_eq!(dead.len(), 1);
    let entry = &dead[0];
    assert_eq!(entry.reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(entry.message().id, id);
    assert_eq!(entry.subscription_id(), sub);
    assert_eq!(entry.attempts(), 3);
    assert_eq!(entry.last_error(), Some("handler failed #3"));

    let m = broker.metrics();
    assert_eq!(m.nacked, 3);
    assert_eq!(m.retried, 2);
    assert_eq!(m.dead_lettered, 1);
    assert_eq!(broker.in_flight(), 0);
    Ok(())
}

/// Тест проверяет отписку при наличии Pending записи: доставка, которая
/// ждала места в ящике, попадает в dead-letter как `SubscriberGone`.
#[tokio::test(start_paused = true)]
async fn test_unsubscribe_with_pending_delivery() -> Result<(), Box<dyn std::error::Error>> {
    let broker = Arc::new(Broker::new(
        config().with_enqueue_timeout(Duration::from_secs(10)),
    ));
    let sub = broker.subscribe("jobs", SubscriptionConfig::default().with_mailbox_capacity(1))?;

    let first = broker.publish("jobs", "first").await?;
    let blocked = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.publish("jobs", "second").await })
    };
    time::sleep(Duration::from_millis(10)).await;
    assert!(!blocked.is_finished());
    assert_eq!(broker.in_flight(), 2);
    assert_eq!(broker.metrics().delivered, 1);

    assert!(broker.unsubscribe(sub));
    let second = blocked.await??;

    let dead = broker.drain_dead_letters(10);
    let ids: Vec<_> = dead.iter().map(|e| e.message().id).collect();
    assert_eq!(ids, vec![first, second]);
    assert!(dead
        .iter()
        .all(|e| e.reason == DeadLetterReason::SubscriberGone));
    assert_eq!(broker.in_flight(), 0);
    Ok(())
}

/// Тест проверяет, что 10 издателей по 1000 сообщений через ящик на 50
/// мест доставляются без потерь и с сохранением порядка каждого издателя.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishers_no_loss() -> Result<(), Box<dyn std::error::Error>> {
    const PUBLISHERS: usize = 10;
    const PER_PUBLISHER: usize = 1_000;
    const TOTAL: usize = PUBLISHERS * PER_PUBLISHER;

    let broker = Arc::new(Broker::new(
        config().with_enqueue_timeout(Duration::from_secs(5)),
    ));
    let sub = broker.subscribe("load.*", SubscriptionConfig::default().with_mailbox_capacity(50))?;

    let consumer = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            let mut order: HashMap<usize, Vec<usize>> = HashMap::new();
            while seen.len() < TOTAL {
                let d = broker
                    .receive_timeout(sub, Duration::from_secs(30))
                    .await
                    .expect("consumer starved");
                let text = payload_str(d.payload());
                let (p, seq) = text.split_once(':').expect("payload format");
                if seen.insert(d.message().id) {
                    order
                        .entry(p.parse().unwrap())
                        .or_default()
                        .push(seq.parse().unwrap());
                }
                broker.ack(d.token()).unwrap();
            }
            order
        })
    };

    let publishers: Vec<_> = (0..PUBLISHERS)
        .map(|p| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                for seq in 0..PER_PUBLISHER {
                    broker
                        .publish(&format!("load.p{p}"), format!("{p}:{seq}"))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in publishers {
        handle.await?;
    }

    let order = time::timeout(Duration::from_secs(60), consumer).await??;
    assert_eq!(order.values().map(Vec::len).sum::<usize>(), TOTAL);

    let m = broker.metrics();
    assert_eq!(m.published, TOTAL as u64);
    assert_eq!(m.acked, TOTAL as u64);
    assert_eq!(broker.dead_letter_count(), 0);
    assert_eq!(broker.in_flight(), 0);

    if m.retried == 0 {
        for seqs in order.values() {
            assert!(seqs.windows(2).all(|w| w[0] < w[1]), "per-publisher order broken");
        }
    }
    Ok(())
}

/// Тест проверяет изоляцию: медленный подписчик задерживает публикацию
/// не дольше таймаута постановки и не мешает быстрому.
#[tokio::test(start_paused = true)]
async fn test_slow_subscriber_isolation() -> Result<(), Box<dyn std::error::Error>> {
    let broker = Broker::new(config().with_enqueue_timeout(Duration::from_millis(50)));
    let _slow = broker.subscribe("events", SubscriptionConfig::default().with_mailbox_capacity(1))?;
    let fast = broker.subscribe_with_defaults("events")?;

    for i in 0..5 {
        let start = Instant::now();
        broker.publish("events", format!("e{i}")).await?;
        assert!(start.elapsed() <= Duration::from_millis(50), "publish #{i} stalled");

        let d = broker.try_receive(fast)?;
        assert_eq!(payload_str(d.payload()), format!("e{i}"));
        broker.ack(d.token())?;
    }

    let m = broker.metrics();
    assert!(m.enqueue_timeouts >= 4, "{m:?}");
    assert_eq!(m.acked, 5);
    Ok(())
}

/// Тест проверяет идемпотентность ack и ошибку nack после ack.
#[tokio::test(start_paused = true)]
async fn test_double_ack_is_noop() -> Result<(), Box<dyn std::error::Error>> {
    let broker = Broker::new(config());
    let sub = broker.subscribe_with_defaults("jobs")?;
    broker.publish("jobs", "x").await?;

    let d = broker.receive_timeout(sub, Duration::from_secs(1)).await?;
    broker.ack(d.token())?;
    broker.ack(d.token())?;
    assert_eq!(broker.metrics().acked, 1);

    let err = broker.nack(d.token(), "late").unwrap_err();
    assert!(matches!(err, SettleError::AlreadyTerminal { .. }));

    // после ack повторной доставки нет
    time::sleep(Duration::from_secs(60)).await;
    assert_eq!(broker.try_receive(sub).unwrap_err(), TryRecvError::Empty);
    Ok(())
}

/// Тест проверяет, что устаревшая копия в ящике пропускается после
/// повторной постановки по таймауту ack.
#[tokio::test(start_paused = true)]
async fn test_stale_copy_skipped() -> Result<(), Box<dyn std::error::Error>> {
    let broker = Broker::new(config());
    let sub = broker.subscribe("jobs", SubscriptionConfig::new(8, Duration::from_secs(1), 3))?;
    broker.publish("jobs", "x").await?;

    // ack timeout (1s) + backoff (100ms) проходят, пока подписчик молчит
    time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(broker.subscription_info(sub).unwrap().queued, 2);

    let d = broker.receive_timeout(sub, Duration::from_secs(1)).await?;
    assert_eq!(d.attempt(), 2);
    broker.ack(d.token())?;

    let m = broker.metrics();
    assert_eq!(m.stale_skipped, 1);
    assert_eq!(m.ack_timeouts, 1);
    assert_eq!(broker.try_receive(sub).unwrap_err(), TryRecvError::Empty);
    Ok(())
}

/// Тест проверяет повторную постановку dead-letter записи.
#[tokio::test(start_paused = true)]
async fn test_requeue_dead_letter() -> Result<(), Box<dyn std::error::Error>> {
    let broker = Broker::new(config());
    let once = SubscriptionConfig::default().with_max_attempts(1);
    let sub = broker.subscribe("jobs", once.clone())?;
    let gone = broker.subscribe("jobs", once)?;

    broker.publish("jobs", "x").await?;
    for id in [sub, gone] {
        let d = broker.receive_timeout(id, Duration::from_secs(1)).await?;
        broker.nack(d.token(), "poison")?;
    }
    assert_eq!(broker.dead_letter_count(), 0);
    time::sleep(Duration::from_millis(150)).await;
    assert_eq!(broker.dead_letter_count(), 2);

    let entries = broker.peek_dead_letters(10);
    let for_sub = entries.iter().find(|e| e.subscription_id() == sub).unwrap();
    let for_gone = entries.iter().find(|e| e.subscription_id() == gone).unwrap();

    broker.requeue_dead_letter(for_sub.id).await?;
    assert_eq!(broker.dead_letter_count(), 1);
    let d = broker.receive_timeout(sub, Duration::from_secs(1)).await?;
    assert_eq!(d.attempt(), 1);
    assert_eq!(d.message().id, for_sub.message().id);
    broker.ack(d.token())?;
    assert_eq!(
        broker.requeue_dead_letter(for_sub.id).await.unwrap_err(),
        RequeueError::NotFound {
            entry_id: for_sub.id.get()
        }
    );

    broker.unsubscribe(gone);
    assert_eq!(
        broker.requeue_dead_letter(for_gone.id).await.unwrap_err(),
        RequeueError::SubscriberGone {
            subscription_id: gone.get()
        }
    );
    assert_eq!(broker.dead_letter_count(), 1);
    assert_eq!(broker.metrics().requeued, 1);
    Ok(())
}

/// Тест проверяет мягкую остановку: доставка успевает подтвердиться.
#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown() -> Result<(), Box<dyn std::error::Error>> {
    let broker = Arc::new(Broker::new(config()));
    let sub = broker.subscribe_with_defaults("jobs")?;
    broker.publish("jobs", "x").await?;

    let worker = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let d = broker.receive_timeout(sub, Duration::from_secs(1)).await?;
            time::sleep(Duration::from_millis(50)).await;
            broker.ack(d.token())?;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
        })
    };

    let report = broker.shutdown(Duration::from_secs(1)).await;
    assert!(report.graceful);
    assert_eq!(report.in_flight_at_start, 1);
    assert_eq!(report.settled_during_grace, 1);
    assert_eq!(report.forced_dead_letters, 0);
    assert_eq!(broker.dead_letter_count(), 0);
    worker.await?.map_err(|e| e.to_string())?;
    Ok(())
}

/// Тест проверяет, что остановка дожидается публикации, уже начавшей
/// раскладку, и её доставка не теряется мимо dead-letter.
#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_publish_in_progress() -> Result<(), Box<dyn std::error::Error>> {
    let broker = Arc::new(Broker::new(
        config().with_enqueue_timeout(Duration::from_millis(500)),
    ));
    let sub = broker.subscribe("jobs", SubscriptionConfig::default().with_mailbox_capacity(1))?;

    let first = broker.publish("jobs", "first").await?;
    let blocked = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.publish("jobs", "second").await })
    };
    time::sleep(Duration::from_millis(10)).await;
    assert!(!blocked.is_finished());

    let report = broker.shutdown(Duration::ZERO).await;
    assert!(blocked.is_finished(), "shutdown returned before the publish finished");
    let second = blocked.await??;

    assert_eq!(broker.metrics().enqueue_timeouts, 1);
    assert!(!report.graceful);
    assert_eq!(report.in_flight_at_start, 2);
    assert_eq!(report.forced_dead_letters, 2);

    let dead = broker.drain_dead_letters(10);
    let ids: Vec<_> = dead.iter().map(|e| e.message().id).collect();
    assert_eq!(ids, vec![first, second]);
    assert!(dead
        .iter()
        .all(|e| e.reason == DeadLetterReason::BrokerShutdown));
    assert_eq!(broker.in_flight(), 0);
    assert_eq!(
        broker.try_receive(sub).unwrap_err(),
        TryRecvError::SubscriptionClosed
    );
    Ok(())
}

/// Тест проверяет, что каждая принятая во время гонки с остановкой
/// публикация оказывается в dead-letter, а трекер остаётся пустым.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_publish_racing_shutdown_leaves_nothing_in_flight(
) -> Result<(), Box<dyn std::error::Error>> {
    const PUBLISHERS: usize = 4;

    for _ in 0..50 {
        let broker = Arc::new(Broker::new(config()));
        broker.subscribe_with_defaults("race")?;

        let publishers: Vec<_> = (0..PUBLISHERS)
            .map(|_| {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    let mut accepted = 0usize;
                    while broker.publish("race", "x").await.is_ok() {
                        accepted += 1;
                    }
                    accepted
                })
            })
            .collect();
        tokio::task::yield_now().await;

        let report = broker.shutdown(Duration::ZERO).await;
        let mut accepted = 0;
        for handle in publishers {
            accepted += handle.await?;
        }

        assert_eq!(broker.in_flight(), 0);
        assert_eq!(report.forced_dead_letters, accepted);
        assert_eq!(broker.dead_letter_count(), accepted);
    }
    Ok(())
}

/// Тест проверяет восстановление dead-letter записей из внешнего
/// хранилища новым экземпляром брокера.
#[tokio::test(start_paused = true)]
async fn test_dead_letters_survive_restart() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(InMemoryDeadLetterStore::new());

    let (old_sub, old_msg) = {
        let broker = Broker::with_store(config(), store.clone())?;
        let sub = broker.subscribe("jobs", SubscriptionConfig::default().with_max_attempts(1))?;
        let msg = broker.publish("jobs", "x").await?;
        let d = broker.receive_timeout(sub, Duration::from_secs(1)).await?;
        broker.nack(d.token(), "poison")?;
        time::sleep(Duration::from_millis(150)).await;
        broker.shutdown(Duration::from_millis(10)).await;
        (sub, msg)
    };
    assert_eq!(store.len(), 1);
    assert_eq!(store.scan()?.len(), 1);

    let broker = Broker::with_store(config(), store.clone())?;
    assert_eq!(broker.dead_letter_count(), 1);
    let entry = broker.peek_dead_letters(1).remove(0);
    assert_eq!(entry.reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(entry.message().id, old_msg);

    let new_sub = broker.subscribe_with_defaults("jobs")?;
    assert!(new_sub > old_sub);
    assert!(broker.publish("jobs", "y").await? > old_msg);
    assert!(matches!(
        broker.requeue_dead_letter(entry.id).await,
        Err(RequeueError::SubscriberGone { .. })
    ));

    broker.drain_dead_letters(10);
    assert!(store.is_empty());
    Ok(())
}
