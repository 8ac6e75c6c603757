mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{counting_foo_service, start_server_with, Args};
use geerpc::xclient::{MultiServersDiscovery, SelectMode, XClient};
use geerpc::{Error, Options, Service};

#[tokio::test]
async fn round_robin_spreads_calls_evenly() {
    let c1 = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::new(AtomicUsize::new(0));
    let c3 = Arc::new(AtomicUsize::new(0));
    let (_s1, a1) = start_server_with(counting_foo_service(Arc::clone(&c1))).await;
    let (_s2, a2) = start_server_with(counting_foo_service(Arc::clone(&c2))).await;
    let (_s3, a3) = start_server_with(counting_foo_service(Arc::clone(&c3))).await;

    let discovery = MultiServersDiscovery::new(vec![
        format!("tcp@{}", a1),
        format!("tcp@{}", a2),
        format!("tcp@{}", a3),
    ]);
    let xclient = XClient::new(discovery, SelectMode::RoundRobinSelect, Options::default());

    for i in 0..6i32 {
        let reply: i32 = xclient
            .call("Foo.Sum", Args { num1: i, num2: i * i })
            .await
            .unwrap();
        assert_eq!(reply, i + i * i);
    }

    assert_eq!(c1.load(Ordering::SeqCst), 2);
    assert_eq!(c2.load(Ordering::SeqCst), 2);
    assert_eq!(c3.load(Ordering::SeqCst), 2);
    xclient.close().await;
}

#[tokio::test]
async fn random_select_serves_from_the_fleet() {
    let c1 = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::new(AtomicUsize::new(0));
    let (_s1, a1) = start_server_with(counting_foo_service(Arc::clone(&c1))).await;
    let (_s2, a2) = start_server_with(counting_foo_service(Arc::clone(&c2))).await;

    let discovery =
        MultiServersDiscovery::new(vec![format!("tcp@{}", a1), format!("tcp@{}", a2)]);
    let xclient = XClient::new(discovery, SelectMode::RandomSelect, Options::default());

    for _ in 0..10 {
        let reply: i32 = xclient
            .call("Foo.Sum", Args { num1: 3, num2: 4 })
            .await
            .unwrap();
        assert_eq!(reply, 7);
    }
    assert_eq!(c1.load(Ordering::SeqCst) + c2.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn broadcast_returns_a_reply_from_the_fleet() {
    let c1 = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::new(AtomicUsize::new(0));
    let (_s1, a1) = start_server_with(counting_foo_service(Arc::clone(&c1))).await;
    let (_s2, a2) = start_server_with(counting_foo_service(Arc::clone(&c2))).await;

    let discovery =
        MultiServersDiscovery::new(vec![format!("tcp@{}", a1), format!("tcp@{}", a2)]);
    let xclient = XClient::new(discovery, SelectMode::RandomSelect, Options::default());

    let reply: Option<i32> = xclient
        .broadcast("Foo.Sum", Args { num1: 20, num2: 22 })
        .await
        .unwrap();
    assert_eq!(reply, Some(42));
    assert_eq!(c1.load(Ordering::SeqCst), 1);
    assert_eq!(c2.load(Ordering::SeqCst), 1);
}

fn failing_bar_service() -> Service {
    Service::builder("Bar")
        .method("Op", |_args: Args| async move {
            Err::<i32, _>(Error::Service("bar op refused".into()))
        })
        .build()
}

fn slow_bar_service() -> Service {
    Service::builder("Bar")
        .method("Op", |args: Args| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(args.num1 + args.num2)
        })
        .build()
}

#[tokio::test]
async fn broadcast_returns_first_error_and_cancels_the_rest() {
    let (_s1, fail_addr) = start_server_with(failing_bar_service()).await;
    let (_s2, slow_addr) = start_server_with(slow_bar_service()).await;

    let discovery = MultiServersDiscovery::new(vec![
        format!("tcp@{}", fail_addr),
        format!("tcp@{}", slow_addr),
    ]);
    let xclient = XClient::new(discovery, SelectMode::RandomSelect, Options::default());

    let started = Instant::now();
    let err = xclient
        .broadcast::<_, i32>("Bar.Op", Args { num1: 1, num2: 2 })
        .await
        .unwrap_err();

    assert!(err.to_string().contains("bar op refused"));
    // the slow call was cancelled rather than awaited to completion
    assert!(started.elapsed() < Duration::from_secs(2));
}
