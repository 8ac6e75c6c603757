#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use geerpc::{Error, Server, Service};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Args {
    pub num1: i32,
    pub num2: i32,
}

/// The canonical test service: a fast method, a slow one and a failing one.
pub fn foo_service() -> Service {
    Service::builder("Foo")
        .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
        .method("Sleep", |args: Args| async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(args.num1 + args.num2)
        })
        .method("Fail", |_args: Args| async move {
            Err::<i32, _>(Error::Service("rpc server: Foo.Fail always fails".into()))
        })
        .build()
}

/// Foo service whose `Sum` also bumps a per-server counter, for asserting
/// how a load balancer spread its calls.
pub fn counting_foo_service(count: Arc<AtomicUsize>) -> Service {
    Service::builder("Foo")
        .method("Sum", move |args: Args| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(args.num1 + args.num2)
            }
        })
        .build()
}

pub async fn start_server_with(service: Service) -> (Server, SocketAddr) {
    let _ = env_logger::builder().is_test(true).try_init();

    let server = Server::new();
    server.register(service).expect("register");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let accepting = server.clone();
    tokio::spawn(async move {
        let _ = accepting.accept(listener).await;
    });
    (server, addr)
}

pub async fn start_server() -> (Server, SocketAddr) {
    start_server_with(foo_service()).await
}

pub async fn start_http_server() -> (Server, SocketAddr) {
    let _ = env_logger::builder().is_test(true).try_init();

    let server = Server::new();
    server.register(foo_service()).expect("register");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let accepting = server.clone();
    tokio::spawn(async move {
        let _ = accepting.accept_http(listener).await;
    });
    (server, addr)
}
