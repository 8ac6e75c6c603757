mod common;

use common::{start_http_server, Args};
use geerpc::server::DEFAULT_DEBUG_PATH;
use geerpc::{Client, Options};

#[tokio::test]
async fn dial_http_upgrades_and_serves_calls() {
    let (_server, addr) = start_http_server().await;
    let client = Client::dial_http(&addr.to_string(), Options::default())
        .await
        .unwrap();

    let reply: i32 = client
        .call("Foo.Sum", Args { num1: 8, num2: 9 })
        .await
        .unwrap();
    assert_eq!(reply, 17);
}

#[tokio::test]
async fn sdial_routes_by_protocol() {
    let (_server, addr) = start_http_server().await;
    let client = Client::sdial(&format!("http@{}", addr), Options::default())
        .await
        .unwrap();

    let reply: i32 = client
        .call("Foo.Sum", Args { num1: 1, num2: 1 })
        .await
        .unwrap();
    assert_eq!(reply, 2);
}

#[tokio::test]
async fn debug_page_reports_call_counts() {
    let (_server, addr) = start_http_server().await;
    let client = Client::dial_http(&addr.to_string(), Options::default())
        .await
        .unwrap();
    let _: i32 = client
        .call("Foo.Sum", Args { num1: 1, num2: 2 })
        .await
        .unwrap();

    let body = reqwest::get(format!("http://{}{}", addr, DEFAULT_DEBUG_PATH))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("Foo.Sum: 1"), "unexpected debug page: {body:?}");
    assert!(body.contains("Foo.Sleep: 0"));
}

#[tokio::test]
async fn non_connect_request_is_rejected() {
    let (_server, addr) = start_http_server().await;

    let response = reqwest::get(format!("http://{}/elsewhere", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
}
